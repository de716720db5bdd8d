//! Durable activity sink over `service_activity_entries`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::sea_query::OnConflict;
use sea_orm::{
    ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter, QueryOrder,
    QuerySelect, Set,
};

use crate::error::ServiceResult;
use crate::lifecycle::activity::{ActivityEntry, ActivityFilter, ActivitySink, RetentionPolicy};
use crate::models::activity_entry::{self, Column, Entity as ActivityEntryEntity};
use crate::models::{from_db_time, to_db_time};

#[derive(Debug, Clone)]
pub struct ActivityRepository {
    pub db: Arc<DatabaseConnection>,
}

impl ActivityRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    pub async fn count(&self) -> ServiceResult<u64> {
        Ok(ActivityEntryEntity::find().count(&*self.db).await?)
    }
}

impl From<activity_entry::Model> for ActivityEntry {
    fn from(model: activity_entry::Model) -> Self {
        Self {
            id: model.id,
            provider_id: model.provider_id,
            scope_type: model.scope_type,
            scope_id: model.scope_id,
            connection_id: model.connection_id,
            channel: model.channel,
            action: model.action,
            object_type: model.object_type,
            object_id: model.object_id,
            actor: model.actor,
            actor_type: model.actor_type,
            status: model.status,
            metadata: model.metadata,
            created_at: from_db_time(model.created_at),
        }
    }
}

#[async_trait]
impl ActivitySink for ActivityRepository {
    async fn record(&self, entry: &ActivityEntry) -> ServiceResult<()> {
        let active = activity_entry::ActiveModel {
            id: Set(entry.id.clone()),
            provider_id: Set(entry.provider_id.clone()),
            scope_type: Set(entry.scope_type.clone()),
            scope_id: Set(entry.scope_id.clone()),
            connection_id: Set(entry.connection_id.clone()),
            channel: Set(entry.channel.clone()),
            action: Set(entry.action.clone()),
            object_type: Set(entry.object_type.clone()),
            object_id: Set(entry.object_id.clone()),
            actor: Set(entry.actor.clone()),
            actor_type: Set(entry.actor_type.clone()),
            status: Set(entry.status.clone()),
            metadata: Set(entry.metadata.clone()),
            created_at: Set(to_db_time(entry.created_at)),
        };
        // Entry ids derive from event ids; a redelivered event is a no-op.
        ActivityEntryEntity::insert(active)
            .on_conflict(OnConflict::column(Column::Id).do_nothing().to_owned())
            .exec_without_returning(&*self.db)
            .await?;
        Ok(())
    }

    async fn list(
        &self,
        filter: &ActivityFilter,
        limit: u64,
        offset: u64,
    ) -> ServiceResult<(Vec<ActivityEntry>, u64)> {
        let mut query = ActivityEntryEntity::find();
        if let Some(provider_id) = &filter.provider_id {
            query = query.filter(Column::ProviderId.eq(provider_id.as_str()));
        }
        if let Some(scope_type) = &filter.scope_type {
            query = query.filter(Column::ScopeType.eq(scope_type.as_str()));
        }
        if let Some(scope_id) = &filter.scope_id {
            query = query.filter(Column::ScopeId.eq(scope_id.as_str()));
        }
        if let Some(connection_id) = &filter.connection_id {
            query = query.filter(Column::ConnectionId.eq(connection_id.as_str()));
        }
        if let Some(action) = &filter.action {
            query = query.filter(Column::Action.eq(action.as_str()));
        }
        if let Some(status) = &filter.status {
            query = query.filter(Column::Status.eq(status.as_str()));
        }

        let total = query.clone().count(&*self.db).await?;
        let rows = query
            .order_by_desc(Column::CreatedAt)
            .order_by_desc(Column::Id)
            .offset(offset)
            .limit(limit)
            .all(&*self.db)
            .await?;
        Ok((rows.into_iter().map(ActivityEntry::from).collect(), total))
    }

    async fn enforce_retention(
        &self,
        policy: RetentionPolicy,
        now: DateTime<Utc>,
    ) -> ServiceResult<u64> {
        let mut deleted = 0;

        if let Some(cutoff) = chrono::Duration::from_std(policy.ttl)
            .ok()
            .and_then(|ttl| now.checked_sub_signed(ttl))
        {
            deleted += ActivityEntryEntity::delete_many()
                .filter(Column::CreatedAt.lt(to_db_time(cutoff)))
                .exec(&*self.db)
                .await?
                .rows_affected;
        }

        let remaining = ActivityEntryEntity::find().count(&*self.db).await?;
        if remaining > policy.row_cap {
            let overflow: Vec<String> = ActivityEntryEntity::find()
                .select_only()
                .column(Column::Id)
                .order_by_asc(Column::CreatedAt)
                .order_by_asc(Column::Id)
                .limit(remaining - policy.row_cap)
                .into_tuple()
                .all(&*self.db)
                .await?;
            deleted += ActivityEntryEntity::delete_many()
                .filter(Column::Id.is_in(overflow))
                .exec(&*self.db)
                .await?
                .rows_affected;
        }

        if deleted > 0 {
            tracing::info!(deleted, "Activity retention removed entries");
        }
        Ok(deleted)
    }
}
