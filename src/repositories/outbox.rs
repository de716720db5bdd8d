//! Lifecycle outbox store over `service_lifecycle_outbox`.
//!
//! Claims are two-step: select due candidates, then move each with a
//! conditional update keyed on its observed `(status, attempts)`. A row two
//! dispatchers race for is claimed by exactly one of them.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, ConnectionTrait, DatabaseConnection, EntityTrait,
    QueryFilter, QueryOrder, QuerySelect, Set,
};

use super::{StatusCount, status_map};
use crate::error::{ServiceError, ServiceResult};
use crate::lifecycle::{LifecycleEvent, OutboxStore};
use crate::models::lifecycle_outbox::{self, Column, Entity as LifecycleOutbox};
use crate::models::status::OutboxStatus;
use crate::models::{from_db_time, new_id, to_db_time};
use crate::scope::ScopeRef;

#[derive(Debug, Clone)]
pub struct OutboxRepository {
    pub db: Arc<DatabaseConnection>,
}

impl OutboxRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Insert `event` as `pending` on `db`, which may be an open transaction.
    pub async fn insert<C: ConnectionTrait>(db: &C, event: &LifecycleEvent) -> ServiceResult<String> {
        let id = new_id("obx");
        let occurred_at = to_db_time(event.occurred_at);
        let active = lifecycle_outbox::ActiveModel {
            id: Set(id.clone()),
            event_id: Set(event.event_id.clone()),
            event_name: Set(event.event_name.clone()),
            provider_id: Set(event.provider_id.clone()),
            scope_type: Set(event.scope.scope_type.as_str().to_string()),
            scope_id: Set(event.scope.id.clone()),
            connection_id: Set(event.connection_id.clone()),
            payload: Set(event.payload.clone()),
            metadata: Set(event.metadata.clone()),
            status: Set(OutboxStatus::Pending.as_str().to_string()),
            attempts: Set(0),
            next_attempt_at: Set(Some(occurred_at)),
            last_error: Set(None),
            occurred_at: Set(occurred_at),
            updated_at: Set(occurred_at),
        };
        active.insert(db).await?;
        Ok(id)
    }

    pub async fn get(&self, id: &str) -> ServiceResult<Option<lifecycle_outbox::Model>> {
        Ok(LifecycleOutbox::find_by_id(id.to_string())
            .one(&*self.db)
            .await?)
    }

    pub async fn find_by_event_id(
        &self,
        event_id: &str,
    ) -> ServiceResult<Vec<lifecycle_outbox::Model>> {
        Ok(LifecycleOutbox::find()
            .filter(Column::EventId.eq(event_id))
            .order_by_asc(Column::OccurredAt)
            .all(&*self.db)
            .await?)
    }
}

fn to_event(model: lifecycle_outbox::Model) -> ServiceResult<LifecycleEvent> {
    Ok(LifecycleEvent {
        scope: ScopeRef::from_columns(&model.scope_type, &model.scope_id)?,
        id: model.id,
        event_id: model.event_id,
        event_name: model.event_name,
        provider_id: model.provider_id,
        connection_id: model.connection_id,
        payload: model.payload,
        metadata: model.metadata,
        occurred_at: from_db_time(model.occurred_at),
        attempts: u32::try_from(model.attempts).unwrap_or_default(),
    })
}

#[async_trait]
impl OutboxStore for OutboxRepository {
    async fn enqueue(&self, event: &LifecycleEvent) -> ServiceResult<String> {
        Self::insert(&*self.db, event).await
    }

    async fn claim_batch(
        &self,
        limit: u64,
        now: DateTime<Utc>,
        lease: Duration,
        max_attempts: u32,
    ) -> ServiceResult<Vec<LifecycleEvent>> {
        let now_db = to_db_time(now);
        let lease_until = chrono::Duration::from_std(lease)
            .ok()
            .and_then(|lease| now.checked_add_signed(lease))
            .map(to_db_time)
            .ok_or_else(|| ServiceError::internal("invalid outbox lease"))?;

        let due = Condition::any()
            .add(Column::NextAttemptAt.is_null())
            .add(Column::NextAttemptAt.lte(now_db));
        let candidates = LifecycleOutbox::find()
            .filter(Column::Status.is_in([
                OutboxStatus::Pending.as_str(),
                OutboxStatus::Failed.as_str(),
                OutboxStatus::Processing.as_str(),
            ]))
            .filter(due)
            .order_by_asc(Column::NextAttemptAt)
            .order_by_asc(Column::OccurredAt)
            .limit(limit)
            .all(&*self.db)
            .await?;

        let max_attempts = i32::try_from(max_attempts).unwrap_or(i32::MAX);
        let mut claimed = Vec::with_capacity(candidates.len());
        for row in candidates {
            if row.attempts >= max_attempts {
                let result = LifecycleOutbox::update_many()
                    .col_expr(Column::Status, Expr::value(OutboxStatus::Dead.as_str()))
                    .col_expr(
                        Column::NextAttemptAt,
                        Expr::value(Option::<sea_orm::prelude::DateTimeWithTimeZone>::None),
                    )
                    .col_expr(
                        Column::LastError,
                        Expr::value(Some(format!(
                            "abandoned after {} attempts; last lease expired",
                            row.attempts
                        ))),
                    )
                    .col_expr(Column::UpdatedAt, Expr::value(now_db))
                    .filter(Column::Id.eq(row.id.as_str()))
                    .filter(Column::Status.eq(row.status.as_str()))
                    .filter(Column::Attempts.eq(row.attempts))
                    .exec(&*self.db)
                    .await?;
                if result.rows_affected == 1 {
                    tracing::error!(
                        event_id = %row.event_id,
                        attempts = row.attempts,
                        "Outbox event exhausted its attempts"
                    );
                }
                continue;
            }
            let result = LifecycleOutbox::update_many()
                .col_expr(Column::Status, Expr::value(OutboxStatus::Processing.as_str()))
                .col_expr(Column::Attempts, Expr::col(Column::Attempts).add(1))
                .col_expr(Column::NextAttemptAt, Expr::value(Some(lease_until)))
                .col_expr(Column::UpdatedAt, Expr::value(now_db))
                .filter(Column::Id.eq(row.id.as_str()))
                .filter(Column::Status.eq(row.status.as_str()))
                .filter(Column::Attempts.eq(row.attempts))
                .exec(&*self.db)
                .await?;
            if result.rows_affected == 1 {
                let mut event = to_event(row)?;
                event.attempts += 1;
                claimed.push(event);
            }
        }
        Ok(claimed)
    }

    async fn mark_delivered(&self, id: &str, now: DateTime<Utc>) -> ServiceResult<()> {
        LifecycleOutbox::update_many()
            .col_expr(Column::Status, Expr::value(OutboxStatus::Delivered.as_str()))
            .col_expr(
                Column::NextAttemptAt,
                Expr::value(Option::<sea_orm::prelude::DateTimeWithTimeZone>::None),
            )
            .col_expr(Column::LastError, Expr::value(Option::<String>::None))
            .col_expr(Column::UpdatedAt, Expr::value(to_db_time(now)))
            .filter(Column::Id.eq(id))
            .exec(&*self.db)
            .await?;
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: &str,
        error: &str,
        next_attempt_at: DateTime<Utc>,
        dead: bool,
        now: DateTime<Utc>,
    ) -> ServiceResult<()> {
        let status = if dead {
            OutboxStatus::Dead
        } else {
            OutboxStatus::Failed
        };
        let next_attempt_at = (!dead).then(|| to_db_time(next_attempt_at));
        LifecycleOutbox::update_many()
            .col_expr(Column::Status, Expr::value(status.as_str()))
            .col_expr(Column::NextAttemptAt, Expr::value(next_attempt_at))
            .col_expr(Column::LastError, Expr::value(Some(error.to_string())))
            .col_expr(Column::UpdatedAt, Expr::value(to_db_time(now)))
            .filter(Column::Id.eq(id))
            .exec(&*self.db)
            .await?;
        Ok(())
    }

    async fn status_counts(&self) -> ServiceResult<BTreeMap<String, u64>> {
        let rows = LifecycleOutbox::find()
            .select_only()
            .column(Column::Status)
            .column_as(Expr::col(Column::Id).count(), "count")
            .group_by(Column::Status)
            .into_model::<StatusCount>()
            .all(&*self.db)
            .await?;
        Ok(status_map(rows))
    }
}
