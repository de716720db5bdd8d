//! Subscription repository

use std::sync::Arc;

use sea_orm::prelude::DateTimeWithTimeZone;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait,
    IntoActiveModel, PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, Set,
};
use serde_json::Value as JsonValue;

use super::RecordFilter;
use crate::error::{ServiceError, ServiceResult};
use crate::models::status::SubscriptionStatus;
use crate::models::subscription::{self, Column, Entity as Subscription};
use crate::models::{new_id, now};

/// Fields of a subscription supplied by the caller.
#[derive(Debug, Clone)]
pub struct SubscriptionDraft {
    pub connection_id: String,
    pub provider_id: String,
    pub resource_type: String,
    pub resource_id: String,
    pub channel_id: String,
    pub remote_subscription_id: Option<String>,
    pub callback_url: String,
    pub expires_at: Option<DateTimeWithTimeZone>,
    pub metadata: JsonValue,
}

#[derive(Debug, Clone)]
pub struct SubscriptionRepository {
    pub db: Arc<DatabaseConnection>,
}

impl SubscriptionRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    pub async fn get(&self, id: &str) -> ServiceResult<Option<subscription::Model>> {
        Ok(Subscription::find_by_id(id.to_string())
            .one(&*self.db)
            .await?)
    }

    pub async fn require(&self, id: &str) -> ServiceResult<subscription::Model> {
        self.get(id)
            .await?
            .ok_or_else(|| ServiceError::not_found(format!("subscription {} not found", id)))
    }

    /// Insert or refresh the subscription for `(connection, resource, channel)`.
    pub async fn upsert<C: ConnectionTrait>(
        db: &C,
        draft: SubscriptionDraft,
    ) -> ServiceResult<subscription::Model> {
        let now = now();
        let existing = Subscription::find()
            .filter(Column::ConnectionId.eq(draft.connection_id.as_str()))
            .filter(Column::ResourceType.eq(draft.resource_type.as_str()))
            .filter(Column::ResourceId.eq(draft.resource_id.as_str()))
            .filter(Column::ChannelId.eq(draft.channel_id.as_str()))
            .one(db)
            .await?;

        match existing {
            Some(row) => {
                let mut active = row.into_active_model();
                active.remote_subscription_id = Set(draft.remote_subscription_id);
                active.callback_url = Set(draft.callback_url);
                active.status = Set(SubscriptionStatus::Active.as_str().to_string());
                active.expires_at = Set(draft.expires_at);
                active.metadata = Set(draft.metadata);
                active.updated_at = Set(now);
                Ok(active.update(db).await?)
            }
            None => {
                let active = subscription::ActiveModel {
                    id: Set(new_id("sub")),
                    connection_id: Set(draft.connection_id),
                    provider_id: Set(draft.provider_id),
                    resource_type: Set(draft.resource_type),
                    resource_id: Set(draft.resource_id),
                    channel_id: Set(draft.channel_id),
                    remote_subscription_id: Set(draft.remote_subscription_id),
                    callback_url: Set(draft.callback_url),
                    status: Set(SubscriptionStatus::Active.as_str().to_string()),
                    expires_at: Set(draft.expires_at),
                    last_notified_at: Set(None),
                    metadata: Set(draft.metadata),
                    created_at: Set(now),
                    updated_at: Set(now),
                };
                Ok(active.insert(db).await?)
            }
        }
    }

    /// Move a subscription to `status`, optionally extending its expiry.
    pub async fn set_status<C: ConnectionTrait>(
        db: &C,
        row: subscription::Model,
        status: SubscriptionStatus,
        expires_at: Option<DateTimeWithTimeZone>,
    ) -> ServiceResult<subscription::Model> {
        let mut active = row.into_active_model();
        active.status = Set(status.as_str().to_string());
        if expires_at.is_some() {
            active.expires_at = Set(expires_at);
        }
        active.updated_at = Set(now());
        Ok(active.update(db).await?)
    }

    pub async fn list(
        &self,
        filter: &RecordFilter,
        limit: u64,
        offset: u64,
    ) -> ServiceResult<(Vec<subscription::Model>, u64)> {
        let mut query = Subscription::find();
        if let Some(provider_id) = &filter.provider_id {
            query = query.filter(Column::ProviderId.eq(provider_id.as_str()));
        }
        if let Some(connection_id) = &filter.connection_id {
            query = query.filter(Column::ConnectionId.eq(connection_id.as_str()));
        }
        if let Some(status) = &filter.status {
            query = query.filter(Column::Status.eq(status.as_str()));
        }

        let total = query.clone().count(&*self.db).await?;
        let rows = query
            .order_by_asc(Column::CreatedAt)
            .order_by_asc(Column::Id)
            .offset(offset)
            .limit(limit)
            .all(&*self.db)
            .await?;
        Ok((rows, total))
    }
}
