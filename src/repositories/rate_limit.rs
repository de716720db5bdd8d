//! Rate-limit state repository

use std::sync::Arc;

use sea_orm::prelude::DateTimeWithTimeZone;
use sea_orm::sea_query::OnConflict;
use sea_orm::{
    ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, QuerySelect, Set,
};
use serde_json::Value as JsonValue;

use super::RecordFilter;
use crate::error::ServiceResult;
use crate::models::rate_limit_state::{self, Column, Entity as RateLimitState};
use crate::models::{new_id, now};
use crate::scope::ScopeRef;

/// Observed provider limits for one `(provider, scope, bucket)`.
#[derive(Debug, Clone)]
pub struct RateLimitObservation {
    pub provider_id: String,
    pub scope: ScopeRef,
    pub bucket_key: String,
    pub limit: i32,
    pub remaining: i32,
    pub reset_at: Option<DateTimeWithTimeZone>,
    pub retry_after: i64,
    pub metadata: JsonValue,
}

#[derive(Debug, Clone)]
pub struct RateLimitRepository {
    pub db: Arc<DatabaseConnection>,
}

impl RateLimitRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Insert or overwrite the state row for the observation's bucket.
    pub async fn upsert(&self, observation: RateLimitObservation) -> ServiceResult<()> {
        let row = rate_limit_state::ActiveModel {
            id: Set(new_id("rl")),
            provider_id: Set(observation.provider_id),
            scope_type: Set(observation.scope.scope_type.as_str().to_string()),
            scope_id: Set(observation.scope.id),
            bucket_key: Set(observation.bucket_key),
            limit: Set(observation.limit),
            remaining: Set(observation.remaining),
            reset_at: Set(observation.reset_at),
            retry_after: Set(observation.retry_after),
            metadata: Set(observation.metadata),
            updated_at: Set(now()),
        };

        RateLimitState::insert(row)
            .on_conflict(
                OnConflict::columns([
                    Column::ProviderId,
                    Column::ScopeType,
                    Column::ScopeId,
                    Column::BucketKey,
                ])
                .update_columns([
                    Column::Limit,
                    Column::Remaining,
                    Column::ResetAt,
                    Column::RetryAfter,
                    Column::Metadata,
                    Column::UpdatedAt,
                ])
                .to_owned(),
            )
            .exec_without_returning(&*self.db)
            .await?;
        Ok(())
    }

    pub async fn list(
        &self,
        filter: &RecordFilter,
        limit: u64,
    ) -> ServiceResult<Vec<rate_limit_state::Model>> {
        let mut query = RateLimitState::find();
        if let Some(provider_id) = &filter.provider_id {
            query = query.filter(Column::ProviderId.eq(provider_id.as_str()));
        }
        if let Some(scope_type) = &filter.scope_type {
            query = query.filter(Column::ScopeType.eq(scope_type.as_str()));
        }
        if let Some(scope_id) = &filter.scope_id {
            query = query.filter(Column::ScopeId.eq(scope_id.as_str()));
        }
        Ok(query
            .order_by_desc(Column::UpdatedAt)
            .order_by_asc(Column::Id)
            .limit(limit)
            .all(&*self.db)
            .await?)
    }
}
