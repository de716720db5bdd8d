//! # Sync Repositories
//!
//! Cursor and job stores behind the sync orchestrator. Both tables are unique
//! on `(connection_id, resource_type, resource_id)`; rows are reused across
//! runs.

use std::collections::BTreeMap;
use std::sync::Arc;

use sea_orm::prelude::DateTimeWithTimeZone;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, IntoActiveModel, QueryFilter,
    QueryOrder, QuerySelect, Set,
};
use serde_json::Value as JsonValue;

use super::{StatusCount, status_map};
use crate::error::{ServiceError, ServiceResult};
use crate::models::status::SyncJobStatus;
use crate::models::{new_id, now, sync_cursor, sync_job};

/// Identifies one synced resource of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncTarget {
    pub connection_id: String,
    pub provider_id: String,
    pub resource_type: String,
    pub resource_id: String,
}

#[derive(Debug, Clone)]
pub struct SyncCursorRepository {
    pub db: Arc<DatabaseConnection>,
}

impl SyncCursorRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    pub async fn get(&self, target: &SyncTarget) -> ServiceResult<Option<sync_cursor::Model>> {
        Ok(sync_cursor::Entity::find()
            .filter(sync_cursor::Column::ConnectionId.eq(target.connection_id.as_str()))
            .filter(sync_cursor::Column::ResourceType.eq(target.resource_type.as_str()))
            .filter(sync_cursor::Column::ResourceId.eq(target.resource_id.as_str()))
            .one(&*self.db)
            .await?)
    }

    /// Store the cursor reached by a successful run.
    pub async fn advance(
        &self,
        target: &SyncTarget,
        cursor: Option<String>,
        metadata: JsonValue,
    ) -> ServiceResult<sync_cursor::Model> {
        let now = now();
        match self.get(target).await? {
            Some(row) => {
                let mut active = row.into_active_model();
                active.cursor = Set(cursor);
                active.status = Set("idle".to_string());
                active.last_synced_at = Set(Some(now));
                active.metadata = Set(metadata);
                active.updated_at = Set(now);
                Ok(active.update(&*self.db).await?)
            }
            None => {
                let active = sync_cursor::ActiveModel {
                    id: Set(new_id("cur")),
                    connection_id: Set(target.connection_id.clone()),
                    resource_type: Set(target.resource_type.clone()),
                    resource_id: Set(target.resource_id.clone()),
                    cursor: Set(cursor),
                    status: Set("idle".to_string()),
                    last_synced_at: Set(Some(now)),
                    metadata: Set(metadata),
                    updated_at: Set(now),
                };
                Ok(active.insert(&*self.db).await?)
            }
        }
    }
}

/// Repository for sync job database operations
#[derive(Debug, Clone)]
pub struct SyncJobRepository {
    pub db: Arc<DatabaseConnection>,
}

impl SyncJobRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    pub async fn find(&self, target: &SyncTarget) -> ServiceResult<Option<sync_job::Model>> {
        Ok(sync_job::Entity::find()
            .filter(sync_job::Column::ConnectionId.eq(target.connection_id.as_str()))
            .filter(sync_job::Column::ResourceType.eq(target.resource_type.as_str()))
            .filter(sync_job::Column::ResourceId.eq(target.resource_id.as_str()))
            .one(&*self.db)
            .await?)
    }

    /// Jobs of every resource of the connection, most recently touched first.
    pub async fn for_connection(&self, connection_id: &str) -> ServiceResult<Vec<sync_job::Model>> {
        Ok(sync_job::Entity::find()
            .filter(sync_job::Column::ConnectionId.eq(connection_id))
            .order_by_desc(sync_job::Column::UpdatedAt)
            .all(&*self.db)
            .await?)
    }

    /// Create or reuse the job for `target` and mark it running. `restart`
    /// counts attempts from one again.
    pub async fn start(
        &self,
        target: &SyncTarget,
        mode: &str,
        metadata: JsonValue,
        restart: bool,
    ) -> ServiceResult<sync_job::Model> {
        let now = now();
        match self.find(target).await? {
            Some(row) => {
                let attempts = row.attempts;
                let mut active = row.into_active_model();
                active.mode = Set(mode.to_string());
                active.status = Set(SyncJobStatus::Running.as_str().to_string());
                active.attempts = Set(if restart { 1 } else { attempts + 1 });
                active.metadata = Set(metadata);
                active.updated_at = Set(now);
                Ok(active.update(&*self.db).await?)
            }
            None => {
                let active = sync_job::ActiveModel {
                    id: Set(new_id("sjob")),
                    connection_id: Set(target.connection_id.clone()),
                    provider_id: Set(target.provider_id.clone()),
                    resource_type: Set(target.resource_type.clone()),
                    resource_id: Set(target.resource_id.clone()),
                    mode: Set(mode.to_string()),
                    checkpoint: Set(None),
                    status: Set(SyncJobStatus::Running.as_str().to_string()),
                    attempts: Set(1),
                    next_attempt_at: Set(None),
                    last_error: Set(None),
                    metadata: Set(metadata),
                    created_at: Set(now),
                    updated_at: Set(now),
                };
                Ok(active.insert(&*self.db).await?)
            }
        }
    }

    /// Record a successful run. Attempts reset so the next failure backs off from the start.
    pub async fn succeed(&self, id: &str, checkpoint: Option<String>) -> ServiceResult<sync_job::Model> {
        let row = self.require(id).await?;
        let mut active = row.into_active_model();
        active.status = Set(SyncJobStatus::Succeeded.as_str().to_string());
        active.checkpoint = Set(checkpoint);
        active.attempts = Set(0);
        active.next_attempt_at = Set(None);
        active.last_error = Set(None);
        active.updated_at = Set(now());
        Ok(active.update(&*self.db).await?)
    }

    /// Record a failed run; `None` for `next_attempt_at` leaves the job terminal.
    pub async fn fail(
        &self,
        id: &str,
        error: &str,
        next_attempt_at: Option<DateTimeWithTimeZone>,
    ) -> ServiceResult<sync_job::Model> {
        let row = self.require(id).await?;
        let mut active = row.into_active_model();
        active.status = Set(SyncJobStatus::Failed.as_str().to_string());
        active.next_attempt_at = Set(next_attempt_at);
        active.last_error = Set(Some(error.to_string()));
        active.updated_at = Set(now());
        Ok(active.update(&*self.db).await?)
    }

    async fn require(&self, id: &str) -> ServiceResult<sync_job::Model> {
        sync_job::Entity::find_by_id(id.to_string())
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::not_found(format!("sync job {} not found", id)))
    }

    pub async fn status_counts(&self) -> ServiceResult<BTreeMap<String, u64>> {
        let rows = sync_job::Entity::find()
            .select_only()
            .column(sync_job::Column::Status)
            .column_as(Expr::col(sync_job::Column::Id).count(), "count")
            .group_by(sync_job::Column::Status)
            .into_model::<StatusCount>()
            .all(&*self.db)
            .await?;
        Ok(status_map(rows))
    }
}
