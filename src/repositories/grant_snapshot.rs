//! Grant snapshot repository

use std::sync::Arc;

use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, Set,
};
use serde_json::{Value as JsonValue, json};

use crate::error::ServiceResult;
use crate::models::grant_snapshot::{self, Column, Entity as GrantSnapshot};
use crate::models::{new_id, now};

#[derive(Debug, Clone)]
pub struct GrantSnapshotRepository {
    pub db: Arc<DatabaseConnection>,
}

impl GrantSnapshotRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Highest-version snapshot for the connection.
    pub async fn latest(&self, connection_id: &str) -> ServiceResult<Option<grant_snapshot::Model>> {
        Self::latest_in(&*self.db, connection_id).await
    }

    async fn latest_in<C: ConnectionTrait>(
        db: &C,
        connection_id: &str,
    ) -> ServiceResult<Option<grant_snapshot::Model>> {
        Ok(GrantSnapshot::find()
            .filter(Column::ConnectionId.eq(connection_id))
            .order_by_desc(Column::Version)
            .one(db)
            .await?)
    }

    /// Append the next snapshot version.
    pub async fn capture<C: ConnectionTrait>(
        db: &C,
        connection_id: &str,
        requested: &[String],
        granted: &[String],
        metadata: JsonValue,
    ) -> ServiceResult<grant_snapshot::Model> {
        let version = Self::latest_in(db, connection_id)
            .await?
            .map(|row| row.version + 1)
            .unwrap_or(1);

        let mut requested = requested.to_vec();
        requested.sort();
        requested.dedup();
        let mut granted = granted.to_vec();
        granted.sort();
        granted.dedup();

        let active = grant_snapshot::ActiveModel {
            id: Set(new_id("grant")),
            connection_id: Set(connection_id.to_string()),
            version: Set(version),
            requested_grants: Set(json!(requested)),
            granted_grants: Set(json!(granted)),
            metadata: Set(metadata),
            captured_at: Set(now()),
        };
        Ok(active.insert(db).await?)
    }
}
