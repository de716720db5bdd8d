//! Read models returned by the facade and serialized by the HTTP layer.
//! Credential views never carry token material.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

use crate::models::{
    connection, credential, from_db_time, grant_snapshot, installation, json_strings,
    rate_limit_state, subscription, sync_cursor, sync_job,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct InstallationView {
    pub id: String,
    pub provider_id: String,
    pub scope_type: String,
    pub scope_id: String,
    pub install_type: String,
    pub status: String,
    pub granted_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<installation::Model> for InstallationView {
    fn from(model: installation::Model) -> Self {
        Self {
            id: model.id,
            provider_id: model.provider_id,
            scope_type: model.scope_type,
            scope_id: model.scope_id,
            install_type: model.install_type,
            status: model.status,
            granted_at: model.granted_at.map(from_db_time),
            revoked_at: model.revoked_at.map(from_db_time),
            metadata: model.metadata,
            created_at: from_db_time(model.created_at),
            updated_at: from_db_time(model.updated_at),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ConnectionView {
    pub id: String,
    pub provider_id: String,
    pub scope_type: String,
    pub scope_id: String,
    pub external_account_id: String,
    pub status: String,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<connection::Model> for ConnectionView {
    fn from(model: connection::Model) -> Self {
        Self {
            id: model.id,
            provider_id: model.provider_id,
            scope_type: model.scope_type,
            scope_id: model.scope_id,
            external_account_id: model.external_account_id,
            status: model.status,
            last_error: model.last_error,
            created_at: from_db_time(model.created_at),
            updated_at: from_db_time(model.updated_at),
        }
    }
}

/// Credential metadata; the sealed payload stays in the table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct CredentialView {
    pub id: String,
    pub connection_id: String,
    pub version: i32,
    pub token_type: String,
    pub requested_scopes: Vec<String>,
    pub granted_scopes: Vec<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub refreshable: bool,
    pub status: String,
    pub encryption_key_id: String,
    pub encryption_version: i32,
    pub created_at: DateTime<Utc>,
}

impl From<credential::Model> for CredentialView {
    fn from(model: credential::Model) -> Self {
        Self {
            requested_scopes: json_strings(&model.requested_scopes),
            granted_scopes: json_strings(&model.granted_scopes),
            id: model.id,
            connection_id: model.connection_id,
            version: model.version,
            token_type: model.token_type,
            expires_at: model.expires_at.map(from_db_time),
            refreshable: model.refreshable,
            status: model.status,
            encryption_key_id: model.encryption_key_id,
            encryption_version: model.encryption_version,
            created_at: from_db_time(model.created_at),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct GrantSnapshotView {
    pub connection_id: String,
    pub version: i32,
    pub requested_grants: Vec<String>,
    pub granted_grants: Vec<String>,
    pub metadata: Value,
    pub captured_at: DateTime<Utc>,
}

impl From<grant_snapshot::Model> for GrantSnapshotView {
    fn from(model: grant_snapshot::Model) -> Self {
        Self {
            requested_grants: json_strings(&model.requested_grants),
            granted_grants: json_strings(&model.granted_grants),
            connection_id: model.connection_id,
            version: model.version,
            metadata: model.metadata,
            captured_at: from_db_time(model.captured_at),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct SubscriptionView {
    pub id: String,
    pub connection_id: String,
    pub provider_id: String,
    pub resource_type: String,
    pub resource_id: String,
    pub channel_id: String,
    pub remote_subscription_id: Option<String>,
    pub callback_url: String,
    pub status: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_notified_at: Option<DateTime<Utc>>,
    pub metadata: Value,
    pub updated_at: DateTime<Utc>,
}

impl From<subscription::Model> for SubscriptionView {
    fn from(model: subscription::Model) -> Self {
        Self {
            id: model.id,
            connection_id: model.connection_id,
            provider_id: model.provider_id,
            resource_type: model.resource_type,
            resource_id: model.resource_id,
            channel_id: model.channel_id,
            remote_subscription_id: model.remote_subscription_id,
            callback_url: model.callback_url,
            status: model.status,
            expires_at: model.expires_at.map(from_db_time),
            last_notified_at: model.last_notified_at.map(from_db_time),
            metadata: model.metadata,
            updated_at: from_db_time(model.updated_at),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct SyncJobView {
    pub id: String,
    pub connection_id: String,
    pub provider_id: String,
    pub resource_type: String,
    pub resource_id: String,
    pub mode: String,
    pub checkpoint: Option<String>,
    pub status: String,
    pub attempts: i32,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl From<sync_job::Model> for SyncJobView {
    fn from(model: sync_job::Model) -> Self {
        Self {
            id: model.id,
            connection_id: model.connection_id,
            provider_id: model.provider_id,
            resource_type: model.resource_type,
            resource_id: model.resource_id,
            mode: model.mode,
            checkpoint: model.checkpoint,
            status: model.status,
            attempts: model.attempts,
            next_attempt_at: model.next_attempt_at.map(from_db_time),
            last_error: model.last_error,
            updated_at: from_db_time(model.updated_at),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct SyncCursorView {
    pub connection_id: String,
    pub resource_type: String,
    pub resource_id: String,
    pub cursor: Option<String>,
    pub status: String,
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl From<sync_cursor::Model> for SyncCursorView {
    fn from(model: sync_cursor::Model) -> Self {
        Self {
            connection_id: model.connection_id,
            resource_type: model.resource_type,
            resource_id: model.resource_id,
            cursor: model.cursor,
            status: model.status,
            last_synced_at: model.last_synced_at.map(from_db_time),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct RateLimitView {
    pub provider_id: String,
    pub scope_type: String,
    pub scope_id: String,
    pub bucket_key: String,
    pub limit: i32,
    pub remaining: i32,
    pub reset_at: Option<DateTime<Utc>>,
    pub retry_after: i64,
    pub metadata: Value,
    pub updated_at: DateTime<Utc>,
}

impl From<rate_limit_state::Model> for RateLimitView {
    fn from(model: rate_limit_state::Model) -> Self {
        Self {
            provider_id: model.provider_id,
            scope_type: model.scope_type,
            scope_id: model.scope_id,
            bucket_key: model.bucket_key,
            limit: model.limit,
            remaining: model.remaining,
            reset_at: model.reset_at.map(from_db_time),
            retry_after: model.retry_after,
            metadata: model.metadata,
            updated_at: from_db_time(model.updated_at),
        }
    }
}
