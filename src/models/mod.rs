//! # Data Models
//!
//! SeaORM entities for the services tables plus the status vocabulary they share.

use chrono::{DateTime, Utc};
use sea_orm::prelude::DateTimeWithTimeZone;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

pub mod activity_entry;
pub mod connection;
pub mod credential;
pub mod grant_snapshot;
pub mod installation;
pub mod lifecycle_outbox;
pub mod notification_dispatch;
pub mod rate_limit_state;
pub mod status;
pub mod subscription;
pub mod sync_cursor;
pub mod sync_job;
pub mod webhook_delivery;

pub use activity_entry::Entity as ActivityEntry;
pub use connection::Entity as Connection;
pub use credential::Entity as Credential;
pub use grant_snapshot::Entity as GrantSnapshot;
pub use installation::Entity as Installation;
pub use lifecycle_outbox::Entity as LifecycleOutbox;
pub use notification_dispatch::Entity as NotificationDispatch;
pub use rate_limit_state::Entity as RateLimitState;
pub use subscription::Entity as Subscription;
pub use sync_cursor::Entity as SyncCursor;
pub use sync_job::Entity as SyncJob;
pub use webhook_delivery::Entity as WebhookDelivery;

/// Basic service information response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ServiceInfo {
    /// The name of the service
    pub service: String,
    /// The version of the service
    pub version: String,
}

impl Default for ServiceInfo {
    fn default() -> Self {
        Self {
            service: "services-plane".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Generate a prefixed identifier such as `conn_4f0c…`.
pub fn new_id(prefix: &str) -> String {
    format!("{}_{}", prefix, Uuid::new_v4().simple())
}

/// Current time in the representation stored by every table.
pub fn now() -> DateTimeWithTimeZone {
    Utc::now().fixed_offset()
}

pub fn to_db_time(value: DateTime<Utc>) -> DateTimeWithTimeZone {
    value.fixed_offset()
}

pub fn from_db_time(value: DateTimeWithTimeZone) -> DateTime<Utc> {
    value.with_timezone(&Utc)
}

/// Decode a JSON array column into strings, ignoring non-string members.
pub fn json_strings(value: &serde_json::Value) -> Vec<String> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}
