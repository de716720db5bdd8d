//! # Lifecycle Events
//!
//! Facade mutations enqueue [`LifecycleEvent`]s into a durable outbox. The
//! [`outbox::OutboxDispatcher`] fans each event out to the registered
//! projectors (activity, notifications and custom subscribers) with retry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::scope::ScopeRef;

pub mod activity;
pub mod notifications;
pub mod outbox;
pub mod projector;

pub use activity::{ActivityProjector, ActivityRuntime, ActivitySink, FallbackActivitySink};
pub use notifications::{NotificationSender, NotificationsProjector};
pub use outbox::{OutboxDispatcher, OutboxStore};
pub use projector::{Projector, ProjectorRegistry};

/// Event names emitted by the services facade and processors.
pub mod events {
    pub const CONNECTION_CONNECTED: &str = "services.connection.connected";
    pub const CONNECTION_REFRESHED: &str = "services.connection.refreshed";
    pub const CONNECTION_REFRESH_FAILED: &str = "services.connection.refresh_failed";
    pub const CONNECTION_REVOKED: &str = "services.connection.revoked";
    pub const CONNECTION_RECONSENT_REQUESTED: &str = "services.connection.reconsent_requested";
    pub const INSTALLATION_UPSERTED: &str = "services.installation.upserted";
    pub const INSTALLATION_STATUS_CHANGED: &str = "services.installation.status_changed";
    pub const SUBSCRIPTION_UPSERTED: &str = "services.subscription.upserted";
    pub const SUBSCRIPTION_RENEWED: &str = "services.subscription.renewed";
    pub const SUBSCRIPTION_CANCELLED: &str = "services.subscription.cancelled";
    pub const CAPABILITY_INVOKED: &str = "services.capability.invoked";
    pub const SYNC_COMPLETED: &str = "services.sync.completed";
    pub const SYNC_FAILED: &str = "services.sync.failed";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    /// Outbox row id; empty until the event is enqueued.
    #[serde(default)]
    pub id: String,
    pub event_id: String,
    pub event_name: String,
    pub provider_id: String,
    pub scope: ScopeRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    pub payload: Value,
    pub metadata: Value,
    pub occurred_at: DateTime<Utc>,
    #[serde(default)]
    pub attempts: u32,
}

impl LifecycleEvent {
    pub fn new(event_name: &str, provider_id: &str, scope: ScopeRef) -> Self {
        Self {
            id: String::new(),
            event_id: crate::models::new_id("evt"),
            event_name: event_name.to_string(),
            provider_id: provider_id.to_string(),
            scope,
            connection_id: None,
            payload: json!({}),
            metadata: json!({}),
            occurred_at: Utc::now(),
            attempts: 0,
        }
    }

    pub fn with_event_id(mut self, event_id: impl Into<String>) -> Self {
        self.event_id = event_id.into();
        self
    }

    pub fn with_connection(mut self, connection_id: impl Into<String>) -> Self {
        self.connection_id = Some(connection_id.into());
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }
}
