//! # Repository Layer
//!
//! Repository implementations that encapsulate SeaORM operations for the
//! services tables. Stores behind the lifecycle, webhook and activity traits
//! live here too, so the runtime only ever sees trait objects.

use std::collections::BTreeMap;
use std::sync::Arc;

use sea_orm::{DatabaseConnection, FromQueryResult};

pub mod activity;
pub mod connection;
pub mod credential;
pub mod grant_snapshot;
pub mod installation;
pub mod notification;
pub mod outbox;
pub mod rate_limit;
pub mod subscription;
pub mod sync;
pub mod webhook_delivery;

pub use activity::ActivityRepository;
pub use connection::ConnectionRepository;
pub use credential::CredentialRepository;
pub use grant_snapshot::GrantSnapshotRepository;
pub use installation::InstallationRepository;
pub use notification::NotificationDispatchRepository;
pub use outbox::OutboxRepository;
pub use rate_limit::RateLimitRepository;
pub use subscription::SubscriptionRepository;
pub use sync::{SyncCursorRepository, SyncJobRepository};
pub use webhook_delivery::WebhookDeliveryRepository;

/// Optional equality filters shared by list queries. Each repository applies
/// the fields its table carries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordFilter {
    pub provider_id: Option<String>,
    pub scope_type: Option<String>,
    pub scope_id: Option<String>,
    pub connection_id: Option<String>,
    pub status: Option<String>,
}

/// `status → count` row produced by grouped count queries.
#[derive(Debug, FromQueryResult)]
pub(crate) struct StatusCount {
    pub status: String,
    pub count: i64,
}

pub(crate) fn status_map(rows: Vec<StatusCount>) -> BTreeMap<String, u64> {
    rows.into_iter()
        .map(|row| (row.status, u64::try_from(row.count).unwrap_or_default()))
        .collect()
}

/// Every repository over one shared pool.
#[derive(Debug, Clone)]
pub struct Repositories {
    pub db: Arc<DatabaseConnection>,
    pub installations: InstallationRepository,
    pub connections: ConnectionRepository,
    pub credentials: CredentialRepository,
    pub grants: GrantSnapshotRepository,
    pub subscriptions: SubscriptionRepository,
    pub sync_cursors: SyncCursorRepository,
    pub sync_jobs: SyncJobRepository,
    pub activity: ActivityRepository,
    pub outbox: OutboxRepository,
    pub notifications: NotificationDispatchRepository,
    pub webhook_deliveries: WebhookDeliveryRepository,
    rate_limits: Option<RateLimitRepository>,
}

impl Repositories {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self {
            installations: InstallationRepository::new(db.clone()),
            connections: ConnectionRepository::new(db.clone()),
            credentials: CredentialRepository::new(db.clone()),
            grants: GrantSnapshotRepository::new(db.clone()),
            subscriptions: SubscriptionRepository::new(db.clone()),
            sync_cursors: SyncCursorRepository::new(db.clone()),
            sync_jobs: SyncJobRepository::new(db.clone()),
            activity: ActivityRepository::new(db.clone()),
            outbox: OutboxRepository::new(db.clone()),
            notifications: NotificationDispatchRepository::new(db.clone()),
            webhook_deliveries: WebhookDeliveryRepository::new(db.clone()),
            rate_limits: Some(RateLimitRepository::new(db.clone())),
            db,
        }
    }

    /// Drop rate-limit persistence; refresh throttling is then only logged.
    pub fn without_rate_limits(mut self) -> Self {
        self.rate_limits = None;
        self
    }

    /// Rate-limit state store, when this deployment persists one.
    pub fn rate_limits(&self) -> Option<&RateLimitRepository> {
        self.rate_limits.as_ref()
    }
}
