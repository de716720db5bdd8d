//! Activity projection with fallback buffering and retention.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use utoipa::ToSchema;

use super::{LifecycleEvent, Projector};
use crate::config::ActivityProjectorConfig;
use crate::error::ServiceResult;

pub const PROJECTOR_NAME: &str = "activity";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ActivityEntry {
    pub id: String,
    pub provider_id: String,
    pub scope_type: String,
    pub scope_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    pub channel: String,
    pub action: String,
    pub object_type: String,
    pub object_id: String,
    pub actor: String,
    pub actor_type: String,
    /// ok | error
    pub status: String,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityFilter {
    pub provider_id: Option<String>,
    pub scope_type: Option<String>,
    pub scope_id: Option<String>,
    pub connection_id: Option<String>,
    pub action: Option<String>,
    pub status: Option<String>,
}

impl ActivityFilter {
    pub fn matches(&self, entry: &ActivityEntry) -> bool {
        fn eq(filter: &Option<String>, value: &str) -> bool {
            filter.as_deref().is_none_or(|f| f == value)
        }
        eq(&self.provider_id, &entry.provider_id)
            && eq(&self.scope_type, &entry.scope_type)
            && eq(&self.scope_id, &entry.scope_id)
            && eq(&self.action, &entry.action)
            && eq(&self.status, &entry.status)
            && self
                .connection_id
                .as_deref()
                .is_none_or(|f| entry.connection_id.as_deref() == Some(f))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub ttl: Duration,
    pub row_cap: u64,
}

/// Durable store of activity entries.
#[async_trait]
pub trait ActivitySink: Send + Sync {
    async fn record(&self, entry: &ActivityEntry) -> ServiceResult<()>;

    /// Newest first.
    async fn list(
        &self,
        filter: &ActivityFilter,
        limit: u64,
        offset: u64,
    ) -> ServiceResult<(Vec<ActivityEntry>, u64)>;

    /// Delete entries older than the TTL, then the oldest entries beyond the
    /// row cap. Returns the number of rows removed.
    async fn enforce_retention(
        &self,
        policy: RetentionPolicy,
        now: DateTime<Utc>,
    ) -> ServiceResult<u64>;
}

/// Wraps a primary sink; writes the primary rejects land in a bounded ring.
pub struct FallbackActivitySink {
    primary: Arc<dyn ActivitySink>,
    ring: Mutex<VecDeque<ActivityEntry>>,
    capacity: usize,
}

impl FallbackActivitySink {
    pub fn new(primary: Arc<dyn ActivitySink>, capacity: usize) -> Self {
        Self {
            primary,
            ring: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
        }
    }

    pub fn buffered(&self) -> Vec<ActivityEntry> {
        self.ring
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub fn buffered_len(&self) -> usize {
        self.ring
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn push(&self, entry: ActivityEntry) {
        let mut ring = self.ring.lock().unwrap_or_else(PoisonError::into_inner);
        if ring.iter().any(|buffered| buffered.id == entry.id) {
            return;
        }
        while ring.len() >= self.capacity {
            ring.pop_front();
        }
        ring.push_back(entry);
    }

    /// Apply the retention policy to buffered entries.
    fn prune_buffer(&self, policy: RetentionPolicy, now: DateTime<Utc>) -> u64 {
        let cutoff = chrono::Duration::from_std(policy.ttl)
            .ok()
            .and_then(|ttl| now.checked_sub_signed(ttl));
        let mut ring = self.ring.lock().unwrap_or_else(PoisonError::into_inner);
        let before = ring.len();
        ring.retain(|entry| cutoff.is_none_or(|cutoff| entry.created_at >= cutoff));
        let cap = usize::try_from(policy.row_cap).unwrap_or(usize::MAX);
        while ring.len() > cap {
            ring.pop_front();
        }
        (before - ring.len()) as u64
    }

    /// Move up to `max` buffered entries into the primary sink, oldest first.
    /// Stops at the first write the primary rejects.
    async fn replay(&self, max: usize) -> u64 {
        let pending: Vec<ActivityEntry> = {
            let ring = self.ring.lock().unwrap_or_else(PoisonError::into_inner);
            ring.iter().take(max).cloned().collect()
        };

        let mut replayed = 0u64;
        for entry in pending {
            if self.primary.record(&entry).await.is_err() {
                break;
            }
            let mut ring = self.ring.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(position) = ring.iter().position(|e| e.id == entry.id) {
                ring.remove(position);
            }
            replayed += 1;
        }
        replayed
    }
}

#[async_trait]
impl ActivitySink for FallbackActivitySink {
    async fn record(&self, entry: &ActivityEntry) -> ServiceResult<()> {
        if let Err(error) = self.primary.record(entry).await {
            tracing::warn!(
                entry_id = %entry.id,
                error = %error,
                "Activity sink unavailable; buffering entry"
            );
            metrics::counter!("services_activity_fallback_total").increment(1);
            self.push(entry.clone());
        }
        Ok(())
    }

    async fn list(
        &self,
        filter: &ActivityFilter,
        limit: u64,
        offset: u64,
    ) -> ServiceResult<(Vec<ActivityEntry>, u64)> {
        match self.primary.list(filter, limit, offset).await {
            Ok(result) => Ok(result),
            Err(error) => {
                tracing::warn!(error = %error, "Activity sink unavailable; listing buffered entries");
                let mut matching: Vec<ActivityEntry> = self
                    .buffered()
                    .into_iter()
                    .filter(|entry| filter.matches(entry))
                    .collect();
                matching.reverse();
                let total = matching.len() as u64;
                let items = matching
                    .into_iter()
                    .skip(offset as usize)
                    .take(limit as usize)
                    .collect();
                Ok((items, total))
            }
        }
    }

    async fn enforce_retention(
        &self,
        policy: RetentionPolicy,
        now: DateTime<Utc>,
    ) -> ServiceResult<u64> {
        let buffered = self.prune_buffer(policy, now);
        let primary = match self.primary.enforce_retention(policy, now).await {
            Ok(deleted) => deleted,
            Err(error) => {
                tracing::warn!(error = %error, "Primary activity retention failed");
                0
            }
        };
        Ok(primary + buffered)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct RetentionReport {
    pub deleted: u64,
    pub replayed: u64,
    pub buffered: u64,
}

/// Operational activity surface: recording, listing and retention runs.
pub struct ActivityRuntime {
    sink: Arc<FallbackActivitySink>,
    policy: RetentionPolicy,
    replay_batch: usize,
}

impl ActivityRuntime {
    pub fn new(primary: Arc<dyn ActivitySink>, config: &ActivityProjectorConfig) -> Self {
        Self {
            sink: Arc::new(FallbackActivitySink::new(primary, config.fallback_buffer_size)),
            policy: RetentionPolicy {
                ttl: config.retention_ttl(),
                row_cap: config.retention_row_cap,
            },
            replay_batch: config.buffer_size,
        }
    }

    pub fn sink(&self) -> &Arc<FallbackActivitySink> {
        &self.sink
    }

    pub fn policy(&self) -> RetentionPolicy {
        self.policy
    }

    pub async fn record(&self, entry: &ActivityEntry) -> ServiceResult<()> {
        self.sink.record(entry).await
    }

    pub async fn list(
        &self,
        filter: &ActivityFilter,
        limit: u64,
        offset: u64,
    ) -> ServiceResult<(Vec<ActivityEntry>, u64)> {
        self.sink.list(filter, limit, offset).await
    }

    pub async fn enforce_retention(&self) -> ServiceResult<RetentionReport> {
        self.enforce_retention_at(Utc::now()).await
    }

    /// Replay buffered entries into the primary sink, then apply retention.
    pub async fn enforce_retention_at(&self, now: DateTime<Utc>) -> ServiceResult<RetentionReport> {
        let replayed = self.sink.replay(self.replay_batch).await;
        let deleted = self.sink.enforce_retention(self.policy, now).await?;
        let report = RetentionReport {
            deleted,
            replayed,
            buffered: self.sink.buffered_len() as u64,
        };
        tracing::info!(
            deleted = report.deleted,
            replayed = report.replayed,
            buffered = report.buffered,
            "Activity retention run complete"
        );
        Ok(report)
    }
}

/// Projects every lifecycle event into an activity entry.
pub struct ActivityProjector {
    runtime: Arc<ActivityRuntime>,
    label_overrides: BTreeMap<String, String>,
}

impl ActivityProjector {
    pub fn new(runtime: Arc<ActivityRuntime>, label_overrides: BTreeMap<String, String>) -> Self {
        Self {
            runtime,
            label_overrides,
        }
    }

    pub fn entry_for(&self, event: &LifecycleEvent) -> ActivityEntry {
        let action = self
            .label_overrides
            .get(&event.event_name)
            .cloned()
            .unwrap_or_else(|| event.event_name.clone());
        let (object_type, object_id) = match (&event.connection_id, event.payload.get("object_id")) {
            (_, Some(Value::String(id))) => (
                event
                    .payload
                    .get("object_type")
                    .and_then(Value::as_str)
                    .unwrap_or("resource")
                    .to_string(),
                id.clone(),
            ),
            (Some(connection_id), _) => ("connection".to_string(), connection_id.clone()),
            (None, _) => ("provider".to_string(), event.provider_id.clone()),
        };
        let (actor, actor_type) = match event.metadata_str("actor_id") {
            Some(actor) => (actor.to_string(), "user".to_string()),
            None => ("system".to_string(), "system".to_string()),
        };
        let failed = event.event_name.ends_with("failed")
            || event.payload.get("error").is_some_and(|e| !e.is_null());

        ActivityEntry {
            id: format!("act_{}", event.event_id),
            provider_id: event.provider_id.clone(),
            scope_type: event.scope.scope_type.to_string(),
            scope_id: event.scope.id.clone(),
            connection_id: event.connection_id.clone(),
            channel: "lifecycle".to_string(),
            action,
            object_type,
            object_id,
            actor,
            actor_type,
            status: if failed { "error" } else { "ok" }.to_string(),
            metadata: json!({
                "event_id": event.event_id,
                "event_name": event.event_name,
            }),
            created_at: event.occurred_at,
        }
    }
}

#[async_trait]
impl Projector for ActivityProjector {
    fn name(&self) -> &str {
        PROJECTOR_NAME
    }

    async fn project(&self, event: &LifecycleEvent) -> ServiceResult<()> {
        self.runtime.record(&self.entry_for(event)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ServiceError;
    use crate::scope::ScopeRef;

    struct BrokenSink;

    #[async_trait]
    impl ActivitySink for BrokenSink {
        async fn record(&self, _entry: &ActivityEntry) -> ServiceResult<()> {
            Err(ServiceError::internal("sink down"))
        }

        async fn list(
            &self,
            _filter: &ActivityFilter,
            _limit: u64,
            _offset: u64,
        ) -> ServiceResult<(Vec<ActivityEntry>, u64)> {
            Err(ServiceError::internal("sink down"))
        }

        async fn enforce_retention(
            &self,
            _policy: RetentionPolicy,
            _now: DateTime<Utc>,
        ) -> ServiceResult<u64> {
            Err(ServiceError::internal("sink down"))
        }
    }

    fn entry(id: &str, created_at: DateTime<Utc>) -> ActivityEntry {
        ActivityEntry {
            id: id.to_string(),
            provider_id: "example".into(),
            scope_type: "user".into(),
            scope_id: "u-1".into(),
            connection_id: None,
            channel: "lifecycle".into(),
            action: "services.test".into(),
            object_type: "provider".into(),
            object_id: "example".into(),
            actor: "system".into(),
            actor_type: "system".into(),
            status: "ok".into(),
            metadata: json!({}),
            created_at,
        }
    }

    #[tokio::test]
    async fn ring_is_bounded_and_listable() {
        let sink = FallbackActivitySink::new(Arc::new(BrokenSink), 2);
        let now = Utc::now();
        for id in ["a", "b", "c"] {
            sink.record(&entry(id, now)).await.unwrap();
        }

        let ids: Vec<_> = sink.buffered().into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec!["b", "c"]);

        let (items, total) = sink.list(&ActivityFilter::default(), 10, 0).await.unwrap();
        assert_eq!(total, 2);
        assert_eq!(items[0].id, "c");
    }

    #[tokio::test]
    async fn retention_prunes_expired_buffered_entries() {
        let config = ActivityProjectorConfig {
            retention_ttl_seconds: 60,
            retention_row_cap: 10,
            ..ActivityProjectorConfig::default()
        };
        let runtime = ActivityRuntime::new(Arc::new(BrokenSink), &config);
        let now = Utc::now();
        runtime
            .record(&entry("old", now - chrono::Duration::seconds(120)))
            .await
            .unwrap();
        runtime.record(&entry("new", now)).await.unwrap();

        let report = runtime.enforce_retention_at(now).await.unwrap();
        assert_eq!(report.deleted, 1);
        assert_eq!(report.replayed, 0);
        assert_eq!(report.buffered, 1);
    }

    #[test]
    fn projector_builds_entry_with_overrides() {
        let runtime = Arc::new(ActivityRuntime::new(
            Arc::new(BrokenSink),
            &ActivityProjectorConfig::default(),
        ));
        let overrides = BTreeMap::from([(
            "services.connection.connected".to_string(),
            "Connected".to_string(),
        )]);
        let projector = ActivityProjector::new(runtime, overrides);

        let event = LifecycleEvent::new(
            "services.connection.connected",
            "github",
            ScopeRef::org("org-1"),
        )
        .with_connection("conn_1")
        .with_metadata(json!({ "actor_id": "user-7" }));
        let entry = projector.entry_for(&event);

        assert_eq!(entry.action, "Connected");
        assert_eq!(entry.object_type, "connection");
        assert_eq!(entry.object_id, "conn_1");
        assert_eq!(entry.actor, "user-7");
        assert_eq!(entry.status, "ok");

        let failed = LifecycleEvent::new(
            "services.connection.refresh_failed",
            "github",
            ScopeRef::org("org-1"),
        );
        assert_eq!(projector.entry_for(&failed).status, "error");
    }

    #[tokio::test]
    async fn redelivered_event_keeps_one_entry() {
        let runtime = Arc::new(ActivityRuntime::new(
            Arc::new(BrokenSink),
            &ActivityProjectorConfig::default(),
        ));
        let projector = ActivityProjector::new(runtime.clone(), BTreeMap::new());
        let event = LifecycleEvent::new(
            "services.connection.connected",
            "github",
            ScopeRef::user("u-1"),
        )
        .with_event_id("evt-1");

        let first = projector.entry_for(&event);
        assert_eq!(first.id, "act_evt-1");
        assert_eq!(projector.entry_for(&event).id, first.id);

        runtime.record(&first).await.unwrap();
        runtime.record(&projector.entry_for(&event)).await.unwrap();
        assert_eq!(runtime.sink().buffered_len(), 1);
    }
}
