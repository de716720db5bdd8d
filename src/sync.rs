//! Sync Orchestrator
//!
//! Drives incremental syncs for one connection resource: start (or reuse) the
//! job, read from the stored cursor through the provider, advance the cursor
//! and settle the job. Failed runs back off exponentially until the attempt
//! cap, after which the job stays `failed` until restarted.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{info, instrument, warn};
use utoipa::ToSchema;

use crate::crypto::SecretProvider;
use crate::error::{ServiceError, ServiceResult};
use crate::lifecycle::{LifecycleEvent, events};
use crate::config::SyncConfig;
use crate::models::status::SyncJobStatus;
use crate::models::{connection, to_db_time};
use crate::providers::{ProviderRegistry, SyncBatch};
use crate::repositories::sync::SyncTarget;
use crate::repositories::{CredentialRepository, OutboxRepository, Repositories};
use crate::scope::ScopeRef;
use crate::service::{SyncCursorView, SyncJobView};

const BASE_BACKOFF: Duration = Duration::from_secs(60);
const MAX_BACKOFF: Duration = Duration::from_secs(3600);
pub const DEFAULT_RESOURCE_TYPE: &str = "default";
pub const DEFAULT_RESOURCE_ID: &str = "all";

#[derive(Debug, Clone, Default, Deserialize, Serialize, ToSchema)]
pub struct SyncRequest {
    pub connection_id: String,
    #[serde(default)]
    pub provider_id: Option<String>,
    #[serde(default)]
    pub resource_type: Option<String>,
    #[serde(default)]
    pub resource_id: Option<String>,
    #[serde(default)]
    pub metadata: Value,
    /// Start over a job that exhausted its attempts.
    #[serde(default)]
    pub restart: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SyncRunReport {
    pub job: SyncJobView,
    pub cursor: Option<SyncCursorView>,
    pub fetched: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SyncStatus {
    pub connection_id: String,
    pub jobs: Vec<SyncJobView>,
}

/// Delay before retrying a failed run: `60s × 2^(attempts−1)`, capped at one hour.
pub fn sync_backoff(attempts: u32) -> Duration {
    let exponent = attempts.saturating_sub(1).min(16);
    BASE_BACKOFF
        .checked_mul(1u32 << exponent)
        .unwrap_or(MAX_BACKOFF)
        .min(MAX_BACKOFF)
}

pub struct SyncOrchestrator {
    repos: Repositories,
    providers: Arc<ProviderRegistry>,
    secrets: Arc<dyn SecretProvider>,
    max_attempts: u32,
}

impl SyncOrchestrator {
    pub fn new(
        repos: Repositories,
        providers: Arc<ProviderRegistry>,
        secrets: Arc<dyn SecretProvider>,
        config: &SyncConfig,
    ) -> Self {
        Self {
            repos,
            providers,
            secrets,
            max_attempts: config.max_attempts,
        }
    }

    fn exhausted(&self, attempts: i32) -> bool {
        u32::try_from(attempts).is_ok_and(|attempts| attempts >= self.max_attempts)
    }

    #[instrument(skip(self, request), fields(connection_id = %request.connection_id))]
    pub async fn start_incremental(&self, request: SyncRequest) -> ServiceResult<SyncRunReport> {
        let connection = self.repos.connections.require(&request.connection_id).await?;
        if let Some(provider_id) = request.provider_id.as_deref()
            && provider_id != connection.provider_id
        {
            return Err(ServiceError::validation(format!(
                "connection {} belongs to provider {}",
                connection.id, connection.provider_id
            )));
        }
        let target = SyncTarget {
            connection_id: connection.id.clone(),
            provider_id: connection.provider_id.clone(),
            resource_type: non_blank(request.resource_type, DEFAULT_RESOURCE_TYPE),
            resource_id: non_blank(request.resource_id, DEFAULT_RESOURCE_ID),
        };
        let metadata = if request.metadata.is_null() {
            json!({})
        } else {
            request.metadata
        };
        let scope = ScopeRef::from_columns(&connection.scope_type, &connection.scope_id)?;

        if !request.restart
            && let Some(existing) = self.repos.sync_jobs.find(&target).await?
            && existing.status == SyncJobStatus::Failed.as_str()
            && self.exhausted(existing.attempts)
        {
            return Err(ServiceError::conflict(format!(
                "sync job {} failed after {} attempts; request a restart to run it again",
                existing.id, existing.attempts
            )));
        }

        let job = self
            .repos
            .sync_jobs
            .start(&target, "incremental", metadata.clone(), request.restart)
            .await?;
        let previous = self.repos.sync_cursors.get(&target).await?;
        let cursor = previous.as_ref().and_then(|row| row.cursor.clone());

        let started = Instant::now();
        let outcome = self.read(&connection, &target, cursor.as_deref()).await;
        histogram!("services_sync_run_seconds").record(started.elapsed().as_secs_f64());

        match outcome {
            Ok(batch) => {
                let cursor = self
                    .repos
                    .sync_cursors
                    .advance(&target, batch.next_cursor.clone(), metadata)
                    .await?;
                let job = self
                    .repos
                    .sync_jobs
                    .succeed(&job.id, batch.next_cursor.clone())
                    .await?;
                let event = LifecycleEvent::new(events::SYNC_COMPLETED, &target.provider_id, scope)
                    .with_connection(target.connection_id.clone())
                    .with_payload(json!({
                        "resource_type": target.resource_type,
                        "resource_id": target.resource_id,
                        "fetched": batch.fetched,
                        "cursor": batch.next_cursor,
                    }));
                OutboxRepository::insert(&*self.repos.db, &event).await?;

                counter!("services_sync_runs_total", "outcome" => "ok").increment(1);
                info!(fetched = batch.fetched, "Incremental sync succeeded");
                Ok(SyncRunReport {
                    job: job.into(),
                    cursor: Some(cursor.into()),
                    fetched: batch.fetched,
                })
            }
            Err(err) => {
                let attempts = u32::try_from(job.attempts).unwrap_or(1);
                let next_attempt_at = (!self.exhausted(job.attempts)).then(|| {
                    chrono::Duration::from_std(sync_backoff(attempts))
                        .ok()
                        .and_then(|delay| Utc::now().checked_add_signed(delay))
                        .unwrap_or_else(Utc::now)
                });
                self.repos
                    .sync_jobs
                    .fail(&job.id, &err.message, next_attempt_at.map(to_db_time))
                    .await?;
                let event = LifecycleEvent::new(events::SYNC_FAILED, &target.provider_id, scope)
                    .with_connection(target.connection_id.clone())
                    .with_payload(json!({
                        "resource_type": target.resource_type,
                        "resource_id": target.resource_id,
                        "error": err.message,
                        "next_attempt_at": next_attempt_at,
                    }));
                OutboxRepository::insert(&*self.repos.db, &event).await?;

                counter!("services_sync_runs_total", "outcome" => "error").increment(1);
                if next_attempt_at.is_none() {
                    warn!(attempts, error = %err.message, "Incremental sync exhausted its attempts");
                } else {
                    warn!(attempts, error = %err.message, "Incremental sync failed");
                }
                Err(err)
            }
        }
    }

    async fn read(
        &self,
        connection: &connection::Model,
        target: &SyncTarget,
        cursor: Option<&str>,
    ) -> ServiceResult<SyncBatch> {
        let provider = self.providers.get(&connection.provider_id).ok_or_else(|| {
            ServiceError::not_found(format!("provider {} not found", connection.provider_id))
        })?;
        let credential = self
            .repos
            .credentials
            .active_for(&connection.id)
            .await?
            .ok_or_else(|| {
                ServiceError::conflict(format!("connection {} has no active credential", connection.id))
            })?;
        let payload = CredentialRepository::open(self.secrets.as_ref(), &credential)?;
        Ok(provider
            .read_changes(&payload, &target.resource_type, &target.resource_id, cursor)
            .await?)
    }

    pub async fn sync_status(&self, connection_id: &str) -> ServiceResult<SyncStatus> {
        self.repos.connections.require(connection_id).await?;
        let jobs = self.repos.sync_jobs.for_connection(connection_id).await?;
        Ok(SyncStatus {
            connection_id: connection_id.to_string(),
            jobs: jobs.into_iter().map(Into::into).collect(),
        })
    }
}

fn non_blank(value: Option<String>, default: &str) -> String {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(sync_backoff(1), Duration::from_secs(60));
        assert_eq!(sync_backoff(2), Duration::from_secs(120));
        assert_eq!(sync_backoff(4), Duration::from_secs(480));
        assert_eq!(sync_backoff(10), MAX_BACKOFF);
        assert_eq!(sync_backoff(0), Duration::from_secs(60));
    }

    #[test]
    fn blank_targets_use_defaults() {
        assert_eq!(non_blank(Some("  ".into()), "all"), "all");
        assert_eq!(non_blank(Some(" issues ".into()), "all"), "issues");
        assert_eq!(non_blank(None, "default"), "default");
    }
}
