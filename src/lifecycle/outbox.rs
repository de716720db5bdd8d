//! Lifecycle outbox store contract and dispatcher.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use rand::Rng;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use utoipa::ToSchema;

use super::{LifecycleEvent, ProjectorRegistry};
use crate::config::DispatcherConfig;
use crate::error::ServiceResult;

/// How long a claimed row stays `processing` before another worker may take it.
pub const PROCESSING_LEASE: Duration = Duration::from_secs(300);

const MAX_BACKOFF: Duration = Duration::from_secs(3600);

/// Durable queue of lifecycle events.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Persist `event` as `pending`, returning the outbox row id.
    async fn enqueue(&self, event: &LifecycleEvent) -> ServiceResult<String>;

    /// Claim up to `limit` due rows, ordered by `next_attempt_at` then
    /// `occurred_at`. Claimed rows become `processing` with one more attempt.
    /// Due rows that already used `max_attempts` (a lease that expired on the
    /// final attempt) become `dead` instead of being claimed.
    async fn claim_batch(
        &self,
        limit: u64,
        now: DateTime<Utc>,
        lease: Duration,
        max_attempts: u32,
    ) -> ServiceResult<Vec<LifecycleEvent>>;

    async fn mark_delivered(&self, id: &str, now: DateTime<Utc>) -> ServiceResult<()>;

    /// Record a failed attempt; `dead` rows are never claimed again.
    async fn mark_failed(
        &self,
        id: &str,
        error: &str,
        next_attempt_at: DateTime<Utc>,
        dead: bool,
        now: DateTime<Utc>,
    ) -> ServiceResult<()>;

    async fn status_counts(&self) -> ServiceResult<BTreeMap<String, u64>>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, ToSchema)]
pub struct DispatchReport {
    pub claimed: u64,
    pub delivered: u64,
    pub failed: u64,
    pub dead: u64,
}

pub struct OutboxDispatcher {
    store: Arc<dyn OutboxStore>,
    projectors: Arc<ProjectorRegistry>,
    config: DispatcherConfig,
}

impl OutboxDispatcher {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        projectors: Arc<ProjectorRegistry>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            store,
            projectors,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn OutboxStore> {
        &self.store
    }

    pub fn projectors(&self) -> &Arc<ProjectorRegistry> {
        &self.projectors
    }

    pub async fn dispatch_pending(&self) -> ServiceResult<DispatchReport> {
        self.dispatch_pending_at(Utc::now()).await
    }

    /// Dispatch one batch as if the clock read `now`.
    pub async fn dispatch_pending_at(&self, now: DateTime<Utc>) -> ServiceResult<DispatchReport> {
        let started = Instant::now();
        let batch = self
            .store
            .claim_batch(
                u64::from(self.config.batch_size),
                now,
                PROCESSING_LEASE,
                self.config.max_attempts,
            )
            .await?;

        let mut report = DispatchReport {
            claimed: batch.len() as u64,
            ..DispatchReport::default()
        };

        for event in batch {
            let failures = self.projectors.project(&event).await;
            if failures.is_empty() {
                self.store.mark_delivered(&event.id, now).await?;
                report.delivered += 1;
                continue;
            }

            let message = failures
                .iter()
                .map(|f| format!("{}: {}", f.projector, f.error))
                .collect::<Vec<_>>()
                .join("; ");
            let dead = event.attempts >= self.config.max_attempts;
            let delay = jittered(retry_backoff(self.config.initial_backoff(), event.attempts));
            let next_attempt_at = now
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::hours(1));

            self.store
                .mark_failed(&event.id, &message, next_attempt_at, dead, now)
                .await?;
            if dead {
                tracing::error!(
                    event_id = %event.event_id,
                    event_name = %event.event_name,
                    attempts = event.attempts,
                    error = %message,
                    "Outbox event exhausted its attempts"
                );
                report.dead += 1;
            } else {
                report.failed += 1;
            }
        }

        counter!("services_outbox_delivered_total").increment(report.delivered);
        counter!("services_outbox_failed_total").increment(report.failed);
        counter!("services_outbox_dead_total").increment(report.dead);
        histogram!("services_outbox_dispatch_duration_ms")
            .record(started.elapsed().as_secs_f64() * 1_000.0);

        if report.claimed > 0 {
            tracing::info!(
                claimed = report.claimed,
                delivered = report.delivered,
                failed = report.failed,
                dead = report.dead,
                "Dispatched outbox batch"
            );
        }
        Ok(report)
    }

    /// Dispatch on an interval until `shutdown` fires, running `after_tick`
    /// after every batch.
    pub async fn run<F, Fut>(&self, shutdown: CancellationToken, mut after_tick: F)
    where
        F: FnMut() -> Fut + Send,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let interval = Duration::from_secs(self.config.interval_seconds);
        tracing::info!(?interval, "Starting outbox dispatcher");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Outbox dispatcher shutdown requested");
                    break;
                }
                _ = tokio::time::sleep(interval) => {
                    if let Err(err) = self.dispatch_pending().await {
                        tracing::error!(error = %err, "Outbox dispatch tick failed");
                    }
                    after_tick().await;
                }
            }
        }
        tracing::info!("Outbox dispatcher stopped");
    }
}

/// `initial × 2^(attempts−1)`, capped at one hour.
pub fn retry_backoff(initial: Duration, attempts: u32) -> Duration {
    let exponent = attempts.saturating_sub(1).min(20);
    initial
        .checked_mul(1u32 << exponent)
        .unwrap_or(MAX_BACKOFF)
        .min(MAX_BACKOFF)
}

/// Add up to 10% random jitter.
fn jittered(delay: Duration) -> Duration {
    let jitter = rand::thread_rng().gen_range(0.0..=0.1);
    delay + delay.mul_f64(jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let initial = Duration::from_secs(1);
        assert_eq!(retry_backoff(initial, 0), Duration::from_secs(1));
        assert_eq!(retry_backoff(initial, 1), Duration::from_secs(1));
        assert_eq!(retry_backoff(initial, 2), Duration::from_secs(2));
        assert_eq!(retry_backoff(initial, 4), Duration::from_secs(8));
        assert_eq!(retry_backoff(initial, 30), MAX_BACKOFF);
    }

    #[test]
    fn jitter_stays_within_ten_percent() {
        for _ in 0..100 {
            let delay = jittered(Duration::from_secs(10));
            assert!(delay >= Duration::from_secs(10));
            assert!(delay <= Duration::from_secs(11));
        }
    }
}
