//! Webhook processing: verify, claim on the ledger, run the webhook handler,
//! then complete or fail the claim.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use serde::Serialize;
use utoipa::ToSchema;

use super::ledger::{ClaimLedger, DeliveryRecord, retry_delay};
use super::verify::VerifierRegistry;
use crate::config::WebhookConfig;
use crate::error::{ServiceError, ServiceResult};
use crate::inbound::{HandlerRegistry, InboundRequest, InboundResponse, Surface};

/// Result of one webhook attempt that did not fail in the handler.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct WebhookOutcome {
    #[serde(skip)]
    pub status: u16,
    pub duplicate: bool,
    pub delivery: DeliveryRecord,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<InboundResponse>,
}

pub struct WebhookProcessor {
    ledger: Arc<dyn ClaimLedger>,
    verifiers: Arc<VerifierRegistry>,
    handlers: Arc<HandlerRegistry>,
    lease: Duration,
    max_attempts: u32,
}

impl WebhookProcessor {
    pub fn new(
        ledger: Arc<dyn ClaimLedger>,
        verifiers: Arc<VerifierRegistry>,
        handlers: Arc<HandlerRegistry>,
        config: &WebhookConfig,
    ) -> Self {
        Self {
            ledger,
            verifiers,
            handlers,
            lease: config.claim_lease(),
            max_attempts: config.max_attempts,
        }
    }

    pub fn ledger(&self) -> &Arc<dyn ClaimLedger> {
        &self.ledger
    }

    /// Checks the provider's signature without claiming the delivery.
    /// Providers with no registered verifier pass.
    pub async fn verify(&self, request: &InboundRequest) -> ServiceResult<()> {
        let Some(verifier) = self.verifiers.get(&request.provider_id) else {
            return Ok(());
        };
        if let Err(err) = verifier.verify(&request.headers, &request.body).await {
            counter!("services_webhook_rejected_total").increment(1);
            tracing::warn!(
                provider_id = %request.provider_id,
                error = %err,
                "Webhook signature verification failed"
            );
            return Err(ServiceError::unauthorized(err.to_string()));
        }
        Ok(())
    }

    pub async fn process(&self, request: InboundRequest) -> ServiceResult<WebhookOutcome> {
        self.process_at(request, Utc::now()).await
    }

    /// Handler failures come back as `Err` carrying the handler's status
    /// (500 when it reported none), after the claim has been failed.
    pub async fn process_at(
        &self,
        mut request: InboundRequest,
        now: DateTime<Utc>,
    ) -> ServiceResult<WebhookOutcome> {
        request.surface = Surface::Webhook;
        if request.provider_id.is_empty() {
            return Err(ServiceError::validation("provider id is required"));
        }

        self.verify(&request).await?;

        let delivery_id = request.message_id();
        let claim = self
            .ledger
            .claim(&request.provider_id, &delivery_id, self.lease, now)
            .await?;
        if !claim.claimed {
            tracing::debug!(
                provider_id = %request.provider_id,
                delivery_id = %delivery_id,
                status = %claim.record.status.as_str(),
                "Webhook delivery already claimed"
            );
            return Ok(WebhookOutcome {
                status: 200,
                duplicate: true,
                delivery: claim.record,
                response: None,
            });
        }

        let claim_id = claim
            .record
            .claim_id
            .clone()
            .ok_or_else(|| ServiceError::internal("claimed webhook delivery has no claim id"))?;
        let handler = self.handlers.get(Surface::Webhook);
        let started = Instant::now();
        let result = handler.handle(&request).await;
        histogram!("services_webhook_handler_seconds").record(started.elapsed().as_secs_f64());

        match result {
            Ok(response) => {
                self.ledger.complete(&claim_id, Utc::now()).await?;
                counter!("services_webhook_processed_total").increment(1);
                let delivery = self
                    .ledger
                    .get(&request.provider_id, &delivery_id)
                    .await?
                    .unwrap_or(claim.record);
                Ok(WebhookOutcome {
                    status: 202,
                    duplicate: false,
                    delivery,
                    response: Some(response),
                })
            }
            Err(err) => {
                let failed_at = Utc::now();
                let delay = retry_delay(self.lease, claim.record.attempts);
                let next_attempt_at = chrono::Duration::from_std(delay)
                    .ok()
                    .and_then(|delay| failed_at.checked_add_signed(delay))
                    .unwrap_or(failed_at);
                let record = self
                    .ledger
                    .fail(
                        &claim_id,
                        &err.message,
                        next_attempt_at,
                        self.max_attempts,
                        failed_at,
                    )
                    .await?;
                counter!("services_webhook_failures_total").increment(1);
                tracing::warn!(
                    provider_id = %request.provider_id,
                    delivery_id = %delivery_id,
                    attempts = record.attempts,
                    status = %record.status.as_str(),
                    error = %err.message,
                    "Webhook handler failed"
                );
                Err(handler_failure(err))
            }
        }
    }
}

/// Keep the handler's own status; uncoded internal failures stay 500.
fn handler_failure(err: ServiceError) -> ServiceError {
    match err.code {
        Some(code) if code >= 400 => err,
        _ if err.category != crate::error::ErrorCategory::Internal => err,
        _ => err.with_code(500),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inbound::InboundHandler;
    use crate::models::status::DeliveryStatus;
    use crate::webhooks::ledger::{ClaimOutcome, is_claimable};
    use async_trait::async_trait;
    use axum::body::Bytes;
    use axum::http::{HeaderMap, HeaderValue};
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Ledger kept in a map; mirrors the SQL claim conditions.
    #[derive(Default)]
    struct MemoryLedger {
        rows: Mutex<BTreeMap<(String, String), DeliveryRecord>>,
        counter: AtomicUsize,
    }

    #[async_trait]
    impl ClaimLedger for MemoryLedger {
        async fn claim(
            &self,
            provider_id: &str,
            delivery_id: &str,
            lease: Duration,
            now: DateTime<Utc>,
        ) -> ServiceResult<ClaimOutcome> {
            let mut rows = self.rows.lock().unwrap();
            let record = rows
                .entry((provider_id.to_string(), delivery_id.to_string()))
                .or_insert_with(|| DeliveryRecord {
                    id: "whd_1".into(),
                    provider_id: provider_id.into(),
                    delivery_id: delivery_id.into(),
                    status: DeliveryStatus::Pending,
                    attempts: 0,
                    claim_id: None,
                    next_attempt_at: None,
                    last_error: None,
                    created_at: now,
                    updated_at: now,
                });
            if !is_claimable(record, now) {
                return Ok(ClaimOutcome {
                    record: record.clone(),
                    claimed: false,
                });
            }
            let n = self.counter.fetch_add(1, Ordering::SeqCst);
            record.status = DeliveryStatus::Processing;
            record.attempts += 1;
            record.claim_id = Some(format!("claim_{}", n));
            record.next_attempt_at = Some(now + chrono::Duration::from_std(lease).unwrap());
            Ok(ClaimOutcome {
                record: record.clone(),
                claimed: true,
            })
        }

        async fn complete(&self, claim_id: &str, _now: DateTime<Utc>) -> ServiceResult<()> {
            let mut rows = self.rows.lock().unwrap();
            let record = rows
                .values_mut()
                .find(|r| r.claim_id.as_deref() == Some(claim_id))
                .unwrap();
            record.status = DeliveryStatus::Processed;
            record.next_attempt_at = None;
            Ok(())
        }

        async fn fail(
            &self,
            claim_id: &str,
            error: &str,
            next_attempt_at: DateTime<Utc>,
            max_attempts: u32,
            _now: DateTime<Utc>,
        ) -> ServiceResult<DeliveryRecord> {
            let mut rows = self.rows.lock().unwrap();
            let record = rows
                .values_mut()
                .find(|r| r.claim_id.as_deref() == Some(claim_id))
                .unwrap();
            record.last_error = Some(error.to_string());
            if record.attempts >= max_attempts {
                record.status = DeliveryStatus::Dead;
                record.next_attempt_at = None;
            } else {
                record.status = DeliveryStatus::RetryReady;
                record.next_attempt_at = Some(next_attempt_at);
            }
            Ok(record.clone())
        }

        async fn get(
            &self,
            provider_id: &str,
            delivery_id: &str,
        ) -> ServiceResult<Option<DeliveryRecord>> {
            Ok(self
                .rows
                .lock()
                .unwrap()
                .get(&(provider_id.to_string(), delivery_id.to_string()))
                .cloned())
        }

        async fn status_counts(&self) -> ServiceResult<BTreeMap<String, u64>> {
            Ok(BTreeMap::new())
        }
    }

    struct FailFirst(AtomicUsize);

    #[async_trait]
    impl InboundHandler for FailFirst {
        async fn handle(&self, _request: &InboundRequest) -> ServiceResult<InboundResponse> {
            if self.0.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(ServiceError::internal("transient"));
            }
            Ok(InboundResponse::accepted(json!({ "ok": true })))
        }
    }

    fn processor(ledger: Arc<MemoryLedger>, handler: Arc<FailFirst>, max_attempts: u32) -> WebhookProcessor {
        let handlers = Arc::new(HandlerRegistry::new());
        handlers.register(Surface::Webhook, handler);
        let config = WebhookConfig {
            claim_lease_ms: 1000,
            max_attempts,
            ..WebhookConfig::default()
        };
        WebhookProcessor::new(ledger, Arc::new(VerifierRegistry::new()), handlers, &config)
    }

    fn request() -> InboundRequest {
        let mut headers = HeaderMap::new();
        headers.insert("x-delivery-id", HeaderValue::from_static("d-1"));
        InboundRequest::new("github", Surface::Webhook, headers, Bytes::from_static(b"{}"))
    }

    #[tokio::test]
    async fn failed_delivery_dedupes_until_lease_elapses() {
        let ledger = Arc::new(MemoryLedger::default());
        let handler = Arc::new(FailFirst(AtomicUsize::new(0)));
        let processor = processor(ledger.clone(), handler.clone(), 8);

        let err = processor.process(request()).await.unwrap_err();
        assert_eq!(crate::error::map_error(&err).status.as_u16(), 500);

        let dedupe = processor.process(request()).await.unwrap();
        assert_eq!(dedupe.status, 200);
        assert!(dedupe.duplicate);
        assert_eq!(dedupe.delivery.status, DeliveryStatus::RetryReady);

        let later = Utc::now() + chrono::Duration::seconds(2);
        let outcome = processor.process_at(request(), later).await.unwrap();
        assert_eq!(outcome.status, 202);
        assert_eq!(outcome.delivery.status, DeliveryStatus::Processed);
        assert_eq!(outcome.delivery.attempts, 2);
        assert_eq!(handler.0.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn exhausted_attempts_go_dead() {
        let ledger = Arc::new(MemoryLedger::default());
        let handler = Arc::new(FailFirst(AtomicUsize::new(0)));
        let processor = processor(ledger.clone(), handler, 1);

        processor.process(request()).await.unwrap_err();
        let record = ledger.get("github", "d-1").await.unwrap().unwrap();
        assert_eq!(record.status, DeliveryStatus::Dead);
        assert!(record.next_attempt_at.is_none());

        let later = Utc::now() + chrono::Duration::hours(2);
        let outcome = processor.process_at(request(), later).await.unwrap();
        assert!(outcome.duplicate);
    }

    #[test]
    fn handler_status_is_preserved() {
        let err = handler_failure(ServiceError::from_status(
            axum::http::StatusCode::BAD_GATEWAY,
            "upstream",
        ));
        assert_eq!(err.code, Some(502));
        assert_eq!(handler_failure(ServiceError::internal("x")).code, Some(500));
        assert_eq!(handler_failure(ServiceError::validation("x")).code, None);
    }
}
