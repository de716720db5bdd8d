//! # Worker Runtime
//!
//! Bridges the HTTP surface and an external job scheduler. [`WorkerClient`]
//! serializes job parameters into [`ExecutionMessage`]s; [`WorkerRuntime`]
//! executes them. Concurrent executions are safe: every job funnels into
//! stores that claim or upsert atomically.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use axum::body::Bytes;
use axum::http::{HeaderMap, HeaderName, HeaderValue};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{info, instrument, warn};
use utoipa::ToSchema;

use crate::error::{ServiceError, ServiceResult};
use crate::inbound::{InboundRequest, Surface};
use crate::lifecycle::{ActivityRuntime, OutboxDispatcher};
use crate::models::new_id;
use crate::service::ServicesFacade;
use crate::sync::{SyncOrchestrator, SyncRequest};
use crate::webhooks::WebhookProcessor;

pub mod jobs {
    pub const REFRESH: &str = "services.refresh";
    pub const SUBSCRIPTION_RENEW: &str = "services.subscription.renew";
    pub const SYNC_INCREMENTAL: &str = "services.sync.incremental";
    pub const OUTBOX_DISPATCH: &str = "services.outbox.dispatch";
    pub const WEBHOOK_PROCESS: &str = "services.webhook.process";
    pub const ACTIVITY_RETENTION: &str = "services.activity.retention.run";
}

/// A serialized job handed to the scheduler and back to [`WorkerRuntime`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ExecutionMessage {
    pub id: String,
    pub job_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    pub parameters: Value,
    pub enqueued_at: DateTime<Utc>,
}

impl ExecutionMessage {
    pub fn new(job_id: &str, parameters: Value, idempotency_key: Option<String>) -> Self {
        Self {
            id: new_id("job"),
            job_id: job_id.to_string(),
            idempotency_key: idempotency_key.filter(|k| !k.trim().is_empty()),
            parameters,
            enqueued_at: Utc::now(),
        }
    }

    fn param_str(&self, key: &str) -> Option<&str> {
        self.parameters
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }

    fn require_str(&self, key: &str) -> ServiceResult<&str> {
        self.param_str(key).ok_or_else(|| {
            ServiceError::validation(format!("job {} requires parameter '{}'", self.job_id, key))
        })
    }
}

/// Reply for a queued request: `{queued: true, job_id}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct QueuedJob {
    pub queued: bool,
    pub job_id: String,
    pub message_id: String,
}

#[async_trait]
pub trait JobEnqueuer: Send + Sync {
    /// Returns the stored message; a repeated `(job_id, idempotency_key)`
    /// returns the first message instead of storing another.
    async fn enqueue(&self, message: ExecutionMessage) -> ServiceResult<ExecutionMessage>;
}

/// In-process queue with keyed dedupe. Drained by tests or a local loop.
#[derive(Debug, Default)]
pub struct MemoryJobQueue {
    messages: Mutex<Vec<ExecutionMessage>>,
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<ExecutionMessage> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn job_ids(&self) -> Vec<String> {
        self.messages().into_iter().map(|m| m.job_id).collect()
    }

    pub fn drain(&self) -> Vec<ExecutionMessage> {
        std::mem::take(&mut *self.messages.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

#[async_trait]
impl JobEnqueuer for MemoryJobQueue {
    async fn enqueue(&self, message: ExecutionMessage) -> ServiceResult<ExecutionMessage> {
        let mut messages = self.messages.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(key) = &message.idempotency_key
            && let Some(existing) = messages
                .iter()
                .find(|m| m.job_id == message.job_id && m.idempotency_key.as_ref() == Some(key))
        {
            return Ok(existing.clone());
        }
        messages.push(message.clone());
        Ok(message)
    }
}

/// Builds and enqueues execution messages when queueing is enabled.
#[derive(Clone)]
pub struct WorkerClient {
    enqueuer: Option<Arc<dyn JobEnqueuer>>,
    enabled: bool,
}

impl WorkerClient {
    pub fn new(enqueuer: Option<Arc<dyn JobEnqueuer>>, enabled: bool) -> Self {
        Self { enqueuer, enabled }
    }

    pub fn disabled() -> Self {
        Self::new(None, false)
    }

    /// Whether handlers should queue instead of executing inline.
    pub fn is_enabled(&self) -> bool {
        self.enabled && self.enqueuer.is_some()
    }

    async fn enqueue(
        &self,
        job_id: &str,
        parameters: Value,
        idempotency_key: Option<String>,
    ) -> ServiceResult<QueuedJob> {
        let enqueuer = self
            .enqueuer
            .as_ref()
            .ok_or_else(|| ServiceError::internal("job enqueuer is not configured"))?;
        let stored = enqueuer
            .enqueue(ExecutionMessage::new(job_id, parameters, idempotency_key))
            .await?;
        counter!("services_jobs_enqueued_total", "job_id" => job_id.to_string()).increment(1);
        info!(job_id = %stored.job_id, message_id = %stored.id, "Job enqueued");
        Ok(QueuedJob {
            queued: true,
            job_id: stored.job_id,
            message_id: stored.id,
        })
    }

    pub async fn enqueue_refresh(
        &self,
        provider_id: Option<&str>,
        connection_id: &str,
        idempotency_key: Option<String>,
    ) -> ServiceResult<QueuedJob> {
        self.enqueue(
            jobs::REFRESH,
            json!({ "provider_id": provider_id, "connection_id": connection_id }),
            idempotency_key,
        )
        .await
    }

    pub async fn enqueue_subscription_renew(
        &self,
        subscription_id: &str,
        ttl_seconds: Option<u64>,
        idempotency_key: Option<String>,
    ) -> ServiceResult<QueuedJob> {
        self.enqueue(
            jobs::SUBSCRIPTION_RENEW,
            json!({ "subscription_id": subscription_id, "ttl_seconds": ttl_seconds }),
            idempotency_key,
        )
        .await
    }

    pub async fn enqueue_sync(
        &self,
        request: &SyncRequest,
        idempotency_key: Option<String>,
    ) -> ServiceResult<QueuedJob> {
        let parameters =
            serde_json::to_value(request).map_err(|e| ServiceError::internal(e.to_string()))?;
        self.enqueue(jobs::SYNC_INCREMENTAL, parameters, idempotency_key)
            .await
    }

    pub async fn enqueue_outbox_dispatch(
        &self,
        idempotency_key: Option<String>,
    ) -> ServiceResult<QueuedJob> {
        self.enqueue(jobs::OUTBOX_DISPATCH, json!({}), idempotency_key)
            .await
    }

    pub async fn enqueue_retention(&self, idempotency_key: Option<String>) -> ServiceResult<QueuedJob> {
        self.enqueue(jobs::ACTIVITY_RETENTION, json!({}), idempotency_key)
            .await
    }

    /// Queue a raw webhook; the body travels base64-encoded with its headers.
    pub async fn enqueue_webhook(
        &self,
        request: &InboundRequest,
        idempotency_key: Option<String>,
    ) -> ServiceResult<QueuedJob> {
        self.enqueue(
            jobs::WEBHOOK_PROCESS,
            json!({
                "provider_id": request.provider_id,
                "headers": headers_to_map(&request.headers),
                "body": BASE64.encode(&request.body),
            }),
            idempotency_key,
        )
        .await
    }
}

/// Every value of a repeated header is kept, in order.
fn headers_to_map(headers: &HeaderMap) -> BTreeMap<String, Vec<String>> {
    let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            map.entry(name.as_str().to_string())
                .or_default()
                .push(value.to_string());
        }
    }
    map
}

/// Accepts a single string or a list of strings per header name.
fn headers_from_value(value: Option<&Value>) -> ServiceResult<HeaderMap> {
    let mut headers = HeaderMap::new();
    let Some(Value::Object(map)) = value else {
        return Ok(headers);
    };
    for (name, values) in map {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| ServiceError::validation(format!("invalid header name: {}", e)))?;
        let values: Vec<&str> = match values {
            Value::String(value) => vec![value.as_str()],
            Value::Array(items) => items.iter().filter_map(Value::as_str).collect(),
            _ => continue,
        };
        for value in values {
            let value = HeaderValue::from_str(value)
                .map_err(|e| ServiceError::validation(format!("invalid header value: {}", e)))?;
            headers.append(name.clone(), value);
        }
    }
    Ok(headers)
}

/// Executes [`ExecutionMessage`]s against the runtime components.
pub struct WorkerRuntime {
    facade: Arc<ServicesFacade>,
    sync: Arc<SyncOrchestrator>,
    dispatcher: Arc<OutboxDispatcher>,
    activity: Arc<ActivityRuntime>,
    webhooks: Arc<WebhookProcessor>,
}

impl WorkerRuntime {
    pub fn new(
        facade: Arc<ServicesFacade>,
        sync: Arc<SyncOrchestrator>,
        dispatcher: Arc<OutboxDispatcher>,
        activity: Arc<ActivityRuntime>,
        webhooks: Arc<WebhookProcessor>,
    ) -> Self {
        Self {
            facade,
            sync,
            dispatcher,
            activity,
            webhooks,
        }
    }

    /// Run one message and return its JSON result.
    #[instrument(skip(self, message), fields(job_id = %message.job_id, message_id = %message.id))]
    pub async fn handle_execution_message(&self, message: &ExecutionMessage) -> ServiceResult<Value> {
        let result = self.execute(message).await;
        let outcome = if result.is_ok() { "ok" } else { "error" };
        counter!(
            "services_jobs_executed_total",
            "job_id" => message.job_id.clone(),
            "outcome" => outcome
        )
        .increment(1);
        if let Err(err) = &result {
            warn!(error = %err, "Job execution failed");
        }
        result
    }

    async fn execute(&self, message: &ExecutionMessage) -> ServiceResult<Value> {
        match message.job_id.as_str() {
            jobs::REFRESH => {
                let connection_id = message.require_str("connection_id")?;
                let result = self
                    .facade
                    .refresh(message.param_str("provider_id"), connection_id)
                    .await?;
                to_json(&result)
            }
            jobs::SUBSCRIPTION_RENEW => {
                let subscription_id = message.require_str("subscription_id")?;
                let ttl = message.parameters.get("ttl_seconds").and_then(Value::as_u64);
                let result = self.facade.renew_subscription(subscription_id, ttl).await?;
                to_json(&result)
            }
            jobs::SYNC_INCREMENTAL => {
                let request: SyncRequest = serde_json::from_value(message.parameters.clone())
                    .map_err(|e| ServiceError::validation(format!("invalid sync parameters: {}", e)))?;
                let report = self.sync.start_incremental(request).await?;
                to_json(&report)
            }
            jobs::OUTBOX_DISPATCH => {
                let dispatch = self.dispatcher.dispatch_pending().await?;
                let retention = match self.activity.enforce_retention().await {
                    Ok(report) => Some(report),
                    Err(err) => {
                        warn!(error = %err, "Opportunistic activity retention failed");
                        None
                    }
                };
                Ok(json!({ "dispatch": dispatch, "retention": retention }))
            }
            jobs::WEBHOOK_PROCESS => {
                let provider_id = message.require_str("provider_id")?;
                let headers = headers_from_value(message.parameters.get("headers"))?;
                let body = match message.param_str("body") {
                    Some(encoded) => BASE64
                        .decode(encoded)
                        .map_err(|e| ServiceError::validation(format!("invalid webhook body: {}", e)))?,
                    None => Vec::new(),
                };
                let request =
                    InboundRequest::new(provider_id, Surface::Webhook, headers, Bytes::from(body));
                let outcome = self.webhooks.process(request).await?;
                Ok(json!({ "status": outcome.status, "outcome": outcome }))
            }
            jobs::ACTIVITY_RETENTION => {
                let report = self.activity.enforce_retention().await?;
                to_json(&report)
            }
            other => Err(ServiceError::validation(format!("unknown job id '{}'", other))),
        }
    }
}

fn to_json<T: Serialize>(value: &T) -> ServiceResult<Value> {
    serde_json::to_value(value).map_err(|e| ServiceError::internal(e.to_string()))
}
