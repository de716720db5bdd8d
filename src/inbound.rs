//! # Inbound Dispatcher
//!
//! Routes verified provider traffic (webhooks, slash commands, interactive
//! payloads, event callbacks) to handlers keyed by surface. Each message is
//! claimed once per `(provider, surface, message_id)` for the configured TTL.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use axum::body::Bytes;
use axum::http::HeaderMap;
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use utoipa::ToSchema;

use crate::config::InboundConfig;
use crate::error::{ServiceError, ServiceResult};
use crate::idempotency::{IdempotencyStore, payload_hash};
use crate::webhooks::verify::VerifierRegistry;

/// Headers consulted, in order, for a provider-assigned message id.
const MESSAGE_ID_HEADERS: &[&str] = &[
    "x-delivery-id",
    "x-github-delivery",
    "x-message-id",
    "x-slack-request-id",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Surface {
    Webhook,
    Command,
    Interaction,
    EventCallback,
}

impl Surface {
    pub fn as_str(&self) -> &'static str {
        match self {
            Surface::Webhook => "webhook",
            Surface::Command => "command",
            Surface::Interaction => "interaction",
            Surface::EventCallback => "event_callback",
        }
    }
}

impl fmt::Display for Surface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Surface {
    type Err = ServiceError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "webhook" => Ok(Surface::Webhook),
            "command" => Ok(Surface::Command),
            "interaction" => Ok(Surface::Interaction),
            "event_callback" => Ok(Surface::EventCallback),
            other => Err(ServiceError::validation(format!(
                "unsupported inbound surface '{}'",
                other
            ))),
        }
    }
}

/// A raw provider request as received on the wire.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub provider_id: String,
    pub surface: Surface,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl InboundRequest {
    pub fn new(provider_id: &str, surface: Surface, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            provider_id: provider_id.trim().to_string(),
            surface,
            headers,
            body,
        }
    }

    /// Provider-assigned message id, falling back to the body hash.
    pub fn message_id(&self) -> String {
        MESSAGE_ID_HEADERS
            .iter()
            .find_map(|name| {
                self.headers
                    .get(*name)
                    .and_then(|value| value.to_str().ok())
                    .map(str::trim)
                    .filter(|value| !value.is_empty())
            })
            .map(str::to_string)
            .unwrap_or_else(|| payload_hash(&self.body))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct InboundResponse {
    pub status: u16,
    pub handled: bool,
    #[serde(default)]
    pub body: Value,
}

impl InboundResponse {
    pub fn accepted(body: Value) -> Self {
        Self {
            status: 202,
            handled: true,
            body,
        }
    }
}

#[async_trait]
pub trait InboundHandler: Send + Sync {
    async fn handle(&self, request: &InboundRequest) -> ServiceResult<InboundResponse>;
}

/// Stand-in for surfaces nobody registered a handler for.
#[derive(Debug, Default)]
pub struct NoopInboundHandler;

#[async_trait]
impl InboundHandler for NoopInboundHandler {
    async fn handle(&self, request: &InboundRequest) -> ServiceResult<InboundResponse> {
        tracing::debug!(
            provider_id = %request.provider_id,
            surface = %request.surface,
            "No inbound handler registered"
        );
        Ok(InboundResponse {
            status: 202,
            handled: false,
            body: json!({}),
        })
    }
}

/// Handlers keyed by surface; shared by the dispatcher and webhook processor.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<BTreeMap<Surface, Arc<dyn InboundHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, surface: Surface, handler: Arc<dyn InboundHandler>) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(surface, handler);
    }

    pub fn get(&self, surface: Surface) -> Arc<dyn InboundHandler> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&surface)
            .cloned()
            .unwrap_or_else(|| Arc::new(NoopInboundHandler))
    }

    pub fn surfaces(&self) -> Vec<Surface> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect()
    }
}

pub struct InboundDispatcher {
    handlers: Arc<HandlerRegistry>,
    verifiers: Arc<VerifierRegistry>,
    claims: IdempotencyStore,
}

impl InboundDispatcher {
    pub fn new(
        handlers: Arc<HandlerRegistry>,
        verifiers: Arc<VerifierRegistry>,
        config: &InboundConfig,
    ) -> Self {
        Self {
            handlers,
            verifiers,
            claims: IdempotencyStore::new(config.key_ttl()),
        }
    }

    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.handlers
    }

    /// Verify, claim, then hand the request to its surface handler.
    pub async fn dispatch(&self, request: InboundRequest) -> ServiceResult<InboundResponse> {
        if let Some(verifier) = self.verifiers.get(&request.provider_id) {
            verifier
                .verify(&request.headers, &request.body)
                .await
                .map_err(|err| {
                    counter!("services_inbound_rejected_total").increment(1);
                    tracing::warn!(
                        provider_id = %request.provider_id,
                        surface = %request.surface,
                        error = %err,
                        "Inbound verification failed"
                    );
                    ServiceError::unauthorized(err.to_string())
                })?;
        }

        let message_id = request.message_id();
        let claim_key = format!(
            "{}|{}|{}",
            request.provider_id, request.surface, message_id
        );
        if !self.claims.claim(&claim_key) {
            counter!("services_inbound_duplicates_total").increment(1);
            return Ok(InboundResponse {
                status: 200,
                handled: false,
                body: json!({ "duplicate": true, "message_id": message_id }),
            });
        }

        let handler = self.handlers.get(request.surface);
        match handler.handle(&request).await {
            Ok(response) => {
                counter!("services_inbound_handled_total").increment(1);
                Ok(response)
            }
            Err(err) => {
                self.claims.release(&claim_key);
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webhooks::verify::{HUB_SIGNATURE_HEADER, HmacSignatureVerifier};
    use axum::http::HeaderValue;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting(AtomicUsize);

    #[async_trait]
    impl InboundHandler for Counting {
        async fn handle(&self, _request: &InboundRequest) -> ServiceResult<InboundResponse> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(InboundResponse::accepted(json!({ "ok": true })))
        }
    }

    fn dispatcher(handlers: Arc<HandlerRegistry>, verifiers: VerifierRegistry) -> InboundDispatcher {
        InboundDispatcher::new(handlers, Arc::new(verifiers), &InboundConfig::default())
    }

    fn request(surface: Surface, message_id: &str) -> InboundRequest {
        let mut headers = HeaderMap::new();
        headers.insert("x-message-id", HeaderValue::from_str(message_id).unwrap());
        InboundRequest::new("slack", surface, headers, Bytes::from_static(b"{}"))
    }

    #[test]
    fn surfaces_parse_with_dashes() {
        assert_eq!("event-callback".parse::<Surface>().unwrap(), Surface::EventCallback);
        assert_eq!("Command".parse::<Surface>().unwrap(), Surface::Command);
        assert!("carrier-pigeon".parse::<Surface>().is_err());
    }

    #[tokio::test]
    async fn unregistered_surfaces_get_noop() {
        let dispatcher = dispatcher(Arc::new(HandlerRegistry::new()), VerifierRegistry::new());
        let response = dispatcher
            .dispatch(request(Surface::Interaction, "m-1"))
            .await
            .unwrap();
        assert_eq!(response.status, 202);
        assert!(!response.handled);
    }

    #[tokio::test]
    async fn duplicate_messages_are_not_redelivered() {
        let counting = Arc::new(Counting(AtomicUsize::new(0)));
        let handlers = Arc::new(HandlerRegistry::new());
        handlers.register(Surface::Command, counting.clone());
        let dispatcher = dispatcher(handlers, VerifierRegistry::new());

        let first = dispatcher.dispatch(request(Surface::Command, "m-1")).await.unwrap();
        assert!(first.handled);
        let second = dispatcher.dispatch(request(Surface::Command, "m-1")).await.unwrap();
        assert_eq!(second.status, 200);
        assert_eq!(second.body["duplicate"], true);
        assert_eq!(counting.0.load(Ordering::SeqCst), 1);

        dispatcher.dispatch(request(Surface::Interaction, "m-1")).await.unwrap();
    }

    #[tokio::test]
    async fn failed_verification_is_unauthorized() {
        let verifiers = VerifierRegistry::new();
        verifiers.register("slack", Arc::new(HmacSignatureVerifier::new("secret")));
        let dispatcher = dispatcher(Arc::new(HandlerRegistry::new()), verifiers);

        let mut bad = request(Surface::Webhook, "m-2");
        bad.headers
            .insert(HUB_SIGNATURE_HEADER, HeaderValue::from_static("sha256=00"));
        let err = dispatcher.dispatch(bad).await.unwrap_err();
        assert_eq!(err.category, crate::error::ErrorCategory::Auth);
    }
}
