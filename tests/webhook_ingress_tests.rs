//! Integration tests for webhook and inbound ingress: signature checks,
//! delivery dedupe and retry after a failed handler.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::http::StatusCode;
use serde_json::json;
use services_plane::error::{ServiceError, ServiceResult};
use services_plane::inbound::{HandlerRegistry, InboundHandler, InboundRequest, InboundResponse, Surface};
use services_plane::webhooks::verify::HmacSignatureVerifier;
use services_plane::worker::MemoryJobQueue;

#[path = "test_utils/mod.rs"]
mod test_utils;
use test_utils::{SERVICES, TestApp, test_config};

const SECRET: &str = "gh-webhook-secret";

/// Fails the first `failures` calls, then accepts.
struct FlakyHandler {
    failures: usize,
    calls: AtomicUsize,
}

impl FlakyHandler {
    fn new(failures: usize) -> Arc<Self> {
        Arc::new(Self {
            failures,
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InboundHandler for FlakyHandler {
    async fn handle(&self, request: &InboundRequest) -> ServiceResult<InboundResponse> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(ServiceError::internal("downstream unavailable"));
        }
        let payload: serde_json::Value =
            serde_json::from_slice(&request.body).unwrap_or_default();
        Ok(InboundResponse::accepted(json!({ "action": payload["action"] })))
    }
}

async fn github_app(handler: Arc<FlakyHandler>, lease_ms: u64) -> TestApp {
    let mut config = test_config();
    config.webhook.claim_lease_ms = lease_ms;
    config.webhook.max_attempts = 8;
    config
        .webhook
        .signing_secrets
        .insert("github".to_string(), SECRET.to_string());

    let handlers = Arc::new(HandlerRegistry::new());
    handlers.register(Surface::Webhook, handler);
    TestApp::build(config, move |builder| builder.handlers(handlers)).await
}

#[tokio::test]
async fn test_failed_delivery_is_deduped_until_retry_is_due() {
    let handler = FlakyHandler::new(1);
    let app = github_app(handler.clone(), 1000).await;
    let body = br#"{"action":"opened"}"#;
    let signature = HmacSignatureVerifier::sign(SECRET, body);
    let headers = [
        ("x-hub-signature-256", signature.as_str()),
        ("x-delivery-id", "delivery-1"),
        ("content-type", "application/json"),
    ];
    let uri = format!("{SERVICES}/webhooks/github");

    let failed = app.post_raw(&uri, &headers, body).await;
    assert_eq!(failed.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(failed.error_code(), "internal_error");
    assert_eq!(failed.json()["error"]["retryable"], true);

    let duplicate = app.post_raw(&uri, &headers, body).await;
    assert_eq!(duplicate.status, StatusCode::OK);
    let record = duplicate.json();
    assert_eq!(record["duplicate"], true);
    assert_eq!(record["delivery"]["status"], "retry_ready");
    assert_eq!(record["delivery"]["attempts"], 1);
    assert!(record["delivery"]["next_attempt_at"].is_string());
    assert_eq!(handler.calls(), 1);

    tokio::time::sleep(Duration::from_millis(1100)).await;

    let retried = app.post_raw(&uri, &headers, body).await;
    assert_eq!(retried.status, StatusCode::ACCEPTED, "{}", retried.text());
    let outcome = retried.json();
    assert_eq!(outcome["duplicate"], false);
    assert_eq!(outcome["delivery"]["status"], "processed");
    assert_eq!(outcome["delivery"]["attempts"], 2);
    assert_eq!(outcome["response"]["body"]["action"], "opened");
    assert_eq!(handler.calls(), 2);

    let after = app.post_raw(&uri, &headers, body).await;
    assert_eq!(after.status, StatusCode::OK);
    assert_eq!(after.json()["delivery"]["status"], "processed");
    assert_eq!(handler.calls(), 2);
}

#[tokio::test]
async fn test_bad_or_missing_signature_is_unauthorized() {
    let handler = FlakyHandler::new(0);
    let app = github_app(handler.clone(), 30_000).await;
    let body = br#"{"action":"closed"}"#;
    let uri = format!("{SERVICES}/webhooks/github");

    let forged = HmacSignatureVerifier::sign("not-the-secret", body);
    let rejected = app
        .post_raw(&uri, &[("x-hub-signature-256", forged.as_str())], body)
        .await;
    assert_eq!(rejected.status, StatusCode::UNAUTHORIZED);
    assert_eq!(rejected.error_code(), "unauthorized");

    let unsigned = app.post_raw(&uri, &[], body).await;
    assert_eq!(unsigned.status, StatusCode::UNAUTHORIZED);

    assert_eq!(handler.calls(), 0);
}

#[tokio::test]
async fn test_queued_delivery_is_verified_before_it_takes_the_dedupe_key() {
    let handler = FlakyHandler::new(0);
    let queue = Arc::new(MemoryJobQueue::new());
    let mut config = test_config();
    config.worker.enqueue_enabled = true;
    config
        .webhook
        .signing_secrets
        .insert("github".to_string(), SECRET.to_string());
    let handlers = Arc::new(HandlerRegistry::new());
    handlers.register(Surface::Webhook, handler.clone());
    let app = TestApp::build(config, {
        let queue = queue.clone();
        move |builder| builder.handlers(handlers).enqueuer(queue)
    })
    .await;
    let body = br#"{"action":"opened"}"#;
    let uri = format!("{SERVICES}/webhooks/github");

    let forged = HmacSignatureVerifier::sign("not-the-secret", body);
    let rejected = app
        .post_raw(
            &uri,
            &[("x-hub-signature-256", forged.as_str()), ("x-delivery-id", "d-1")],
            body,
        )
        .await;
    assert_eq!(rejected.status, StatusCode::UNAUTHORIZED);
    assert!(queue.messages().is_empty());

    let signature = HmacSignatureVerifier::sign(SECRET, body);
    let genuine = app
        .post_raw(
            &uri,
            &[("x-hub-signature-256", signature.as_str()), ("x-delivery-id", "d-1")],
            body,
        )
        .await;
    assert_eq!(genuine.status, StatusCode::ACCEPTED, "{}", genuine.text());
    assert_eq!(genuine.json()["queued"], true);

    let messages = queue.drain();
    assert_eq!(messages.len(), 1);
    let processed = app
        .state
        .runtime
        .handle_execution_message(&messages[0])
        .await
        .expect("genuine delivery");
    assert_eq!(processed["status"], 202);
    assert_eq!(processed["outcome"]["delivery"]["delivery_id"], "d-1");
    assert_eq!(handler.calls(), 1);
}

#[tokio::test]
async fn test_delivery_id_falls_back_to_body_hash() {
    let handler = FlakyHandler::new(0);
    let app = TestApp::build(test_config(), {
        let handlers = Arc::new(HandlerRegistry::new());
        handlers.register(Surface::Webhook, handler.clone());
        move |builder| builder.handlers(handlers)
    })
    .await;
    let uri = format!("{SERVICES}/webhooks/acme");

    let first = app.post_raw(&uri, &[], br#"{"action":"a"}"#).await;
    let repeat = app.post_raw(&uri, &[], br#"{"action":"a"}"#).await;
    let other = app.post_raw(&uri, &[], br#"{"action":"b"}"#).await;

    assert_eq!(first.status, StatusCode::ACCEPTED);
    assert_eq!(repeat.status, StatusCode::OK);
    assert_eq!(repeat.json()["duplicate"], true);
    assert_eq!(
        repeat.json()["delivery"]["delivery_id"],
        first.json()["delivery"]["delivery_id"]
    );
    assert_eq!(other.status, StatusCode::ACCEPTED);
    assert_eq!(handler.calls(), 2);
}

#[tokio::test]
async fn test_unhandled_inbound_surface_is_acknowledged_once() {
    let app = TestApp::new().await;
    let uri = format!("{SERVICES}/inbound/acme/command");
    let body = br#"{"text":"/deploy"}"#;

    let first = app.post_raw(&uri, &[], body).await;
    assert_eq!(first.status, StatusCode::ACCEPTED);
    assert_eq!(first.json()["handled"], false);

    let repeat = app.post_raw(&uri, &[], body).await;
    assert_eq!(repeat.status, StatusCode::OK);
    assert_eq!(repeat.json()["handled"], false);
    assert_eq!(repeat.json()["body"]["duplicate"], true);
}

#[tokio::test]
async fn test_inbound_dispatches_to_registered_handler() {
    let handler = FlakyHandler::new(0);
    let handlers = Arc::new(HandlerRegistry::new());
    handlers.register(Surface::Interaction, handler.clone());
    let app = TestApp::build(test_config(), move |builder| builder.handlers(handlers)).await;

    let response = app
        .post_raw(
            &format!("{SERVICES}/inbound/acme/interaction"),
            &[("x-delivery-id", "msg-1")],
            br#"{"action":"clicked"}"#,
        )
        .await;

    assert_eq!(response.status, StatusCode::ACCEPTED);
    assert_eq!(response.json()["handled"], true);
    assert_eq!(response.json()["body"]["action"], "clicked");
    assert_eq!(handler.calls(), 1);
}

#[tokio::test]
async fn test_unknown_inbound_surface_is_rejected() {
    let app = TestApp::new().await;

    let response = app
        .post_raw(&format!("{SERVICES}/inbound/acme/telepathy"), &[], b"{}")
        .await;

    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert_eq!(response.error_code(), "validation_error");
}
