//! # Webhook and Inbound Ingress Handlers
//!
//! Both surfaces skip client idempotency: webhooks dedupe through the claim
//! ledger, inbound requests through the dispatcher's message-id claims.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};

use super::accepted;
use super::gate::idempotency_key;
use crate::error::ApiError;
use crate::inbound::{InboundRequest, InboundResponse, Surface};
use crate::server::AppState;
use crate::webhooks::WebhookOutcome;
use crate::worker::QueuedJob;

fn status_or(status: u16, fallback: StatusCode) -> StatusCode {
    StatusCode::from_u16(status).unwrap_or(fallback)
}

/// Receives a provider webhook
#[utoipa::path(
    post,
    path = "/webhooks/{provider}",
    params(("provider" = String, Path, description = "Provider id")),
    request_body(content = String, description = "Raw provider payload"),
    responses(
        (status = 202, description = "Processed, or queued when the worker is enabled", body = WebhookOutcome),
        (status = 200, description = "Duplicate delivery", body = WebhookOutcome),
        (status = 401, description = "Signature verification failed", body = ApiError),
        (status = 500, description = "Handler failed; delivery will be retried", body = ApiError)
    ),
    tag = "services"
)]
pub async fn receive_webhook(
    State(state): State<AppState>,
    Path(provider_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let request = InboundRequest::new(&provider_id, Surface::Webhook, headers, body);
    if state.worker.is_enabled() {
        // Unverified requests must not take the delivery's dedupe key.
        state.webhooks.verify(&request).await?;
        let key = idempotency_key(&request.headers).or_else(|| Some(request.message_id()));
        let job: QueuedJob = state.worker.enqueue_webhook(&request, key).await?;
        return Ok(accepted(job));
    }
    let outcome = state.webhooks.process(request).await?;
    Ok((status_or(outcome.status, StatusCode::ACCEPTED), Json(outcome)).into_response())
}

/// Receives a command, interaction or event callback
#[utoipa::path(
    post,
    path = "/inbound/{provider}/{surface}",
    params(
        ("provider" = String, Path, description = "Provider id"),
        ("surface" = Surface, Path, description = "Inbound surface")
    ),
    request_body(content = String, description = "Raw provider payload"),
    responses(
        (status = 202, description = "Dispatched", body = InboundResponse),
        (status = 200, description = "Duplicate message", body = InboundResponse),
        (status = 401, description = "Signature verification failed", body = ApiError)
    ),
    tag = "services"
)]
pub async fn receive_inbound(
    State(state): State<AppState>,
    Path((provider_id, surface)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let surface: Surface = surface.parse()?;
    let response = state
        .inbound
        .dispatch(InboundRequest::new(&provider_id, surface, headers, body))
        .await?;
    Ok((status_or(response.status, StatusCode::ACCEPTED), Json(response)).into_response())
}
