//! # Route Gate
//!
//! Per-route middleware enforcing the route's permission and, for mutating
//! routes, client idempotency keyed on `Idempotency-Key`.

use axum::{
    body::{Body, Bytes, to_bytes},
    extract::{OriginalUri, Request, State},
    http::{HeaderMap, HeaderValue, Method, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use metrics::counter;

use crate::auth::ActorContext;
use crate::error::{ApiError, ServiceError};
use crate::idempotency::{IDEMPOTENCY_KEY_HEADER, ReplayOutcome, payload_hash, scoped_key};
use crate::server::AppState;

/// Largest request or response body buffered for replay.
const MAX_BUFFERED_BODY: usize = 4 * 1024 * 1024;

pub const REPLAYED_HEADER: &str = "idempotent-replayed";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Idempotency {
    /// Mutations honour `Idempotency-Key` replay and conflict detection.
    Client,
    /// The surface dedupes on its own (webhooks, inbound ingress).
    Skip,
}

#[derive(Clone)]
pub struct RouteGate {
    pub state: AppState,
    pub permission: &'static str,
    pub idempotency: Idempotency,
}

/// Trimmed `Idempotency-Key` header, if present.
pub fn idempotency_key(headers: &HeaderMap) -> Option<String> {
    headers
        .get(IDEMPOTENCY_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn is_mutating(method: &Method) -> bool {
    !matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS)
}

pub async fn route_gate(
    State(gate): State<RouteGate>,
    actor: ActorContext,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let path = request
        .extensions()
        .get::<OriginalUri>()
        .map(|uri| uri.path().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());

    if !gate
        .state
        .authorizer
        .can(&actor, gate.permission, &path)
        .await
    {
        counter!("services_authz_denied_total", "permission" => gate.permission).increment(1);
        tracing::info!(
            actor = %actor.key(),
            permission = gate.permission,
            path = %path,
            "Permission denied"
        );
        return Err(ServiceError::forbidden(format!(
            "missing permission {}",
            gate.permission
        ))
        .into());
    }

    if gate.idempotency == Idempotency::Skip || !is_mutating(request.method()) {
        return Ok(next.run(request).await);
    }

    let Some(key) = idempotency_key(request.headers()) else {
        if gate.state.config.api.require_idempotency_key {
            return Err(ServiceError::validation("Idempotency-Key header is required").into());
        }
        return Ok(next.run(request).await);
    };

    let (parts, body) = request.into_parts();
    let body = to_bytes(body, MAX_BUFFERED_BODY)
        .await
        .map_err(|e| ServiceError::validation(format!("unable to read request body: {}", e)))?;
    let hash = payload_hash(&body);
    let scoped = scoped_key(parts.method.as_str(), &path, actor.key(), &key);

    match gate.state.idempotency.replay_if_match(&scoped, &hash) {
        ReplayOutcome::Replay { status, body } => Ok(replayed(status, body)),
        ReplayOutcome::Conflict => Err(ServiceError::conflict(
            "Idempotency-Key was already used with a different payload",
        )
        .into()),
        ReplayOutcome::Miss => {
            let response = next
                .run(Request::from_parts(parts, Body::from(body)))
                .await;
            if !response.status().is_success() {
                return Ok(response);
            }
            let (parts, body) = response.into_parts();
            let bytes: Bytes = to_bytes(body, MAX_BUFFERED_BODY)
                .await
                .map_err(|e| ServiceError::internal(format!("unable to buffer response: {}", e)))?;
            gate.state
                .idempotency
                .store(&scoped, &hash, parts.status.as_u16(), &bytes);
            Ok(Response::from_parts(parts, Body::from(bytes)))
        }
    }
}

fn replayed(status: u16, body: Vec<u8>) -> Response {
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::OK);
    let mut response = (status, body).into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    headers.insert(REPLAYED_HEADER, HeaderValue::from_static("true"));
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_keys_are_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert(IDEMPOTENCY_KEY_HEADER, HeaderValue::from_static("  "));
        assert_eq!(idempotency_key(&headers), None);
        headers.insert(IDEMPOTENCY_KEY_HEADER, HeaderValue::from_static(" k-1 "));
        assert_eq!(idempotency_key(&headers).as_deref(), Some("k-1"));
    }

    #[test]
    fn only_unsafe_methods_mutate() {
        assert!(is_mutating(&Method::POST));
        assert!(is_mutating(&Method::DELETE));
        assert!(!is_mutating(&Method::GET));
        assert!(!is_mutating(&Method::HEAD));
    }
}
