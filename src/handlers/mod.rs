//! # API Handlers
//!
//! HTTP endpoints of the services plane. Routes are assembled in
//! [`crate::server`]; every services route runs behind [`gate::route_gate`].

use axum::{
    body::Bytes,
    extract::{FromRequest, Request, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::de::DeserializeOwned;
use serde_json::json;

use crate::error::{ApiError, ServiceError};
use crate::models::ServiceInfo;
use crate::server::AppState;
use crate::worker::QueuedJob;

pub mod activity;
pub mod capabilities;
pub mod connections;
pub mod gate;
pub mod installations;
pub mod providers;
pub mod status;
pub mod subscriptions;
pub mod sync;
pub mod webhooks;
pub mod workflow;

/// Root handler that returns basic service information
#[utoipa::path(
    get,
    path = "/",
    responses(
        (status = 200, description = "Service information", body = ServiceInfo)
    ),
    tag = "root"
)]
pub async fn root() -> Json<ServiceInfo> {
    Json(ServiceInfo::default())
}

/// Liveness probe
#[utoipa::path(
    get,
    path = "/healthz",
    responses((status = 200, description = "Process is up")),
    tag = "root"
)]
pub async fn healthz() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

/// Readiness probe: pings the database
#[utoipa::path(
    get,
    path = "/readyz",
    responses(
        (status = 200, description = "Database reachable"),
        (status = 503, description = "Database unavailable", body = ApiError)
    ),
    tag = "root"
)]
pub async fn readyz(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    crate::db::health_check(&state.repos.db).await.map_err(|err| {
        tracing::warn!(error = %err, "Readiness check failed");
        ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "provider_unavailable",
            "database is unavailable",
        )
    })?;
    Ok(Json(json!({ "status": "ready" })))
}

/// `202 Accepted` reply for work handed to the job queue.
pub fn accepted(job: QueuedJob) -> Response {
    (StatusCode::ACCEPTED, Json(job)).into_response()
}

async fn read_body<S: Send + Sync>(request: Request, state: &S) -> Result<Bytes, ApiError> {
    Bytes::from_request(request, state)
        .await
        .map_err(|err| ServiceError::validation(err.body_text()).into())
}

fn parse_body<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ApiError> {
    serde_json::from_slice(bytes)
        .map_err(|err| ServiceError::validation(format!("invalid JSON body: {}", err)).into())
}

fn is_blank(bytes: &[u8]) -> bool {
    bytes.iter().all(u8::is_ascii_whitespace)
}

/// JSON body whose rejections use the error envelope.
pub struct JsonBody<T>(pub T);

impl<S, T> FromRequest<S> for JsonBody<T>
where
    S: Send + Sync,
    T: DeserializeOwned,
{
    type Rejection = ApiError;

    async fn from_request(request: Request, state: &S) -> Result<Self, Self::Rejection> {
        let bytes = read_body(request, state).await?;
        if is_blank(&bytes) {
            return Err(ServiceError::validation("request body is required").into());
        }
        parse_body(&bytes).map(Self)
    }
}

/// JSON body that falls back to `T::default()` when empty.
pub struct OptionalJson<T>(pub T);

impl<S, T> FromRequest<S> for OptionalJson<T>
where
    S: Send + Sync,
    T: DeserializeOwned + Default,
{
    type Rejection = ApiError;

    async fn from_request(request: Request, state: &S) -> Result<Self, Self::Rejection> {
        let bytes = read_body(request, state).await?;
        if is_blank(&bytes) {
            return Ok(Self(T::default()));
        }
        parse_body(&bytes).map(Self)
    }
}

#[cfg(test)]
mod tests;
