//! # Incremental Sync Handlers

use axum::{
    extract::{Path, State},
    http::HeaderMap,
    response::{IntoResponse, Json, Response},
};
use serde::Deserialize;
use serde_json::Value;
use utoipa::ToSchema;

use super::gate::idempotency_key;
use super::{OptionalJson, accepted};
use crate::error::ApiError;
use crate::server::AppState;
use crate::sync::{SyncRequest, SyncRunReport, SyncStatus};
use crate::worker::QueuedJob;

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct SyncRunBody {
    pub provider_id: Option<String>,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    #[serde(default)]
    pub metadata: Value,
    /// Start over a job that exhausted its attempts.
    #[serde(default)]
    pub restart: bool,
}

/// Runs an incremental sync for a connection, inline or on the worker queue
#[utoipa::path(
    post,
    path = "/sync/{ref}/run",
    params(("ref" = String, Path, description = "Connection id")),
    request_body = SyncRunBody,
    responses(
        (status = 200, description = "Sync run finished", body = SyncRunReport),
        (status = 202, description = "Sync queued", body = QueuedJob),
        (status = 409, description = "Sync job exhausted its attempts", body = ApiError)
    ),
    tag = "services"
)]
pub async fn run_sync(
    State(state): State<AppState>,
    Path(connection_id): Path<String>,
    headers: HeaderMap,
    OptionalJson(body): OptionalJson<SyncRunBody>,
) -> Result<Response, ApiError> {
    let request = SyncRequest {
        connection_id,
        provider_id: body.provider_id,
        resource_type: body.resource_type,
        resource_id: body.resource_id,
        metadata: body.metadata,
        restart: body.restart,
    };
    if state.worker.is_enabled() {
        let job = state
            .worker
            .enqueue_sync(&request, idempotency_key(&headers))
            .await?;
        return Ok(accepted(job));
    }
    let report = state.sync.start_incremental(request).await?;
    Ok(Json(report).into_response())
}

#[utoipa::path(
    get,
    path = "/sync/{ref}/status",
    params(("ref" = String, Path, description = "Connection id")),
    responses(
        (status = 200, description = "Sync jobs for the connection", body = SyncStatus),
        (status = 404, description = "Not found", body = ApiError)
    ),
    tag = "services"
)]
pub async fn sync_status(
    State(state): State<AppState>,
    Path(connection_id): Path<String>,
) -> Result<Json<SyncStatus>, ApiError> {
    Ok(Json(state.sync.sync_status(&connection_id).await?))
}
