//! # Activity Handlers

use axum::{
    extract::{Query, State},
    http::HeaderMap,
    response::{IntoResponse, Json, Response},
};
use serde::Deserialize;
use utoipa::{IntoParams, ToSchema};

use super::gate::idempotency_key;
use super::{OptionalJson, accepted};
use crate::error::ApiError;
use crate::lifecycle::activity::{ActivityEntry, ActivityFilter, RetentionReport};
use crate::pagination::{ListEnvelope, ListQuery, compact_filters};
use crate::server::AppState;
use crate::worker::QueuedJob;

#[derive(Debug, Default, Deserialize, IntoParams)]
pub struct ActivityQuery {
    pub provider_id: Option<String>,
    pub scope_type: Option<String>,
    pub scope_id: Option<String>,
    pub connection_id: Option<String>,
    pub action: Option<String>,
    /// `ok` | `error`
    pub status: Option<String>,
}

#[derive(Debug, Default, Deserialize, IntoParams, ToSchema)]
pub struct RetentionRequest {
    /// Queue the run on the worker instead of running inline.
    #[serde(default, rename = "async")]
    pub run_async: Option<bool>,
}

fn non_blank(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Lists activity entries, newest first
#[utoipa::path(
    get,
    path = "/activity",
    params(ActivityQuery, ListQuery),
    responses(
        (status = 200, description = "Activity entries", body = ListEnvelope<ActivityEntry>),
        (status = 403, description = "Forbidden", body = ApiError)
    ),
    tag = "services"
)]
pub async fn list_activity(
    State(state): State<AppState>,
    Query(query): Query<ActivityQuery>,
    Query(list): Query<ListQuery>,
) -> Result<Json<ListEnvelope<ActivityEntry>>, ApiError> {
    let filter = ActivityFilter {
        provider_id: non_blank(&query.provider_id),
        scope_type: non_blank(&query.scope_type),
        scope_id: non_blank(&query.scope_id),
        connection_id: non_blank(&query.connection_id),
        action: non_blank(&query.action),
        status: non_blank(&query.status),
    };
    let page = list.page();
    let (items, total) = state.activity.list(&filter, page.limit, page.offset).await?;
    let filters = compact_filters([
        ("provider_id", query.provider_id.as_ref()),
        ("scope_type", query.scope_type.as_ref()),
        ("scope_id", query.scope_id.as_ref()),
        ("connection_id", query.connection_id.as_ref()),
        ("action", query.action.as_ref()),
        ("status", query.status.as_ref()),
    ]);
    Ok(Json(ListEnvelope::new(items, total, page, filters)))
}

/// Replays buffered entries and applies the retention policy
#[utoipa::path(
    post,
    path = "/activity/retention/cleanup",
    params(RetentionRequest),
    request_body = RetentionRequest,
    responses(
        (status = 200, description = "Retention report", body = RetentionReport),
        (status = 202, description = "Retention run queued", body = QueuedJob)
    ),
    tag = "services"
)]
pub async fn cleanup_activity(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<RetentionRequest>,
    OptionalJson(body): OptionalJson<RetentionRequest>,
) -> Result<Response, ApiError> {
    let run_async = body.run_async.or(query.run_async).unwrap_or(false);
    if run_async && state.worker.is_enabled() {
        let job = state.worker.enqueue_retention(idempotency_key(&headers)).await?;
        return Ok(accepted(job));
    }
    let report = state.activity.enforce_retention().await?;
    Ok(Json(report).into_response())
}
