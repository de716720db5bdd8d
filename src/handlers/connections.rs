//! # Connections API Handlers
//!
//! Connection listing and the OAuth lifecycle: begin, callback, reconsent,
//! refresh and revoke. `:ref` is the provider id on `begin` and `callback`
//! and the connection id everywhere else.

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::{IntoResponse, Json, Response},
};
use serde::Deserialize;
use serde_json::Value;
use utoipa::{IntoParams, ToSchema};

use super::gate::idempotency_key;
use super::{OptionalJson, accepted};
use crate::auth::ActorContext;
use crate::callbacks::CallbackParams;
use crate::error::{ApiError, ServiceError};
use crate::pagination::{ListEnvelope, ListQuery, compact_filters};
use crate::providers::BeginAuthResponse;
use crate::repositories::RecordFilter;
use crate::scope::{ScopeInput, resolve_scope};
use crate::server::AppState;
use crate::service::{
    CallbackRequest, CallbackResult, ConnectRequest, ConnectionDetail, ConnectionView,
    GrantSnapshotView, ReconsentRequest, RefreshResult, RevokeResult,
};
use crate::worker::QueuedJob;

#[derive(Debug, Default, Deserialize, IntoParams)]
pub struct ConnectionFilter {
    pub provider_id: Option<String>,
    pub scope_type: Option<String>,
    pub scope_id: Option<String>,
    /// `active` | `degraded` | `disconnected`
    pub status: Option<String>,
}

impl ConnectionFilter {
    pub(crate) fn record_filter(&self) -> RecordFilter {
        let clean = |v: &Option<String>| {
            v.as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };
        RecordFilter {
            provider_id: clean(&self.provider_id),
            scope_type: clean(&self.scope_type),
            scope_id: clean(&self.scope_id),
            status: clean(&self.status),
            ..RecordFilter::default()
        }
    }

    pub(crate) fn applied(&self) -> std::collections::BTreeMap<String, String> {
        compact_filters([
            ("provider_id", self.provider_id.as_ref()),
            ("scope_type", self.scope_type.as_ref()),
            ("scope_id", self.scope_id.as_ref()),
            ("status", self.status.as_ref()),
        ])
    }
}

/// Body of `begin` requests.
#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct BeginRequest {
    #[serde(flatten)]
    pub scope: ScopeInput,
    /// Defaults to the resolved callback URL for the provider.
    pub redirect_uri: Option<String>,
    pub state: Option<String>,
    #[serde(default)]
    pub requested_grants: Vec<String>,
    #[serde(default)]
    pub metadata: Value,
}

#[derive(Debug, Default, Deserialize, IntoParams)]
pub struct CallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
    pub redirect_uri: Option<String>,
    pub scope_type: Option<String>,
    pub scope_id: Option<String>,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct ReconsentBody {
    pub redirect_uri: Option<String>,
    pub state: Option<String>,
    #[serde(default)]
    pub requested_grants: Vec<String>,
    #[serde(default)]
    pub metadata: Value,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct RefreshBody {
    /// Must match the connection's provider when given.
    pub provider_id: Option<String>,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct RevokeBody {
    pub reason: Option<String>,
}

/// Explicit redirect URI, or the provider's resolved callback URL.
pub(crate) fn redirect_uri_for(
    state: &AppState,
    provider_id: &str,
    explicit: Option<String>,
    headers: &HeaderMap,
) -> Result<String, ApiError> {
    if let Some(uri) = explicit.map(|u| u.trim().to_string()).filter(|u| !u.is_empty()) {
        return Ok(uri);
    }
    let resolution = state
        .callbacks
        .resolve(provider_id, &CallbackParams::default(), Some(headers))?;
    Ok(resolution.url)
}

fn metadata_or_empty(value: Value) -> Value {
    if value.is_null() {
        Value::Object(Default::default())
    } else {
        value
    }
}

/// Lists connections
#[utoipa::path(
    get,
    path = "/connections",
    params(ConnectionFilter, ListQuery),
    responses(
        (status = 200, description = "Connections", body = ListEnvelope<ConnectionView>),
        (status = 403, description = "Forbidden", body = ApiError)
    ),
    tag = "services"
)]
pub async fn list_connections(
    State(state): State<AppState>,
    Query(filter): Query<ConnectionFilter>,
    Query(list): Query<ListQuery>,
) -> Result<Json<ListEnvelope<ConnectionView>>, ApiError> {
    let page = list.page();
    let (items, total) = state
        .facade
        .list_connections(&filter.record_filter(), page)
        .await?;
    Ok(Json(ListEnvelope::new(items, total, page, filter.applied())))
}

/// Connection with its active credential and latest grant snapshot
#[utoipa::path(
    get,
    path = "/connections/{ref}",
    params(("ref" = String, Path, description = "Connection id")),
    responses(
        (status = 200, description = "Connection detail", body = ConnectionDetail),
        (status = 404, description = "Not found", body = ApiError)
    ),
    tag = "services"
)]
pub async fn get_connection(
    State(state): State<AppState>,
    Path(connection_id): Path<String>,
) -> Result<Json<ConnectionDetail>, ApiError> {
    Ok(Json(state.facade.get_connection(&connection_id).await?))
}

/// Starts the provider authorization flow
#[utoipa::path(
    post,
    path = "/connections/{ref}/begin",
    params(("ref" = String, Path, description = "Provider id")),
    request_body = BeginRequest,
    responses(
        (status = 200, description = "Authorization URL", body = BeginAuthResponse),
        (status = 400, description = "Validation error", body = ApiError),
        (status = 409, description = "Idempotency conflict", body = ApiError)
    ),
    tag = "services"
)]
pub async fn begin_connection(
    State(state): State<AppState>,
    Path(provider_id): Path<String>,
    actor: ActorContext,
    headers: HeaderMap,
    Query(query): Query<ScopeInput>,
    OptionalJson(body): OptionalJson<BeginRequest>,
) -> Result<Json<BeginAuthResponse>, ApiError> {
    let scope = resolve_scope(&body.scope, &query, &actor)?;
    let redirect_uri = redirect_uri_for(&state, &provider_id, body.redirect_uri, &headers)?;
    let response = state
        .facade
        .connect(ConnectRequest {
            provider_id,
            scope,
            redirect_uri,
            state: body.state,
            requested_grants: body.requested_grants,
            metadata: metadata_or_empty(body.metadata),
        })
        .await?;
    Ok(Json(response))
}

/// Completes the authorization flow with the provider's code
#[utoipa::path(
    get,
    path = "/connections/{ref}/callback",
    params(("ref" = String, Path, description = "Provider id"), CallbackQuery),
    responses(
        (status = 200, description = "Connection authorized", body = CallbackResult),
        (status = 400, description = "Validation error", body = ApiError),
        (status = 503, description = "Provider unavailable", body = ApiError)
    ),
    tag = "services"
)]
pub async fn connection_callback(
    State(state): State<AppState>,
    Path(provider_id): Path<String>,
    actor: ActorContext,
    headers: HeaderMap,
    Query(query): Query<CallbackQuery>,
) -> Result<Json<CallbackResult>, ApiError> {
    if let Some(error) = query.error.as_deref() {
        let description = query.error_description.as_deref().unwrap_or(error);
        return Err(ServiceError::validation(format!(
            "authorization was not granted: {}",
            description
        ))
        .into());
    }
    let code = query
        .code
        .clone()
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| ServiceError::validation("code is required"))?;
    let oauth_state = query
        .state
        .clone()
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| ServiceError::validation("state is required"))?;
    let scope_input = ScopeInput {
        scope_type: query.scope_type.clone(),
        scope_id: query.scope_id.clone(),
        ..ScopeInput::default()
    };
    let scope = resolve_scope(&ScopeInput::default(), &scope_input, &actor)?;
    let redirect_uri = redirect_uri_for(&state, &provider_id, query.redirect_uri, &headers)?;
    let result = state
        .facade
        .complete_callback(CallbackRequest {
            provider_id,
            scope,
            code,
            state: oauth_state,
            redirect_uri,
            metadata: Value::Object(Default::default()),
        })
        .await?;
    Ok(Json(result))
}

/// Latest grant snapshot for a connection
#[utoipa::path(
    get,
    path = "/connections/{ref}/grants",
    params(("ref" = String, Path, description = "Connection id")),
    responses(
        (status = 200, description = "Grant snapshot", body = GrantSnapshotView),
        (status = 404, description = "Not found", body = ApiError)
    ),
    tag = "services"
)]
pub async fn connection_grants(
    State(state): State<AppState>,
    Path(connection_id): Path<String>,
) -> Result<Json<GrantSnapshotView>, ApiError> {
    Ok(Json(state.facade.grant_snapshot(&connection_id).await?))
}

/// Re-runs authorization for additional grants
#[utoipa::path(
    post,
    path = "/connections/{ref}/reconsent/begin",
    params(("ref" = String, Path, description = "Connection id")),
    request_body = ReconsentBody,
    responses(
        (status = 200, description = "Authorization URL", body = BeginAuthResponse),
        (status = 404, description = "Not found", body = ApiError)
    ),
    tag = "services"
)]
pub async fn reconsent_begin(
    State(state): State<AppState>,
    Path(connection_id): Path<String>,
    headers: HeaderMap,
    OptionalJson(body): OptionalJson<ReconsentBody>,
) -> Result<Json<BeginAuthResponse>, ApiError> {
    let detail = state.facade.get_connection(&connection_id).await?;
    let redirect_uri = redirect_uri_for(
        &state,
        &detail.connection.provider_id,
        body.redirect_uri,
        &headers,
    )?;
    let response = state
        .facade
        .reconsent_begin(ReconsentRequest {
            connection_id,
            redirect_uri,
            state: body.state,
            requested_grants: body.requested_grants,
            metadata: metadata_or_empty(body.metadata),
        })
        .await?;
    Ok(Json(response))
}

/// Refreshes the connection's credential, inline or on the worker queue
#[utoipa::path(
    post,
    path = "/connections/{ref}/refresh",
    params(("ref" = String, Path, description = "Connection id")),
    request_body = RefreshBody,
    responses(
        (status = 200, description = "Credential rotated", body = RefreshResult),
        (status = 202, description = "Refresh queued", body = QueuedJob),
        (status = 503, description = "Provider unavailable", body = ApiError)
    ),
    tag = "services"
)]
pub async fn refresh_connection(
    State(state): State<AppState>,
    Path(connection_id): Path<String>,
    headers: HeaderMap,
    OptionalJson(body): OptionalJson<RefreshBody>,
) -> Result<Response, ApiError> {
    let provider_id = body.provider_id.filter(|p| !p.trim().is_empty());
    if state.worker.is_enabled() {
        let job = state
            .worker
            .enqueue_refresh(
                provider_id.as_deref(),
                &connection_id,
                idempotency_key(&headers),
            )
            .await?;
        return Ok(accepted(job));
    }
    let result = state
        .facade
        .refresh(provider_id.as_deref(), &connection_id)
        .await?;
    Ok(Json(result).into_response())
}

/// Revokes every credential and disconnects
#[utoipa::path(
    post,
    path = "/connections/{ref}/revoke",
    params(("ref" = String, Path, description = "Connection id")),
    request_body = RevokeBody,
    responses(
        (status = 200, description = "Connection revoked", body = RevokeResult),
        (status = 404, description = "Not found", body = ApiError)
    ),
    tag = "services"
)]
pub async fn revoke_connection(
    State(state): State<AppState>,
    Path(connection_id): Path<String>,
    OptionalJson(body): OptionalJson<RevokeBody>,
) -> Result<Json<RevokeResult>, ApiError> {
    Ok(Json(
        state
            .facade
            .revoke(&connection_id, body.reason.filter(|r| !r.trim().is_empty()))
            .await?,
    ))
}
