//! # Installation Handlers

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::Json,
};
use serde::Deserialize;
use utoipa::ToSchema;

use super::connections::{BeginRequest, ConnectionFilter, redirect_uri_for};
use super::{JsonBody, OptionalJson};
use crate::auth::ActorContext;
use crate::error::{ApiError, ServiceError};
use crate::models::status::InstallationStatus;
use crate::pagination::{ListEnvelope, ListQuery};
use crate::providers::BeginAuthResponse;
use crate::scope::{ScopeInput, resolve_scope};
use crate::server::AppState;
use crate::service::{ConnectRequest, InstallationView};

#[derive(Debug, Deserialize, ToSchema)]
pub struct InstallationStatusBody {
    /// `active` | `suspended` | `uninstalled`
    pub status: String,
    pub reason: Option<String>,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct UninstallBody {
    pub reason: Option<String>,
}

/// Lists installations
#[utoipa::path(
    get,
    path = "/installations",
    params(ConnectionFilter, ListQuery),
    responses((status = 200, description = "Installations", body = ListEnvelope<InstallationView>)),
    tag = "services"
)]
pub async fn list_installations(
    State(state): State<AppState>,
    Query(filter): Query<ConnectionFilter>,
    Query(list): Query<ListQuery>,
) -> Result<Json<ListEnvelope<InstallationView>>, ApiError> {
    let page = list.page();
    let (items, total) = state
        .facade
        .list_installations(&filter.record_filter(), page)
        .await?;
    Ok(Json(ListEnvelope::new(items, total, page, filter.applied())))
}

#[utoipa::path(
    get,
    path = "/installations/{ref}",
    params(("ref" = String, Path, description = "Installation id")),
    responses(
        (status = 200, description = "Installation", body = InstallationView),
        (status = 404, description = "Not found", body = ApiError)
    ),
    tag = "services"
)]
pub async fn get_installation(
    State(state): State<AppState>,
    Path(installation_id): Path<String>,
) -> Result<Json<InstallationView>, ApiError> {
    Ok(Json(state.facade.get_installation(&installation_id).await?))
}

/// Starts an install flow for a provider
#[utoipa::path(
    post,
    path = "/installations/{ref}/begin",
    params(("ref" = String, Path, description = "Provider id")),
    request_body = BeginRequest,
    responses((status = 200, description = "Authorization URL", body = BeginAuthResponse)),
    tag = "services"
)]
pub async fn begin_installation(
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
        .begin_installation(ConnectRequest {
            provider_id,
            scope,
            redirect_uri,
            state: body.state,
            requested_grants: body.requested_grants,
            metadata: body.metadata,
        })
        .await?;
    Ok(Json(response))
}

#[utoipa::path(
    post,
    path = "/installations/{ref}/status",
    params(("ref" = String, Path, description = "Installation id")),
    request_body = InstallationStatusBody,
    responses(
        (status = 200, description = "Installation updated", body = InstallationView),
        (status = 400, description = "Unknown status", body = ApiError)
    ),
    tag = "services"
)]
pub async fn update_installation_status(
    State(state): State<AppState>,
    Path(installation_id): Path<String>,
    JsonBody(body): JsonBody<InstallationStatusBody>,
) -> Result<Json<InstallationView>, ApiError> {
    let status: InstallationStatus = body
        .status
        .trim()
        .parse()
        .map_err(|_| {
            ServiceError::validation(format!("unknown installation status '{}'", body.status))
        })?;
    let view = state
        .facade
        .update_installation_status(&installation_id, status, body.reason)
        .await?;
    Ok(Json(view))
}

#[utoipa::path(
    post,
    path = "/installations/{ref}/uninstall",
    params(("ref" = String, Path, description = "Installation id")),
    request_body = UninstallBody,
    responses((status = 200, description = "Installation uninstalled", body = InstallationView)),
    tag = "services"
)]
pub async fn uninstall(
    State(state): State<AppState>,
    Path(installation_id): Path<String>,
    OptionalJson(body): OptionalJson<UninstallBody>,
) -> Result<Json<InstallationView>, ApiError> {
    let view = state
        .facade
        .update_installation_status(&installation_id, InstallationStatus::Uninstalled, body.reason)
        .await?;
    Ok(Json(view))
}
