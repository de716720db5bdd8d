//! # Capability Invocation Handler

use axum::{
    extract::{Path, Query, State},
    response::Json,
};
use serde::Deserialize;
use serde_json::Value;
use utoipa::ToSchema;

use super::OptionalJson;
use crate::auth::ActorContext;
use crate::error::ApiError;
use crate::scope::{ScopeInput, resolve_scope};
use crate::server::AppState;
use crate::service::{CapabilityResult, InvokeCapabilityRequest};

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct InvokeBody {
    #[serde(flatten)]
    pub scope: ScopeInput,
    pub connection_id: Option<String>,
    #[serde(default)]
    pub payload: Value,
}

/// Checks the capability's grants against the connection's latest snapshot.
/// Blocked capabilities answer `403 missing_permissions`.
#[utoipa::path(
    post,
    path = "/capabilities/{provider}/{capability}/invoke",
    params(
        ("provider" = String, Path, description = "Provider id"),
        ("capability" = String, Path, description = "Capability name")
    ),
    request_body = InvokeBody,
    responses(
        (status = 200, description = "Invocation decision", body = CapabilityResult),
        (status = 403, description = "Missing grants", body = ApiError),
        (status = 404, description = "Unknown capability", body = ApiError)
    ),
    tag = "services"
)]
pub async fn invoke_capability(
    State(state): State<AppState>,
    Path((provider_id, capability)): Path<(String, String)>,
    actor: ActorContext,
    Query(query): Query<ScopeInput>,
    OptionalJson(body): OptionalJson<InvokeBody>,
) -> Result<Json<CapabilityResult>, ApiError> {
    let scope = resolve_scope(&body.scope, &query, &actor)?;
    let result = state
        .facade
        .invoke_capability(InvokeCapabilityRequest {
            provider_id,
            capability,
            scope,
            connection_id: body.connection_id.filter(|id| !id.trim().is_empty()),
            payload: body.payload,
        })
        .await?
        .into_result()?;
    Ok(Json(result))
}
