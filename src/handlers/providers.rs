//! # Provider Catalog Handlers

use axum::{
    extract::{Query, State},
    response::Json,
};
use serde::Deserialize;
use utoipa::IntoParams;

use crate::error::ApiError;
use crate::pagination::{ListEnvelope, ListQuery, compact_filters};
use crate::providers::ProviderDescriptor;
use crate::scope::ScopeType;
use crate::server::AppState;

#[derive(Debug, Default, Deserialize, IntoParams)]
pub struct ProviderFilter {
    /// Only providers supporting this scope type (`user` | `org`)
    pub scope_type: Option<String>,
    /// Only providers declaring this capability
    pub capability: Option<String>,
}

/// Lists registered providers with their capabilities and grant requirements
#[utoipa::path(
    get,
    path = "/providers",
    params(ProviderFilter, ListQuery),
    responses(
        (status = 200, description = "Registered providers", body = ListEnvelope<ProviderDescriptor>),
        (status = 403, description = "Forbidden", body = ApiError)
    ),
    tag = "services"
)]
pub async fn list_providers(
    State(state): State<AppState>,
    Query(filter): Query<ProviderFilter>,
    Query(list): Query<ListQuery>,
) -> Result<Json<ListEnvelope<ProviderDescriptor>>, ApiError> {
    let scope_type = filter
        .scope_type
        .as_deref()
        .map(str::parse::<ScopeType>)
        .transpose()?;
    let providers: Vec<ProviderDescriptor> = state
        .providers
        .descriptors()
        .into_iter()
        .filter(|d| scope_type.is_none_or(|t| d.supports_scope(t)))
        .filter(|d| {
            filter
                .capability
                .as_deref()
                .is_none_or(|name| d.capability(name).is_some())
        })
        .collect();

    let filters = compact_filters([
        ("scope_type", filter.scope_type.as_ref()),
        ("capability", filter.capability.as_ref()),
    ]);
    Ok(Json(ListEnvelope::from_vec(providers, list.page(), filters)))
}
