//! # Status Read Models
//!
//! Counts by status for the durable queues, rate-limit state and extension
//! diagnostics.

use std::collections::BTreeMap;

use axum::{
    extract::{Query, State},
    response::Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::error::{ApiError, ServiceError};
use crate::lifecycle::OutboxStore;
use crate::pagination::{ListEnvelope, ListQuery, MAX_LIMIT, compact_filters};
use crate::repositories::RecordFilter;
use crate::server::AppState;
use crate::service::RateLimitView;
use crate::webhooks::ledger::ClaimLedger;

#[derive(Debug, Serialize, ToSchema)]
pub struct ActivityStatus {
    pub total: u64,
    /// Entries parked in the fallback ring while the primary sink fails.
    pub fallback_buffered: u64,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ServicesStatus {
    pub providers: Vec<String>,
    pub connections: BTreeMap<String, u64>,
    pub activity: ActivityStatus,
    pub outbox: BTreeMap<String, u64>,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct OperationsStatus {
    pub outbox: BTreeMap<String, u64>,
    pub webhook_deliveries: BTreeMap<String, u64>,
    pub sync_jobs: BTreeMap<String, u64>,
    pub projectors: Vec<String>,
    pub worker_queue_enabled: bool,
    pub activity_fallback_buffered: u64,
    pub idempotency_entries: u64,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct RateLimitRuntime {
    /// Whether this deployment persists rate-limit state.
    pub persisted: bool,
    pub tracked: u64,
    /// Buckets with nothing remaining whose window has not reset yet.
    pub throttled: Vec<RateLimitView>,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ExtensionDiagnostics {
    pub enabled: bool,
    pub profile: String,
    pub enabled_provider_packs: Vec<String>,
    pub registered_providers: Vec<String>,
    pub feature_flags: BTreeMap<String, bool>,
    pub webhook_verifiers: Vec<String>,
    pub inbound_surfaces: Vec<String>,
    pub projectors: Vec<String>,
}

#[derive(Debug, Default, Deserialize, IntoParams)]
pub struct RateLimitFilter {
    pub provider_id: Option<String>,
    pub scope_type: Option<String>,
    pub scope_id: Option<String>,
}

/// Summary of providers, connections, activity and the outbox
#[utoipa::path(
    get,
    path = "/status",
    responses((status = 200, description = "Services status", body = ServicesStatus)),
    tag = "services"
)]
pub async fn services_status(State(state): State<AppState>) -> Result<Json<ServicesStatus>, ApiError> {
    let connections = state.repos.connections.status_counts().await?;
    let outbox = state.dispatcher.store().status_counts().await?;
    let total = state.repos.activity.count().await?;
    Ok(Json(ServicesStatus {
        providers: state.providers.ids(),
        connections,
        activity: ActivityStatus {
            total,
            fallback_buffered: state.activity.sink().buffered_len() as u64,
        },
        outbox,
        generated_at: Utc::now(),
    }))
}

/// Backlog of the outbox, webhook ledger and sync jobs
#[utoipa::path(
    get,
    path = "/operations/status",
    responses((status = 200, description = "Operational status", body = OperationsStatus)),
    tag = "services"
)]
pub async fn operations_status(
    State(state): State<AppState>,
) -> Result<Json<OperationsStatus>, ApiError> {
    let outbox = state.dispatcher.store().status_counts().await?;
    let webhook_deliveries = state.webhooks.ledger().status_counts().await?;
    let sync_jobs = state.repos.sync_jobs.status_counts().await?;
    Ok(Json(OperationsStatus {
        outbox,
        webhook_deliveries,
        sync_jobs,
        projectors: state.dispatcher.projectors().names(),
        worker_queue_enabled: state.worker.is_enabled(),
        activity_fallback_buffered: state.activity.sink().buffered_len() as u64,
        idempotency_entries: state.idempotency.len() as u64,
        generated_at: Utc::now(),
    }))
}

/// Persisted provider rate-limit state
#[utoipa::path(
    get,
    path = "/rate-limits",
    params(RateLimitFilter, ListQuery),
    responses((status = 200, description = "Rate-limit buckets", body = ListEnvelope<RateLimitView>)),
    tag = "services"
)]
pub async fn list_rate_limits(
    State(state): State<AppState>,
    Query(filter): Query<RateLimitFilter>,
    Query(list): Query<ListQuery>,
) -> Result<Json<ListEnvelope<RateLimitView>>, ApiError> {
    let record_filter = RecordFilter {
        provider_id: filter.provider_id.clone(),
        scope_type: filter.scope_type.clone(),
        scope_id: filter.scope_id.clone(),
        ..RecordFilter::default()
    };
    let page = list.page();
    let rows = state
        .facade
        .list_rate_limits(&record_filter, page.offset + MAX_LIMIT)
        .await?;
    let filters = compact_filters([
        ("provider_id", filter.provider_id.as_ref()),
        ("scope_type", filter.scope_type.as_ref()),
        ("scope_id", filter.scope_id.as_ref()),
    ]);
    Ok(Json(ListEnvelope::from_vec(rows, page, filters)))
}

/// Currently throttled buckets
#[utoipa::path(
    get,
    path = "/rate-limits/runtime",
    responses((status = 200, description = "Rate-limit runtime", body = RateLimitRuntime)),
    tag = "services"
)]
pub async fn rate_limit_runtime(
    State(state): State<AppState>,
) -> Result<Json<RateLimitRuntime>, ApiError> {
    let now = Utc::now();
    let rows = state
        .facade
        .list_rate_limits(&RecordFilter::default(), MAX_LIMIT)
        .await?;
    let tracked = rows.len() as u64;
    let throttled = rows
        .into_iter()
        .filter(|row| row.remaining <= 0 && row.reset_at.is_some_and(|reset| reset > now))
        .collect();
    Ok(Json(RateLimitRuntime {
        persisted: state.repos.rate_limits().is_some(),
        tracked,
        throttled,
        generated_at: now,
    }))
}

/// Enabled packs, feature flags and registered extension points
#[utoipa::path(
    get,
    path = "/extensions/diagnostics",
    responses(
        (status = 200, description = "Extension diagnostics", body = ExtensionDiagnostics),
        (status = 404, description = "Diagnostics disabled", body = ApiError)
    ),
    tag = "services"
)]
pub async fn extension_diagnostics(
    State(state): State<AppState>,
) -> Result<Json<ExtensionDiagnostics>, ApiError> {
    let extensions = &state.config.extensions;
    if !extensions.diagnostics_enabled {
        return Err(ServiceError::not_found("extension diagnostics are disabled").into());
    }
    Ok(Json(ExtensionDiagnostics {
        enabled: true,
        profile: state.config.profile.clone(),
        enabled_provider_packs: extensions.enabled_provider_packs.clone(),
        registered_providers: state.providers.ids(),
        feature_flags: extensions.feature_flags.clone(),
        webhook_verifiers: state.verifiers.providers(),
        inbound_surfaces: state
            .inbound
            .handlers()
            .surfaces()
            .iter()
            .map(ToString::to_string)
            .collect(),
        projectors: state.dispatcher.projectors().names(),
    }))
}
