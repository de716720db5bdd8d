//! # Subscription Handlers

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::{IntoResponse, Json, Response},
};
use serde::Deserialize;
use utoipa::{IntoParams, ToSchema};

use super::gate::idempotency_key;
use super::{OptionalJson, accepted};
use crate::error::ApiError;
use crate::pagination::{ListEnvelope, ListQuery, compact_filters};
use crate::repositories::RecordFilter;
use crate::server::AppState;
use crate::service::SubscriptionView;
use crate::worker::QueuedJob;

#[derive(Debug, Default, Deserialize, IntoParams)]
pub struct SubscriptionFilter {
    pub provider_id: Option<String>,
    pub connection_id: Option<String>,
    /// `active` | `cancelled` | `expired`
    pub status: Option<String>,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct RenewBody {
    /// Seconds until the renewed subscription expires; seven days when omitted.
    pub ttl_seconds: Option<u64>,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct CancelBody {
    pub reason: Option<String>,
}

#[utoipa::path(
    get,
    path = "/subscriptions",
    params(SubscriptionFilter, ListQuery),
    responses((status = 200, description = "Subscriptions", body = ListEnvelope<SubscriptionView>)),
    tag = "services"
)]
pub async fn list_subscriptions(
    State(state): State<AppState>,
    Query(filter): Query<SubscriptionFilter>,
    Query(list): Query<ListQuery>,
) -> Result<Json<ListEnvelope<SubscriptionView>>, ApiError> {
    let applied = compact_filters([
        ("provider_id", filter.provider_id.as_ref()),
        ("connection_id", filter.connection_id.as_ref()),
        ("status", filter.status.as_ref()),
    ]);
    let record_filter = RecordFilter {
        provider_id: applied.get("provider_id").cloned(),
        connection_id: applied.get("connection_id").cloned(),
        status: applied.get("status").cloned(),
        ..RecordFilter::default()
    };
    let page = list.page();
    let (items, total) = state.facade.list_subscriptions(&record_filter, page).await?;
    Ok(Json(ListEnvelope::new(items, total, page, applied)))
}

/// Extends a subscription, inline or on the worker queue
#[utoipa::path(
    post,
    path = "/subscriptions/{ref}/renew",
    params(("ref" = String, Path, description = "Subscription id")),
    request_body = RenewBody,
    responses(
        (status = 200, description = "Subscription renewed", body = SubscriptionView),
        (status = 202, description = "Renewal queued", body = QueuedJob),
        (status = 409, description = "Subscription cancelled", body = ApiError)
    ),
    tag = "services"
)]
pub async fn renew_subscription(
    State(state): State<AppState>,
    Path(subscription_id): Path<String>,
    headers: HeaderMap,
    OptionalJson(body): OptionalJson<RenewBody>,
) -> Result<Response, ApiError> {
    if state.worker.is_enabled() {
        let job = state
            .worker
            .enqueue_subscription_renew(&subscription_id, body.ttl_seconds, idempotency_key(&headers))
            .await?;
        return Ok(accepted(job));
    }
    let view = state
        .facade
        .renew_subscription(&subscription_id, body.ttl_seconds)
        .await?;
    Ok(Json(view).into_response())
}

#[utoipa::path(
    post,
    path = "/subscriptions/{ref}/cancel",
    params(("ref" = String, Path, description = "Subscription id")),
    request_body = CancelBody,
    responses((status = 200, description = "Subscription cancelled", body = SubscriptionView)),
    tag = "services"
)]
pub async fn cancel_subscription(
    State(state): State<AppState>,
    Path(subscription_id): Path<String>,
    OptionalJson(body): OptionalJson<CancelBody>,
) -> Result<Json<SubscriptionView>, ApiError> {
    let view = state
        .facade
        .cancel_subscription(&subscription_id, body.reason)
        .await?;
    Ok(Json(view))
}
