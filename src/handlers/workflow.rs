//! # Workflow Handlers
//!
//! Mapping specs, sync runs, conflicts, schema drift and callback
//! diagnostics, mounted under `/workflow/services`.

use std::collections::BTreeMap;

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::{IntoParams, ToSchema};

use super::{JsonBody, OptionalJson};
use crate::auth::ActorContext;
use crate::callbacks::{CallbackParams, CallbackResolution};
use crate::error::{ApiError, ServiceError, ServiceResult};
use crate::models::status::ConnectionStatus;
use crate::pagination::{ListEnvelope, ListQuery, compact_filters};
use crate::repositories::RecordFilter;
use crate::scope::{ScopeInput, ScopeRef, ScopeType, resolve_scope};
use crate::server::AppState;
use crate::service::ConnectionView;
use crate::workflow::{
    BaselineRequest, CompileReport, ConflictResolution, ConflictStatus, MappingKey, MappingSpec,
    PlanRequest, PreviewReport, ResolutionAction, ResumeRequest, ResumedRun, SchemaBaseline,
    SchemaDriftRow, SyncChange, SyncCheckpoint, SyncConflict, SyncRunPlan, SyncRunRecord,
};

/// Optional provider/scope narrowing shared by workflow list routes.
#[derive(Debug, Default, Deserialize, IntoParams)]
pub struct WorkflowFilter {
    pub provider_id: Option<String>,
    pub scope_type: Option<String>,
    pub scope_id: Option<String>,
    pub status: Option<String>,
}

fn clean(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

impl WorkflowFilter {
    fn provider(&self) -> Option<&str> {
        clean(&self.provider_id)
    }

    /// A scope only narrows the listing when its id is given.
    fn scope(&self) -> ServiceResult<Option<ScopeRef>> {
        let Some(id) = clean(&self.scope_id) else {
            return Ok(None);
        };
        let scope_type = match clean(&self.scope_type) {
            Some(raw) => raw.parse()?,
            None => ScopeType::User,
        };
        Ok(Some(ScopeRef::new(scope_type, id)))
    }

    fn applied(&self) -> BTreeMap<String, String> {
        compact_filters([
            ("provider_id", self.provider_id.as_ref()),
            ("scope_type", self.scope_type.as_ref()),
            ("scope_id", self.scope_id.as_ref()),
            ("status", self.status.as_ref()),
        ])
    }
}

/// Identifies one spec version in transition requests.
#[derive(Debug, Deserialize, ToSchema)]
pub struct MappingVersionBody {
    pub provider_id: String,
    pub scope: ScopeRef,
    pub version: u32,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct MappingLookup {
    pub provider_id: String,
    pub scope_type: Option<String>,
    pub scope_id: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct PreviewBody {
    pub spec: MappingSpec,
    #[serde(default)]
    pub samples: Vec<Value>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct RunBody {
    pub plan: SyncRunPlan,
    #[serde(default)]
    pub changes: Vec<SyncChange>,
    #[serde(default)]
    pub metadata: Value,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ResolveBody {
    /// Defaults to the conflict's provider.
    pub provider_id: Option<String>,
    /// Defaults to the conflict's scope.
    pub scope: Option<ScopeRef>,
    pub action: ResolutionAction,
    #[serde(default)]
    pub patch: Value,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub resolved_by: Option<String>,
    #[serde(default)]
    pub metadata: Value,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct CallbackPreviewBody {
    pub provider_id: String,
    #[serde(flatten)]
    pub params: CallbackParams,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CallbackProviderStatus {
    pub provider_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution: Option<CallbackResolution>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CallbackDiagnostics {
    pub strict: bool,
    pub public_base_url: Option<String>,
    pub urlkit_group: String,
    pub default_route: String,
    pub provider_routes: BTreeMap<String, String>,
    pub overridden_providers: Vec<String>,
    pub providers: Vec<CallbackProviderStatus>,
}

fn mapping_key(spec_id: String, body: MappingVersionBody) -> MappingKey {
    MappingKey {
        provider_id: body.provider_id,
        scope: body.scope,
        spec_id,
        version: body.version,
    }
}

// ---- mappings ----

/// Latest version of every mapping spec
#[utoipa::path(
    get,
    path = "/mappings",
    params(WorkflowFilter, ListQuery),
    responses((status = 200, description = "Mapping specs", body = ListEnvelope<MappingSpec>)),
    tag = "workflow"
)]
pub async fn list_mappings(
    State(state): State<AppState>,
    Query(filter): Query<WorkflowFilter>,
    Query(list): Query<ListQuery>,
) -> Result<Json<ListEnvelope<MappingSpec>>, ApiError> {
    let scope = filter.scope()?;
    let specs = state
        .workflow
        .list_latest(filter.provider(), scope.as_ref())
        .await?;
    let specs = match clean(&filter.status) {
        Some(status) => specs
            .into_iter()
            .filter(|s| s.status.as_str() == status)
            .collect(),
        None => specs,
    };
    Ok(Json(ListEnvelope::from_vec(specs, list.page(), filter.applied())))
}

/// Creates a draft; version 0 asks for the next free version
#[utoipa::path(
    post,
    path = "/mappings",
    request_body = MappingSpec,
    responses(
        (status = 200, description = "Draft stored", body = MappingSpec),
        (status = 409, description = "Version exists", body = ApiError)
    ),
    tag = "workflow"
)]
pub async fn create_mapping(
    State(state): State<AppState>,
    JsonBody(spec): JsonBody<MappingSpec>,
) -> Result<Json<MappingSpec>, ApiError> {
    Ok(Json(state.workflow.create_draft(spec).await?))
}

/// Compiles a spec without storing it
#[utoipa::path(
    post,
    path = "/mappings/validate",
    request_body = MappingSpec,
    responses((status = 200, description = "Compile report", body = CompileReport)),
    tag = "workflow"
)]
pub async fn validate_mapping(
    State(state): State<AppState>,
    JsonBody(spec): JsonBody<MappingSpec>,
) -> Json<CompileReport> {
    Json(state.workflow.validate(&spec))
}

/// Applies a spec to sample records
#[utoipa::path(
    post,
    path = "/mappings/preview",
    request_body = PreviewBody,
    responses((status = 200, description = "Preview", body = PreviewReport)),
    tag = "workflow"
)]
pub async fn preview_mapping(
    State(state): State<AppState>,
    JsonBody(body): JsonBody<PreviewBody>,
) -> Json<PreviewReport> {
    Json(state.workflow.preview(&body.spec, &body.samples))
}

#[utoipa::path(
    get,
    path = "/mappings/spec/{spec_id}",
    params(("spec_id" = String, Path, description = "Spec id"), MappingLookup),
    responses(
        (status = 200, description = "Latest version", body = MappingSpec),
        (status = 404, description = "Not found", body = ApiError)
    ),
    tag = "workflow"
)]
pub async fn get_latest_mapping(
    State(state): State<AppState>,
    Path(spec_id): Path<String>,
    actor: ActorContext,
    Query(lookup): Query<MappingLookup>,
) -> Result<Json<MappingSpec>, ApiError> {
    let scope = lookup_scope(&lookup, &actor)?;
    state
        .workflow
        .latest(&lookup.provider_id, &scope, &spec_id)
        .await?
        .map(Json)
        .ok_or_else(|| ServiceError::not_found(format!("mapping {} not found", spec_id)).into())
}

#[utoipa::path(
    get,
    path = "/mappings/spec/{spec_id}/versions/{version}",
    params(
        ("spec_id" = String, Path, description = "Spec id"),
        ("version" = u32, Path, description = "Version"),
        MappingLookup
    ),
    responses(
        (status = 200, description = "Mapping version", body = MappingSpec),
        (status = 404, description = "Not found", body = ApiError)
    ),
    tag = "workflow"
)]
pub async fn get_mapping_version(
    State(state): State<AppState>,
    Path((spec_id, version)): Path<(String, u32)>,
    actor: ActorContext,
    Query(lookup): Query<MappingLookup>,
) -> Result<Json<MappingSpec>, ApiError> {
    let scope = lookup_scope(&lookup, &actor)?;
    let key = MappingKey {
        provider_id: lookup.provider_id,
        scope,
        spec_id,
        version,
    };
    state
        .workflow
        .get(&key)
        .await?
        .map(Json)
        .ok_or_else(|| {
            ServiceError::not_found(format!(
                "mapping {} version {} not found",
                key.spec_id, key.version
            ))
            .into()
        })
}

fn lookup_scope(lookup: &MappingLookup, actor: &ActorContext) -> ServiceResult<ScopeRef> {
    let query = ScopeInput {
        scope_type: lookup.scope_type.clone(),
        scope_id: lookup.scope_id.clone(),
        ..ScopeInput::default()
    };
    resolve_scope(&ScopeInput::default(), &query, actor)
}

/// Replaces a draft; the path's spec id wins over the body's
#[utoipa::path(
    post,
    path = "/mappings/spec/{spec_id}/update",
    params(("spec_id" = String, Path, description = "Spec id")),
    request_body = MappingSpec,
    responses(
        (status = 200, description = "Draft updated", body = MappingSpec),
        (status = 409, description = "Not a draft", body = ApiError)
    ),
    tag = "workflow"
)]
pub async fn update_mapping(
    State(state): State<AppState>,
    Path(spec_id): Path<String>,
    JsonBody(mut spec): JsonBody<MappingSpec>,
) -> Result<Json<MappingSpec>, ApiError> {
    spec.spec_id = spec_id;
    Ok(Json(state.workflow.update_draft(spec).await?))
}

#[utoipa::path(
    post,
    path = "/mappings/spec/{spec_id}/validate",
    params(("spec_id" = String, Path, description = "Spec id")),
    request_body = MappingVersionBody,
    responses(
        (status = 200, description = "Marked validated", body = MappingSpec),
        (status = 400, description = "Compile errors", body = ApiError)
    ),
    tag = "workflow"
)]
pub async fn mark_mapping_validated(
    State(state): State<AppState>,
    Path(spec_id): Path<String>,
    JsonBody(body): JsonBody<MappingVersionBody>,
) -> Result<Json<MappingSpec>, ApiError> {
    let key = mapping_key(spec_id, body);
    Ok(Json(state.workflow.mark_validated(&key).await?))
}

#[utoipa::path(
    post,
    path = "/mappings/spec/{spec_id}/publish",
    params(("spec_id" = String, Path, description = "Spec id")),
    request_body = MappingVersionBody,
    responses(
        (status = 200, description = "Published", body = MappingSpec),
        (status = 409, description = "Not validated", body = ApiError)
    ),
    tag = "workflow"
)]
pub async fn publish_mapping(
    State(state): State<AppState>,
    Path(spec_id): Path<String>,
    JsonBody(body): JsonBody<MappingVersionBody>,
) -> Result<Json<MappingSpec>, ApiError> {
    let key = mapping_key(spec_id, body);
    Ok(Json(state.workflow.publish(&key).await?))
}

#[utoipa::path(
    post,
    path = "/mappings/spec/{spec_id}/unpublish",
    params(("spec_id" = String, Path, description = "Spec id")),
    request_body = MappingVersionBody,
    responses(
        (status = 200, description = "Back to validated", body = MappingSpec),
        (status = 409, description = "Not published", body = ApiError)
    ),
    tag = "workflow"
)]
pub async fn unpublish_mapping(
    State(state): State<AppState>,
    Path(spec_id): Path<String>,
    JsonBody(body): JsonBody<MappingVersionBody>,
) -> Result<Json<MappingSpec>, ApiError> {
    let key = mapping_key(spec_id, body);
    Ok(Json(state.workflow.unpublish(&key).await?))
}

// ---- sync runs ----

#[utoipa::path(
    post,
    path = "/sync/plan",
    request_body = PlanRequest,
    responses((status = 200, description = "Run plan", body = SyncRunPlan)),
    tag = "workflow"
)]
pub async fn plan_sync(
    State(state): State<AppState>,
    JsonBody(request): JsonBody<PlanRequest>,
) -> Result<Json<SyncRunPlan>, ApiError> {
    Ok(Json(state.workflow.plan_sync_run(request).await?))
}

/// Executes a plan over the supplied changes
#[utoipa::path(
    post,
    path = "/sync/run",
    request_body = RunBody,
    responses(
        (status = 200, description = "Run record", body = SyncRunRecord),
        (status = 409, description = "Binding inactive", body = ApiError)
    ),
    tag = "workflow"
)]
pub async fn run_sync(
    State(state): State<AppState>,
    JsonBody(body): JsonBody<RunBody>,
) -> Result<Json<SyncRunRecord>, ApiError> {
    let record = state
        .workflow
        .run_sync(&body.plan, &body.changes, body.metadata)
        .await?;
    Ok(Json(record))
}

#[utoipa::path(
    get,
    path = "/sync/runs",
    params(WorkflowFilter, ListQuery),
    responses((status = 200, description = "Sync runs", body = ListEnvelope<SyncRunRecord>)),
    tag = "workflow"
)]
pub async fn list_sync_runs(
    State(state): State<AppState>,
    Query(filter): Query<WorkflowFilter>,
    Query(list): Query<ListQuery>,
) -> Result<Json<ListEnvelope<SyncRunRecord>>, ApiError> {
    let scope = filter.scope()?;
    let runs = state
        .workflow
        .list_runs(filter.provider(), scope.as_ref())
        .await?;
    Ok(Json(ListEnvelope::from_vec(runs, list.page(), filter.applied())))
}

#[utoipa::path(
    get,
    path = "/sync/runs/{run_id}",
    params(("run_id" = String, Path, description = "Run id")),
    responses(
        (status = 200, description = "Run record", body = SyncRunRecord),
        (status = 404, description = "Not found", body = ApiError)
    ),
    tag = "workflow"
)]
pub async fn get_sync_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<SyncRunRecord>, ApiError> {
    Ok(Json(state.workflow.get_run(&run_id).await?))
}

/// Re-plans from where a run stopped, executing it when changes are given
#[utoipa::path(
    post,
    path = "/sync/runs/{run_id}/resume",
    params(("run_id" = String, Path, description = "Previous run id")),
    request_body = ResumeRequest,
    responses((status = 200, description = "Resumed run", body = ResumedRun)),
    tag = "workflow"
)]
pub async fn resume_sync_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    OptionalJson(request): OptionalJson<ResumeRequest>,
) -> Result<Json<ResumedRun>, ApiError> {
    Ok(Json(state.workflow.resume_sync_run(&run_id, request).await?))
}

#[utoipa::path(
    get,
    path = "/sync/checkpoints/{checkpoint_id}",
    params(("checkpoint_id" = String, Path, description = "Checkpoint id")),
    responses(
        (status = 200, description = "Checkpoint", body = SyncCheckpoint),
        (status = 404, description = "Not found", body = ApiError)
    ),
    tag = "workflow"
)]
pub async fn get_checkpoint(
    State(state): State<AppState>,
    Path(checkpoint_id): Path<String>,
) -> Result<Json<SyncCheckpoint>, ApiError> {
    Ok(Json(state.workflow.get_checkpoint(&checkpoint_id).await?))
}

// ---- conflicts ----

#[utoipa::path(
    get,
    path = "/sync/conflicts",
    params(WorkflowFilter, ListQuery),
    responses((status = 200, description = "Sync conflicts", body = ListEnvelope<SyncConflict>)),
    tag = "workflow"
)]
pub async fn list_conflicts(
    State(state): State<AppState>,
    Query(filter): Query<WorkflowFilter>,
    Query(list): Query<ListQuery>,
) -> Result<Json<ListEnvelope<SyncConflict>>, ApiError> {
    let scope = filter.scope()?;
    let status = clean(&filter.status)
        .map(|raw| {
            serde_json::from_value::<ConflictStatus>(Value::String(raw.to_string()))
                .map_err(|_| ServiceError::validation(format!("unknown conflict status '{}'", raw)))
        })
        .transpose()?;
    let conflicts = state
        .workflow
        .list_conflicts(filter.provider(), scope.as_ref(), status)
        .await?;
    Ok(Json(ListEnvelope::from_vec(
        conflicts,
        list.page(),
        filter.applied(),
    )))
}

#[utoipa::path(
    get,
    path = "/sync/conflicts/{conflict_id}",
    params(("conflict_id" = String, Path, description = "Conflict id")),
    responses(
        (status = 200, description = "Conflict", body = SyncConflict),
        (status = 404, description = "Not found", body = ApiError)
    ),
    tag = "workflow"
)]
pub async fn get_conflict(
    State(state): State<AppState>,
    Path(conflict_id): Path<String>,
) -> Result<Json<SyncConflict>, ApiError> {
    Ok(Json(state.workflow.get_conflict(&conflict_id).await?))
}

/// Resolves, ignores or re-queues a conflict
#[utoipa::path(
    post,
    path = "/sync/conflicts/{conflict_id}/resolve",
    params(("conflict_id" = String, Path, description = "Conflict id")),
    request_body = ResolveBody,
    responses(
        (status = 200, description = "Conflict updated", body = SyncConflict),
        (status = 409, description = "Already settled", body = ApiError)
    ),
    tag = "workflow"
)]
pub async fn resolve_conflict(
    State(state): State<AppState>,
    Path(conflict_id): Path<String>,
    actor: ActorContext,
    JsonBody(body): JsonBody<ResolveBody>,
) -> Result<Json<SyncConflict>, ApiError> {
    let (provider_id, scope) = match (body.provider_id, body.scope) {
        (Some(provider_id), Some(scope)) => (provider_id, scope),
        (provider_id, scope) => {
            let conflict = state.workflow.get_conflict(&conflict_id).await?;
            (
                provider_id.unwrap_or(conflict.provider_id),
                scope.unwrap_or(conflict.scope),
            )
        }
    };
    let resolution = ConflictResolution {
        action: body.action,
        patch: body.patch,
        reason: body.reason,
        resolved_by: body
            .resolved_by
            .filter(|by| !by.trim().is_empty())
            .unwrap_or_else(|| actor.key().to_string()),
    };
    let conflict = state
        .workflow
        .resolve_sync_conflict(&provider_id, &scope, &conflict_id, resolution, body.metadata)
        .await?;
    Ok(Json(conflict))
}

// ---- schema drift ----

#[utoipa::path(
    get,
    path = "/sync/schema-drift",
    params(WorkflowFilter, ListQuery),
    responses((status = 200, description = "Drift per spec", body = ListEnvelope<SchemaDriftRow>)),
    tag = "workflow"
)]
pub async fn list_schema_drift(
    State(state): State<AppState>,
    Query(filter): Query<WorkflowFilter>,
    Query(list): Query<ListQuery>,
) -> Result<Json<ListEnvelope<SchemaDriftRow>>, ApiError> {
    let scope = filter.scope()?;
    let rows = state
        .workflow
        .list_schema_drift(filter.provider(), scope.as_ref())
        .await?;
    Ok(Json(ListEnvelope::from_vec(rows, list.page(), filter.applied())))
}

/// Records the latest spec version as the drift baseline
#[utoipa::path(
    post,
    path = "/sync/schema-drift/baseline",
    request_body = BaselineRequest,
    responses(
        (status = 200, description = "Baseline stored", body = SchemaBaseline),
        (status = 404, description = "Unknown spec", body = ApiError)
    ),
    tag = "workflow"
)]
pub async fn capture_baseline(
    State(state): State<AppState>,
    actor: ActorContext,
    JsonBody(mut request): JsonBody<BaselineRequest>,
) -> Result<Json<SchemaBaseline>, ApiError> {
    if request.captured_by.trim().is_empty() {
        request.captured_by = actor.key().to_string();
    }
    Ok(Json(state.workflow.capture_baseline(request).await?))
}

// ---- connections and callbacks ----

/// Active connections that a sync binding may target
#[utoipa::path(
    get,
    path = "/connection-candidates",
    params(WorkflowFilter, ListQuery),
    responses((status = 200, description = "Active connections", body = ListEnvelope<ConnectionView>)),
    tag = "workflow"
)]
pub async fn connection_candidates(
    State(state): State<AppState>,
    Query(filter): Query<WorkflowFilter>,
    Query(list): Query<ListQuery>,
) -> Result<Json<ListEnvelope<ConnectionView>>, ApiError> {
    let scope = filter.scope()?;
    let record_filter = RecordFilter {
        provider_id: filter.provider().map(str::to_string),
        scope_type: scope.as_ref().map(|s| s.scope_type.as_str().to_string()),
        scope_id: scope.as_ref().map(|s| s.id.clone()),
        status: Some(ConnectionStatus::Active.as_str().to_string()),
        ..RecordFilter::default()
    };
    let page = list.page();
    let (items, total) = state.facade.list_connections(&record_filter, page).await?;
    let mut applied = filter.applied();
    applied.insert("status".to_string(), ConnectionStatus::Active.as_str().to_string());
    Ok(Json(ListEnvelope::new(items, total, page, applied)))
}

/// Callback settings and the URL each registered provider resolves to
#[utoipa::path(
    get,
    path = "/callbacks/diagnostics/status",
    responses((status = 200, description = "Callback diagnostics", body = CallbackDiagnostics)),
    tag = "workflow"
)]
pub async fn callback_diagnostics(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Json<CallbackDiagnostics> {
    let config = state.callbacks.config();
    let providers = state
        .providers
        .ids()
        .into_iter()
        .map(|provider_id| {
            match state
                .callbacks
                .resolve(&provider_id, &CallbackParams::default(), Some(&headers))
            {
                Ok(resolution) => CallbackProviderStatus {
                    provider_id,
                    resolution: Some(resolution),
                    error: None,
                },
                Err(err) => CallbackProviderStatus {
                    provider_id,
                    resolution: None,
                    error: Some(err.message),
                },
            }
        })
        .collect();
    Json(CallbackDiagnostics {
        strict: config.strict,
        public_base_url: config.public_base_url.clone(),
        urlkit_group: config.urlkit_group.clone(),
        default_route: config.default_route.clone(),
        provider_routes: config.provider_routes.clone(),
        overridden_providers: config.provider_url_overrides.keys().cloned().collect(),
        providers,
    })
}

/// Resolves the callback URL for one provider and reference
#[utoipa::path(
    post,
    path = "/callbacks/diagnostics/preview",
    request_body = CallbackPreviewBody,
    responses(
        (status = 200, description = "Resolved callback", body = CallbackResolution),
        (status = 400, description = "Resolution failed in strict mode", body = ApiError)
    ),
    tag = "workflow"
)]
pub async fn callback_preview(
    State(state): State<AppState>,
    headers: HeaderMap,
    JsonBody(body): JsonBody<CallbackPreviewBody>,
) -> Result<Json<CallbackResolution>, ApiError> {
    Ok(Json(state.callbacks.resolve(
        &body.provider_id,
        &body.params,
        Some(&headers),
    )?))
}
