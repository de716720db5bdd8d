//! Workflow runtime: mapping lifecycle, sync planning and execution,
//! checkpoint resume, conflict ledger and schema drift.

use std::sync::Arc;

use chrono::Utc;
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{info, instrument, warn};
use utoipa::ToSchema;

use super::compiler::{self, canonical_hash};
use super::store::{MappingStore, SyncStateStore};
use super::types::*;
use crate::error::{ServiceError, ServiceResult};
use crate::models::new_id;
use crate::scope::ScopeRef;

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct PlanRequest {
    pub binding: SyncBinding,
    pub mode: SyncMode,
    #[serde(default)]
    pub from_checkpoint_id: Option<String>,
    #[serde(default)]
    pub limit: Option<u64>,
    #[serde(default)]
    pub metadata: Value,
}

#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct ResumeRequest {
    #[serde(default)]
    pub mode: Option<SyncMode>,
    #[serde(default)]
    pub limit: Option<u64>,
    /// When present the regenerated plan is executed immediately.
    #[serde(default)]
    pub changes: Option<Vec<SyncChange>>,
    #[serde(default)]
    pub metadata: Value,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ResumedRun {
    pub previous_run_id: String,
    pub plan: SyncRunPlan,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run: Option<SyncRunRecord>,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct BaselineRequest {
    pub provider_id: String,
    pub scope: ScopeRef,
    pub spec_id: String,
    #[serde(default)]
    pub captured_by: String,
    #[serde(default)]
    pub metadata: Value,
}

fn metadata_or_empty(value: Value) -> Value {
    if value.is_null() { json!({}) } else { value }
}

pub struct WorkflowRuntime {
    mappings: Arc<dyn MappingStore>,
    sync: Arc<dyn SyncStateStore>,
}

impl WorkflowRuntime {
    pub fn new(mappings: Arc<dyn MappingStore>, sync: Arc<dyn SyncStateStore>) -> Self {
        Self { mappings, sync }
    }

    pub fn mappings(&self) -> &Arc<dyn MappingStore> {
        &self.mappings
    }

    pub fn sync_store(&self) -> &Arc<dyn SyncStateStore> {
        &self.sync
    }

    // ---- mapping lifecycle ----

    /// Store a new draft. A zero version takes the next free version.
    #[instrument(skip(self, spec), fields(spec_id = %spec.spec_id))]
    pub async fn create_draft(&self, spec: MappingSpec) -> ServiceResult<MappingSpec> {
        let mut spec = compiler::compile(&spec).normalized_spec;
        if spec.spec_id.is_empty() || spec.provider_id.is_empty() {
            return Err(ServiceError::validation("spec_id and provider_id are required"));
        }
        if spec.version == 0 {
            spec.version = self
                .latest(&spec.provider_id, &spec.scope, &spec.spec_id)
                .await?
                .map_or(1, |s| s.version + 1);
        }
        let now = Utc::now();
        spec.id = new_id("map");
        spec.status = MappingStatus::Draft;
        spec.created_at = now;
        spec.updated_at = now;
        spec.published_at = None;
        spec.metadata = metadata_or_empty(spec.metadata);
        let spec = self.mappings.insert(spec).await?;
        info!(version = spec.version, "Mapping draft created");
        Ok(spec)
    }

    /// Replace a draft in place; only `draft` versions are editable.
    pub async fn update_draft(&self, spec: MappingSpec) -> ServiceResult<MappingSpec> {
        let mut spec = compiler::compile(&spec).normalized_spec;
        let existing = self.require(&spec.key()).await?;
        if existing.status != MappingStatus::Draft {
            return Err(ServiceError::conflict(format!(
                "mapping {} version {} is {}; only drafts can be updated",
                existing.spec_id,
                existing.version,
                existing.status.as_str()
            )));
        }
        spec.id = existing.id;
        spec.status = MappingStatus::Draft;
        spec.created_at = existing.created_at;
        spec.updated_at = Utc::now();
        spec.published_at = None;
        spec.metadata = metadata_or_empty(spec.metadata);
        self.mappings.replace(spec).await
    }

    /// Compile the stored draft and move it to `validated` when it has no
    /// error-level issues.
    pub async fn mark_validated(&self, key: &MappingKey) -> ServiceResult<MappingSpec> {
        let spec = self.require(key).await?;
        let report = compiler::compile(&spec);
        if report.has_errors() {
            return Err(ServiceError::validation("mapping has validation errors")
                .with_details(json!({ "issues": report.issues })));
        }
        self.mappings
            .transition(key, MappingStatus::Draft, MappingStatus::Validated, Utc::now())
            .await
    }

    pub async fn publish(&self, key: &MappingKey) -> ServiceResult<MappingSpec> {
        let spec = self
            .mappings
            .transition(key, MappingStatus::Validated, MappingStatus::Published, Utc::now())
            .await?;
        counter!("services_workflow_mappings_published_total").increment(1);
        info!(spec_id = %key.spec_id, version = key.version, "Mapping published");
        Ok(spec)
    }

    pub async fn unpublish(&self, key: &MappingKey) -> ServiceResult<MappingSpec> {
        self.mappings
            .transition(key, MappingStatus::Published, MappingStatus::Validated, Utc::now())
            .await
    }

    pub async fn get(&self, key: &MappingKey) -> ServiceResult<Option<MappingSpec>> {
        self.mappings.get(key).await
    }

    async fn require(&self, key: &MappingKey) -> ServiceResult<MappingSpec> {
        self.mappings.get(key).await?.ok_or_else(|| {
            ServiceError::not_found(format!(
                "mapping {} version {} not found",
                key.spec_id, key.version
            ))
        })
    }

    /// Highest stored version of a spec.
    pub async fn latest(
        &self,
        provider_id: &str,
        scope: &ScopeRef,
        spec_id: &str,
    ) -> ServiceResult<Option<MappingSpec>> {
        Ok(self
            .mappings
            .versions(provider_id, scope, spec_id)
            .await?
            .into_iter()
            .max_by_key(|s| s.version))
    }

    pub async fn versions(
        &self,
        provider_id: &str,
        scope: &ScopeRef,
        spec_id: &str,
    ) -> ServiceResult<Vec<MappingSpec>> {
        self.mappings.versions(provider_id, scope, spec_id).await
    }

    /// Latest version of every spec, ordered by spec id.
    pub async fn list_latest(
        &self,
        provider_id: Option<&str>,
        scope: Option<&ScopeRef>,
    ) -> ServiceResult<Vec<MappingSpec>> {
        let mut latest: Vec<MappingSpec> = Vec::new();
        for spec in self.mappings.list(provider_id, scope).await? {
            match latest.iter_mut().find(|s| {
                s.provider_id == spec.provider_id && s.scope == spec.scope && s.spec_id == spec.spec_id
            }) {
                Some(current) if current.version < spec.version => *current = spec,
                Some(_) => {}
                None => latest.push(spec),
            }
        }
        latest.sort_by(|a, b| a.spec_id.cmp(&b.spec_id).then(a.provider_id.cmp(&b.provider_id)));
        Ok(latest)
    }

    pub fn validate(&self, spec: &MappingSpec) -> CompileReport {
        compiler::compile(spec)
    }

    pub fn preview(&self, spec: &MappingSpec, samples: &[Value]) -> PreviewReport {
        compiler::preview(&compiler::compile(spec), samples)
    }

    // ---- sync planning and execution ----

    #[instrument(skip(self, request), fields(binding_id = %request.binding.id))]
    pub async fn plan_sync_run(&self, request: PlanRequest) -> ServiceResult<SyncRunPlan> {
        let mut binding = request.binding;
        if binding.id.trim().is_empty() {
            binding.id = new_id("bind");
        }
        binding.metadata = metadata_or_empty(binding.metadata);
        let binding = self.sync.upsert_binding(binding).await?;

        let checkpoint = match request.from_checkpoint_id.as_deref() {
            Some(id) => Some(self.sync.get_checkpoint(id).await?.ok_or_else(|| {
                ServiceError::not_found(format!("checkpoint {} not found", id))
            })?),
            None => {
                self.sync
                    .latest_checkpoint(
                        &binding.provider_id,
                        &binding.scope,
                        &binding.id,
                        binding.direction,
                    )
                    .await?
            }
        };
        if let Some(checkpoint) = &checkpoint
            && checkpoint.binding_id != binding.id
        {
            return Err(ServiceError::validation(format!(
                "checkpoint {} belongs to binding {}",
                checkpoint.id, checkpoint.binding_id
            )));
        }

        let checkpoint_id = checkpoint.as_ref().map(|c| c.id.clone());
        let sequence = checkpoint.as_ref().map_or(0, |c| c.sequence);
        let idempotency_seed = canonical_hash(&json!({
            "binding_id": binding.id,
            "direction": binding.direction,
            "checkpoint_id": checkpoint_id,
            "sequence": sequence,
        }));
        let deterministic_hash = canonical_hash(&json!({
            "seed": idempotency_seed,
            "mode": request.mode,
            "limit": request.limit,
            "mapping_spec_id": binding.mapping_spec_id,
        }));

        Ok(SyncRunPlan {
            id: new_id("plan"),
            binding_id: binding.id.clone(),
            provider_id: binding.provider_id.clone(),
            scope: binding.scope.clone(),
            direction: binding.direction,
            mode: request.mode,
            from_checkpoint_id: checkpoint_id,
            checkpoint,
            estimated_changes: request.limit.unwrap_or(0),
            idempotency_seed,
            deterministic_hash,
            metadata: metadata_or_empty(request.metadata),
            generated_at: Utc::now(),
        })
    }

    pub async fn run_sync_import(
        &self,
        plan: &SyncRunPlan,
        changes: &[SyncChange],
        metadata: Value,
    ) -> ServiceResult<SyncRunRecord> {
        self.run_direction(SyncDirection::Import, plan, changes, metadata)
            .await
    }

    pub async fn run_sync_export(
        &self,
        plan: &SyncRunPlan,
        changes: &[SyncChange],
        metadata: Value,
    ) -> ServiceResult<SyncRunRecord> {
        self.run_direction(SyncDirection::Export, plan, changes, metadata)
            .await
    }

    /// Execute `plan` in whichever direction it was planned for.
    pub async fn run_sync(
        &self,
        plan: &SyncRunPlan,
        changes: &[SyncChange],
        metadata: Value,
    ) -> ServiceResult<SyncRunRecord> {
        self.run_direction(plan.direction, plan, changes, metadata)
            .await
    }

    async fn run_direction(
        &self,
        direction: SyncDirection,
        plan: &SyncRunPlan,
        changes: &[SyncChange],
        metadata: Value,
    ) -> ServiceResult<SyncRunRecord> {
        if plan.direction != direction {
            return Err(ServiceError::validation(format!(
                "plan {} is an {} plan",
                plan.id,
                plan.direction.as_str()
            )));
        }
        self.execute(plan, changes, metadata, None).await
    }

    #[instrument(skip_all, fields(plan_id = %plan.id, binding_id = %plan.binding_id))]
    async fn execute(
        &self,
        plan: &SyncRunPlan,
        changes: &[SyncChange],
        metadata: Value,
        resumed_from: Option<String>,
    ) -> ServiceResult<SyncRunRecord> {
        let binding = self.sync.get_binding(&plan.binding_id).await?.ok_or_else(|| {
            ServiceError::not_found(format!("binding {} not found", plan.binding_id))
        })?;
        if binding.status != BindingStatus::Active {
            return Err(ServiceError::conflict(format!(
                "binding {} is not active",
                binding.id
            )));
        }
        let compiled = self.published_mapping(&binding).await?;

        let run_id = new_id("run");
        let limit = usize::try_from(plan.estimated_changes)
            .ok()
            .filter(|l| *l > 0)
            .unwrap_or(changes.len());
        let mut result = SyncRunResult {
            run_id: run_id.clone(),
            status: RunStatus::Running,
            processed_count: 0,
            skipped_count: 0,
            conflict_count: 0,
            failed_count: 0,
            next_checkpoint: None,
        };
        let mut last_cursor = None;

        for change in changes.iter().take(limit) {
            let key = canonical_hash(&json!([
                plan.idempotency_seed,
                change.source_object,
                change.external_id,
                change.source_version,
            ]));

            let mapped = match &compiled {
                Some(compiled) => match compiler::apply(compiled, &change.payload) {
                    Ok(mapped) => mapped,
                    Err(issues) => {
                        result.failed_count += 1;
                        warn!(external_id = %change.external_id, issues = issues.len(), "Change failed mapping");
                        continue;
                    }
                },
                None => change.payload.clone(),
            };

            if let Some(previous) = self
                .sync
                .last_source_version(&binding.id, &change.source_object, &change.external_id)
                .await?
                && compare_source_versions(&previous, &change.source_version).is_gt()
            {
                result.conflict_count += 1;
                if plan.mode == SyncMode::Apply {
                    self.record_sync_conflict(
                        SyncConflict {
                            id: String::new(),
                            provider_id: binding.provider_id.clone(),
                            scope: binding.scope.clone(),
                            binding_id: binding.id.clone(),
                            run_id: run_id.clone(),
                            source_object: change.source_object.clone(),
                            external_id: change.external_id.clone(),
                            source_version: change.source_version.clone(),
                            reason: format!(
                                "stale source version {} (last applied {})",
                                change.source_version, previous
                            ),
                            status: ConflictStatus::Pending,
                            resolution: None,
                            metadata: json!({}),
                            created_at: Utc::now(),
                            resolved_at: None,
                            resolved_by: None,
                        },
                        json!({}),
                    )
                    .await?;
                }
                continue;
            }

            if plan.mode == SyncMode::Apply {
                let appended = self
                    .sync
                    .append_change(ChangeLogEntry {
                        id: new_id("chg"),
                        provider_id: binding.provider_id.clone(),
                        scope: binding.scope.clone(),
                        binding_id: binding.id.clone(),
                        direction: binding.direction,
                        source_object: change.source_object.clone(),
                        external_id: change.external_id.clone(),
                        source_version: change.source_version.clone(),
                        idempotency_key: key,
                        run_id: run_id.clone(),
                        payload: mapped,
                        created_at: Utc::now(),
                    })
                    .await?;
                if !appended {
                    result.skipped_count += 1;
                    continue;
                }
            }
            result.processed_count += 1;
            if change.cursor.is_some() {
                last_cursor = change.cursor.clone();
            }
        }

        result.status = if result.failed_count > 0 && result.processed_count == 0 {
            RunStatus::Failed
        } else {
            RunStatus::Succeeded
        };
        if plan.mode == SyncMode::Apply {
            let checkpoint = self
                .sync
                .append_checkpoint(
                    &binding,
                    &run_id,
                    last_cursor,
                    json!({ "status": result.status, "plan_id": plan.id }),
                )
                .await?;
            result.next_checkpoint = Some(checkpoint);
        }

        counter!(
            "services_workflow_sync_runs_total",
            "direction" => binding.direction.as_str(),
            "status" => if result.status == RunStatus::Succeeded { "succeeded" } else { "failed" }
        )
        .increment(1);
        info!(
            processed = result.processed_count,
            skipped = result.skipped_count,
            conflicts = result.conflict_count,
            failed = result.failed_count,
            "Sync run finished"
        );

        self.sync
            .save_run(SyncRunRecord {
                run_id,
                provider_id: binding.provider_id.clone(),
                scope: binding.scope.clone(),
                binding_id: binding.id.clone(),
                direction: binding.direction,
                plan: plan.clone(),
                result,
                resumed_from,
                metadata: metadata_or_empty(metadata),
                created_at: Utc::now(),
            })
            .await
    }

    /// Compiled latest published mapping for the binding, if one exists.
    async fn published_mapping(&self, binding: &SyncBinding) -> ServiceResult<Option<CompiledMapping>> {
        let published = self
            .mappings
            .versions(&binding.provider_id, &binding.scope, &binding.mapping_spec_id)
            .await?
            .into_iter()
            .filter(|s| s.status == MappingStatus::Published)
            .max_by_key(|s| s.version);
        Ok(published.map(|spec| compiler::compile(&spec).compiled))
    }

    pub async fn get_run(&self, run_id: &str) -> ServiceResult<SyncRunRecord> {
        self.sync
            .get_run(run_id)
            .await?
            .ok_or_else(|| ServiceError::not_found(format!("sync run {} not found", run_id)))
    }

    pub async fn list_runs(
        &self,
        provider_id: Option<&str>,
        scope: Option<&ScopeRef>,
    ) -> ServiceResult<Vec<SyncRunRecord>> {
        self.sync.list_runs(provider_id, scope).await
    }

    pub async fn get_checkpoint(&self, id: &str) -> ServiceResult<SyncCheckpoint> {
        self.sync
            .get_checkpoint(id)
            .await?
            .ok_or_else(|| ServiceError::not_found(format!("checkpoint {} not found", id)))
    }

    /// Re-plan from where `previous_run_id` stopped: its next checkpoint, or
    /// the checkpoint its plan started from.
    #[instrument(skip(self, request))]
    pub async fn resume_sync_run(
        &self,
        previous_run_id: &str,
        request: ResumeRequest,
    ) -> ServiceResult<ResumedRun> {
        let previous = self.get_run(previous_run_id).await?;
        let from_checkpoint_id = previous
            .result
            .next_checkpoint
            .as_ref()
            .map(|c| c.id.clone())
            .or_else(|| previous.plan.checkpoint.as_ref().map(|c| c.id.clone()));
        let binding = self
            .sync
            .get_binding(&previous.binding_id)
            .await?
            .ok_or_else(|| {
                ServiceError::not_found(format!("binding {} not found", previous.binding_id))
            })?;

        let plan = self
            .plan_sync_run(PlanRequest {
                binding,
                mode: request.mode.unwrap_or(previous.plan.mode),
                from_checkpoint_id,
                limit: request.limit.or(Some(previous.plan.estimated_changes)).filter(|l| *l > 0),
                metadata: metadata_or_empty(request.metadata.clone()),
            })
            .await?;

        let run = match &request.changes {
            Some(changes) => Some(
                self.execute(
                    &plan,
                    changes,
                    request.metadata,
                    Some(previous.run_id.clone()),
                )
                .await?,
            ),
            None => None,
        };
        Ok(ResumedRun {
            previous_run_id: previous.run_id,
            plan,
            run,
        })
    }

    // ---- conflict ledger ----

    pub async fn record_sync_conflict(
        &self,
        mut conflict: SyncConflict,
        metadata: Value,
    ) -> ServiceResult<SyncConflict> {
        if conflict.id.trim().is_empty() {
            conflict.id = new_id("cfl");
        }
        conflict.status = ConflictStatus::Pending;
        conflict.resolution = None;
        conflict.resolved_at = None;
        conflict.resolved_by = None;
        if !metadata.is_null() {
            conflict.metadata = metadata;
        }
        conflict.metadata = metadata_or_empty(conflict.metadata);
        counter!("services_workflow_conflicts_total").increment(1);
        self.sync.insert_conflict(conflict).await
    }

    /// `resolve` → resolved, `ignore` → ignored, `retry` re-opens as pending.
    pub async fn resolve_sync_conflict(
        &self,
        provider_id: &str,
        scope: &ScopeRef,
        conflict_id: &str,
        resolution: ConflictResolution,
        metadata: Value,
    ) -> ServiceResult<SyncConflict> {
        let mut conflict = self.get_conflict(conflict_id).await?;
        if conflict.provider_id != provider_id || &conflict.scope != scope {
            return Err(ServiceError::not_found(format!(
                "sync conflict {} not found",
                conflict_id
            )));
        }
        let now = Utc::now();
        conflict.status = match resolution.action {
            ResolutionAction::Resolve => ConflictStatus::Resolved,
            ResolutionAction::Ignore => ConflictStatus::Ignored,
            ResolutionAction::Retry => ConflictStatus::Pending,
        };
        match conflict.status {
            ConflictStatus::Pending => {
                conflict.resolved_at = None;
                conflict.resolved_by = None;
            }
            _ => {
                conflict.resolved_at = Some(now);
                conflict.resolved_by = Some(resolution.resolved_by.clone())
                    .filter(|by| !by.trim().is_empty());
            }
        }
        conflict.resolution = Some(resolution);
        if !metadata.is_null() {
            conflict.metadata = metadata;
        }
        self.sync.update_conflict(conflict).await
    }

    pub async fn get_conflict(&self, id: &str) -> ServiceResult<SyncConflict> {
        self.sync
            .get_conflict(id)
            .await?
            .ok_or_else(|| ServiceError::not_found(format!("sync conflict {} not found", id)))
    }

    pub async fn list_conflicts(
        &self,
        provider_id: Option<&str>,
        scope: Option<&ScopeRef>,
        status: Option<ConflictStatus>,
    ) -> ServiceResult<Vec<SyncConflict>> {
        self.sync.list_conflicts(provider_id, scope, status).await
    }

    // ---- schema drift ----

    /// Snapshot the latest mapping version's schema ref as the baseline.
    pub async fn capture_baseline(&self, request: BaselineRequest) -> ServiceResult<SchemaBaseline> {
        let latest = self
            .latest(&request.provider_id, &request.scope, &request.spec_id)
            .await?
            .ok_or_else(|| {
                ServiceError::not_found(format!("mapping {} not found", request.spec_id))
            })?;
        self.sync
            .put_baseline(SchemaBaseline {
                provider_id: latest.provider_id,
                scope: latest.scope,
                spec_id: latest.spec_id,
                version: latest.version,
                schema_ref: latest.schema_ref,
                captured_at: Utc::now(),
                captured_by: request.captured_by,
                metadata: metadata_or_empty(request.metadata),
            })
            .await
    }

    pub async fn list_schema_drift(
        &self,
        provider_id: Option<&str>,
        scope: Option<&ScopeRef>,
    ) -> ServiceResult<Vec<SchemaDriftRow>> {
        let mut rows = Vec::new();
        for spec in self.list_latest(provider_id, scope).await? {
            let baseline = self
                .sync
                .get_baseline(&spec.provider_id, &spec.scope, &spec.spec_id)
                .await?;
            let status = drift_status(&spec.schema_ref, baseline.as_ref());
            rows.push(SchemaDriftRow {
                spec_id: spec.spec_id,
                version: spec.version,
                schema_ref: spec.schema_ref,
                baseline,
                status,
            });
        }
        Ok(rows)
    }
}

pub fn drift_status(current: &str, baseline: Option<&SchemaBaseline>) -> DriftStatus {
    let Some(baseline) = baseline else {
        return DriftStatus::BaselineMissing;
    };
    let (current, captured) = (current.trim(), baseline.schema_ref.trim());
    if !current.is_empty() && !captured.is_empty() && !current.eq_ignore_ascii_case(captured) {
        DriftStatus::DriftDetected
    } else {
        DriftStatus::InSync
    }
}
