//! Workflow records: mapping specs, sync bindings, plans, runs, checkpoints,
//! change-log entries, conflicts and schema baselines.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

use crate::scope::ScopeRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum MappingStatus {
    Draft,
    Validated,
    Published,
}

impl MappingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MappingStatus::Draft => "draft",
            MappingStatus::Validated => "validated",
            MappingStatus::Published => "published",
        }
    }
}

/// Copies one source field into one target field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct MappingRule {
    pub source_path: String,
    pub target_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct MappingSpec {
    #[serde(default)]
    pub id: String,
    pub spec_id: String,
    pub provider_id: String,
    pub scope: ScopeRef,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub source_object: String,
    pub target_model: String,
    #[serde(default)]
    pub schema_ref: String,
    #[serde(default)]
    pub version: u32,
    #[serde(default = "default_mapping_status")]
    pub status: MappingStatus,
    #[serde(default)]
    pub rules: Vec<MappingRule>,
    #[serde(default)]
    pub metadata: Value,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
}

fn default_mapping_status() -> MappingStatus {
    MappingStatus::Draft
}

impl MappingSpec {
    pub fn key(&self) -> MappingKey {
        MappingKey {
            provider_id: self.provider_id.clone(),
            scope: self.scope.clone(),
            spec_id: self.spec_id.clone(),
            version: self.version,
        }
    }
}

/// `(provider, scope, spec_id, version)`; unique across mapping specs.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MappingKey {
    pub provider_id: String,
    pub scope: ScopeRef,
    pub spec_id: String,
    pub version: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum IssueSeverity {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ValidationIssue {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    pub severity: IssueSeverity,
}

impl ValidationIssue {
    pub fn error(code: &str, message: impl Into<String>, field: Option<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            field,
            severity: IssueSeverity::Error,
        }
    }

    pub fn warning(code: &str, message: impl Into<String>, field: Option<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            field,
            severity: IssueSeverity::Warning,
        }
    }

    pub fn is_error(&self) -> bool {
        self.severity == IssueSeverity::Error
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct CompiledMapping {
    pub spec_id: String,
    pub version: u32,
    pub source_object: String,
    pub target_model: String,
    pub rules: Vec<MappingRule>,
    pub deterministic_hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct CompileReport {
    pub normalized_spec: MappingSpec,
    pub compiled: CompiledMapping,
    pub issues: Vec<ValidationIssue>,
}

impl CompileReport {
    pub fn has_errors(&self) -> bool {
        self.issues.iter().any(ValidationIssue::is_error)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct PreviewSummary {
    pub total: usize,
    pub mapped: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct PreviewReport {
    pub records: Vec<Value>,
    pub report: PreviewSummary,
    pub issues: Vec<ValidationIssue>,
    pub deterministic_hash: String,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    Import,
    Export,
}

impl SyncDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncDirection::Import => "import",
            SyncDirection::Export => "export",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum BindingStatus {
    Active,
    Paused,
    Archived,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct SyncBinding {
    pub id: String,
    pub provider_id: String,
    pub scope: ScopeRef,
    pub connection_id: String,
    pub mapping_spec_id: String,
    pub source_object: String,
    pub target_model: String,
    pub direction: SyncDirection,
    #[serde(default = "default_binding_status")]
    pub status: BindingStatus,
    #[serde(default)]
    pub metadata: Value,
}

fn default_binding_status() -> BindingStatus {
    BindingStatus::Active
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    DryRun,
    Apply,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct SyncCheckpoint {
    pub id: String,
    pub provider_id: String,
    pub scope: ScopeRef,
    pub binding_id: String,
    pub direction: SyncDirection,
    /// Strictly increasing per `(provider, scope, binding, direction)`.
    pub sequence: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
    pub run_id: String,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct SyncRunPlan {
    pub id: String,
    pub binding_id: String,
    pub provider_id: String,
    pub scope: ScopeRef,
    pub direction: SyncDirection,
    pub mode: SyncMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_checkpoint_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<SyncCheckpoint>,
    pub estimated_changes: u64,
    pub idempotency_seed: String,
    pub deterministic_hash: String,
    pub metadata: Value,
    pub generated_at: DateTime<Utc>,
}

/// One upstream (import) or local (export) change fed to the runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct SyncChange {
    pub source_object: String,
    pub external_id: String,
    pub source_version: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
}

/// Orders two source versions: numerically when both are unsigned integers,
/// otherwise by plain string order.
pub fn compare_source_versions(left: &str, right: &str) -> Ordering {
    match (left.parse::<u128>(), right.parse::<u128>()) {
        (Ok(l), Ok(r)) => l.cmp(&r),
        _ => left.cmp(right),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Planned,
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct SyncRunResult {
    pub run_id: String,
    pub status: RunStatus,
    pub processed_count: u64,
    pub skipped_count: u64,
    pub conflict_count: u64,
    pub failed_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_checkpoint: Option<SyncCheckpoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct SyncRunRecord {
    pub run_id: String,
    pub provider_id: String,
    pub scope: ScopeRef,
    pub binding_id: String,
    pub direction: SyncDirection,
    pub plan: SyncRunPlan,
    pub result: SyncRunResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resumed_from: Option<String>,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ChangeLogEntry {
    pub id: String,
    pub provider_id: String,
    pub scope: ScopeRef,
    pub binding_id: String,
    pub direction: SyncDirection,
    pub source_object: String,
    pub external_id: String,
    pub source_version: String,
    /// Unique across the change log.
    pub idempotency_key: String,
    pub run_id: String,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStatus {
    Pending,
    Resolved,
    Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionAction {
    Resolve,
    Ignore,
    Retry,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ConflictResolution {
    pub action: ResolutionAction,
    #[serde(default)]
    pub patch: Value,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub resolved_by: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct SyncConflict {
    #[serde(default)]
    pub id: String,
    pub provider_id: String,
    pub scope: ScopeRef,
    pub binding_id: String,
    #[serde(default)]
    pub run_id: String,
    pub source_object: String,
    pub external_id: String,
    #[serde(default)]
    pub source_version: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default = "default_conflict_status")]
    pub status: ConflictStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<ConflictResolution>,
    #[serde(default)]
    pub metadata: Value,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<String>,
}

fn default_conflict_status() -> ConflictStatus {
    ConflictStatus::Pending
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct SchemaBaseline {
    pub provider_id: String,
    pub scope: ScopeRef,
    pub spec_id: String,
    pub version: u32,
    pub schema_ref: String,
    pub captured_at: DateTime<Utc>,
    pub captured_by: String,
    pub metadata: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum DriftStatus {
    BaselineMissing,
    DriftDetected,
    InSync,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct SchemaDriftRow {
    pub spec_id: String,
    pub version: u32,
    pub schema_ref: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline: Option<SchemaBaseline>,
    pub status: DriftStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_versions_compare_numerically() {
        assert_eq!(compare_source_versions("9", "10"), Ordering::Less);
        assert_eq!(compare_source_versions("0010", "10"), Ordering::Equal);
        assert_eq!(compare_source_versions("11", "2"), Ordering::Greater);
    }

    #[test]
    fn other_versions_fall_back_to_string_order() {
        assert_eq!(compare_source_versions("v9", "v10"), Ordering::Greater);
        assert_eq!(
            compare_source_versions("2025-01-02T00:00:00Z", "2025-01-10T00:00:00Z"),
            Ordering::Less
        );
        assert_eq!(compare_source_versions("10", "abc"), Ordering::Less);
    }
}
