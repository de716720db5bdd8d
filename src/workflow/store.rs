//! Workflow storage interfaces and their in-memory implementations.
//!
//! Each in-memory collection sits behind its own mutex, held only while the
//! map is read or written. Everything returned to callers is cloned.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use super::types::*;
use crate::error::{ServiceError, ServiceResult};
use crate::models::new_id;
use crate::scope::ScopeRef;

#[async_trait]
pub trait MappingStore: Send + Sync {
    /// Fails with `conflict` when the `(provider, scope, spec_id, version)` exists.
    async fn insert(&self, spec: MappingSpec) -> ServiceResult<MappingSpec>;

    async fn replace(&self, spec: MappingSpec) -> ServiceResult<MappingSpec>;

    async fn get(&self, key: &MappingKey) -> ServiceResult<Option<MappingSpec>>;

    /// All versions of one spec, lowest version first.
    async fn versions(
        &self,
        provider_id: &str,
        scope: &ScopeRef,
        spec_id: &str,
    ) -> ServiceResult<Vec<MappingSpec>>;

    async fn list(
        &self,
        provider_id: Option<&str>,
        scope: Option<&ScopeRef>,
    ) -> ServiceResult<Vec<MappingSpec>>;

    /// Move one version from `from` to `to` atomically.
    async fn transition(
        &self,
        key: &MappingKey,
        from: MappingStatus,
        to: MappingStatus,
        now: DateTime<Utc>,
    ) -> ServiceResult<MappingSpec>;
}

/// Bindings, checkpoints, change log, runs, conflicts and schema baselines.
#[async_trait]
pub trait SyncStateStore: Send + Sync {
    async fn upsert_binding(&self, binding: SyncBinding) -> ServiceResult<SyncBinding>;

    async fn get_binding(&self, id: &str) -> ServiceResult<Option<SyncBinding>>;

    async fn latest_checkpoint(
        &self,
        provider_id: &str,
        scope: &ScopeRef,
        binding_id: &str,
        direction: SyncDirection,
    ) -> ServiceResult<Option<SyncCheckpoint>>;

    async fn get_checkpoint(&self, id: &str) -> ServiceResult<Option<SyncCheckpoint>>;

    /// Persist the next checkpoint; `sequence` is assigned by the store.
    async fn append_checkpoint(
        &self,
        binding: &SyncBinding,
        run_id: &str,
        cursor: Option<String>,
        metadata: Value,
    ) -> ServiceResult<SyncCheckpoint>;

    /// Returns `false` when the idempotency key was already recorded.
    async fn append_change(&self, entry: ChangeLogEntry) -> ServiceResult<bool>;

    /// Latest recorded source version for one external record.
    async fn last_source_version(
        &self,
        binding_id: &str,
        source_object: &str,
        external_id: &str,
    ) -> ServiceResult<Option<String>>;

    async fn save_run(&self, run: SyncRunRecord) -> ServiceResult<SyncRunRecord>;

    async fn get_run(&self, run_id: &str) -> ServiceResult<Option<SyncRunRecord>>;

    async fn list_runs(
        &self,
        provider_id: Option<&str>,
        scope: Option<&ScopeRef>,
    ) -> ServiceResult<Vec<SyncRunRecord>>;

    async fn insert_conflict(&self, conflict: SyncConflict) -> ServiceResult<SyncConflict>;

    async fn update_conflict(&self, conflict: SyncConflict) -> ServiceResult<SyncConflict>;

    async fn get_conflict(&self, id: &str) -> ServiceResult<Option<SyncConflict>>;

    async fn list_conflicts(
        &self,
        provider_id: Option<&str>,
        scope: Option<&ScopeRef>,
        status: Option<ConflictStatus>,
    ) -> ServiceResult<Vec<SyncConflict>>;

    async fn put_baseline(&self, baseline: SchemaBaseline) -> ServiceResult<SchemaBaseline>;

    async fn get_baseline(
        &self,
        provider_id: &str,
        scope: &ScopeRef,
        spec_id: &str,
    ) -> ServiceResult<Option<SchemaBaseline>>;
}

fn in_scope(
    provider_id: &str,
    scope: &ScopeRef,
    want_provider: Option<&str>,
    want_scope: Option<&ScopeRef>,
) -> bool {
    want_provider.is_none_or(|p| p == provider_id) && want_scope.is_none_or(|s| s == scope)
}

#[derive(Debug, Default)]
pub struct MemoryMappingStore {
    specs: Mutex<BTreeMap<MappingKey, MappingSpec>>,
}

impl MemoryMappingStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MappingStore for MemoryMappingStore {
    async fn insert(&self, spec: MappingSpec) -> ServiceResult<MappingSpec> {
        let mut specs = self.specs.lock().unwrap_or_else(PoisonError::into_inner);
        let key = spec.key();
        if specs.contains_key(&key) {
            return Err(ServiceError::conflict(format!(
                "mapping {} version {} already exists",
                key.spec_id, key.version
            )));
        }
        specs.insert(key, spec.clone());
        Ok(spec)
    }

    async fn replace(&self, spec: MappingSpec) -> ServiceResult<MappingSpec> {
        let mut specs = self.specs.lock().unwrap_or_else(PoisonError::into_inner);
        let key = spec.key();
        match specs.get_mut(&key) {
            Some(slot) => {
                *slot = spec.clone();
                Ok(spec)
            }
            None => Err(ServiceError::not_found(format!(
                "mapping {} version {} not found",
                key.spec_id, key.version
            ))),
        }
    }

    async fn get(&self, key: &MappingKey) -> ServiceResult<Option<MappingSpec>> {
        let specs = self.specs.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(specs.get(key).cloned())
    }

    async fn versions(
        &self,
        provider_id: &str,
        scope: &ScopeRef,
        spec_id: &str,
    ) -> ServiceResult<Vec<MappingSpec>> {
        let specs = self.specs.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(specs
            .values()
            .filter(|s| s.provider_id == provider_id && &s.scope == scope && s.spec_id == spec_id)
            .cloned()
            .collect())
    }

    async fn list(
        &self,
        provider_id: Option<&str>,
        scope: Option<&ScopeRef>,
    ) -> ServiceResult<Vec<MappingSpec>> {
        let specs = self.specs.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(specs
            .values()
            .filter(|s| in_scope(&s.provider_id, &s.scope, provider_id, scope))
            .cloned()
            .collect())
    }

    async fn transition(
        &self,
        key: &MappingKey,
        from: MappingStatus,
        to: MappingStatus,
        now: DateTime<Utc>,
    ) -> ServiceResult<MappingSpec> {
        let mut specs = self.specs.lock().unwrap_or_else(PoisonError::into_inner);
        let spec = specs.get_mut(key).ok_or_else(|| {
            ServiceError::not_found(format!(
                "mapping {} version {} not found",
                key.spec_id, key.version
            ))
        })?;
        if spec.status != from {
            return Err(ServiceError::conflict(format!(
                "mapping {} version {} is {}, expected {}",
                key.spec_id,
                key.version,
                spec.status.as_str(),
                from.as_str()
            )));
        }
        spec.status = to;
        spec.updated_at = now;
        spec.published_at = match to {
            MappingStatus::Published => Some(now),
            _ => None,
        };
        Ok(spec.clone())
    }
}

#[derive(Debug, Default)]
pub struct MemorySyncStore {
    bindings: Mutex<BTreeMap<String, SyncBinding>>,
    checkpoints: Mutex<Vec<SyncCheckpoint>>,
    change_log: Mutex<BTreeMap<String, ChangeLogEntry>>,
    runs: Mutex<BTreeMap<String, SyncRunRecord>>,
    conflicts: Mutex<BTreeMap<String, SyncConflict>>,
    baselines: Mutex<BTreeMap<(String, ScopeRef, String), SchemaBaseline>>,
}

impl MemorySyncStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn change_log_len(&self) -> usize {
        self.change_log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[async_trait]
impl SyncStateStore for MemorySyncStore {
    async fn upsert_binding(&self, binding: SyncBinding) -> ServiceResult<SyncBinding> {
        let mut bindings = self.bindings.lock().unwrap_or_else(PoisonError::into_inner);
        bindings.insert(binding.id.clone(), binding.clone());
        Ok(binding)
    }

    async fn get_binding(&self, id: &str) -> ServiceResult<Option<SyncBinding>> {
        let bindings = self.bindings.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(bindings.get(id).cloned())
    }

    async fn latest_checkpoint(
        &self,
        provider_id: &str,
        scope: &ScopeRef,
        binding_id: &str,
        direction: SyncDirection,
    ) -> ServiceResult<Option<SyncCheckpoint>> {
        let checkpoints = self
            .checkpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Ok(checkpoints
            .iter()
            .filter(|c| {
                c.provider_id == provider_id
                    && &c.scope == scope
                    && c.binding_id == binding_id
                    && c.direction == direction
            })
            .max_by_key(|c| c.sequence)
            .cloned())
    }

    async fn get_checkpoint(&self, id: &str) -> ServiceResult<Option<SyncCheckpoint>> {
        let checkpoints = self
            .checkpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Ok(checkpoints.iter().find(|c| c.id == id).cloned())
    }

    async fn append_checkpoint(
        &self,
        binding: &SyncBinding,
        run_id: &str,
        cursor: Option<String>,
        metadata: Value,
    ) -> ServiceResult<SyncCheckpoint> {
        let mut checkpoints = self
            .checkpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let last = checkpoints
            .iter()
            .filter(|c| {
                c.provider_id == binding.provider_id
                    && c.scope == binding.scope
                    && c.binding_id == binding.id
                    && c.direction == binding.direction
            })
            .max_by_key(|c| c.sequence);
        let sequence = last.map_or(1, |c| c.sequence + 1);
        let cursor = cursor.or_else(|| last.and_then(|c| c.cursor.clone()));
        let checkpoint = SyncCheckpoint {
            id: new_id("chk"),
            provider_id: binding.provider_id.clone(),
            scope: binding.scope.clone(),
            binding_id: binding.id.clone(),
            direction: binding.direction,
            sequence,
            cursor,
            run_id: run_id.to_string(),
            metadata,
            created_at: Utc::now(),
        };
        checkpoints.push(checkpoint.clone());
        Ok(checkpoint)
    }

    async fn append_change(&self, entry: ChangeLogEntry) -> ServiceResult<bool> {
        let mut log = self.change_log.lock().unwrap_or_else(PoisonError::into_inner);
        if log.contains_key(&entry.idempotency_key) {
            return Ok(false);
        }
        log.insert(entry.idempotency_key.clone(), entry);
        Ok(true)
    }

    async fn last_source_version(
        &self,
        binding_id: &str,
        source_object: &str,
        external_id: &str,
    ) -> ServiceResult<Option<String>> {
        let log = self.change_log.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(log
            .values()
            .filter(|e| {
                e.binding_id == binding_id
                    && e.source_object == source_object
                    && e.external_id == external_id
            })
            .map(|e| e.source_version.as_str())
            .max_by(|l, r| compare_source_versions(l, r))
            .map(str::to_string))
    }

    async fn save_run(&self, run: SyncRunRecord) -> ServiceResult<SyncRunRecord> {
        let mut runs = self.runs.lock().unwrap_or_else(PoisonError::into_inner);
        runs.insert(run.run_id.clone(), run.clone());
        Ok(run)
    }

    async fn get_run(&self, run_id: &str) -> ServiceResult<Option<SyncRunRecord>> {
        let runs = self.runs.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(runs.get(run_id).cloned())
    }

    async fn list_runs(
        &self,
        provider_id: Option<&str>,
        scope: Option<&ScopeRef>,
    ) -> ServiceResult<Vec<SyncRunRecord>> {
        let runs = self.runs.lock().unwrap_or_else(PoisonError::into_inner);
        let mut items: Vec<_> = runs
            .values()
            .filter(|r| in_scope(&r.provider_id, &r.scope, provider_id, scope))
            .cloned()
            .collect();
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(items)
    }

    async fn insert_conflict(&self, conflict: SyncConflict) -> ServiceResult<SyncConflict> {
        let mut conflicts = self.conflicts.lock().unwrap_or_else(PoisonError::into_inner);
        if conflicts.contains_key(&conflict.id) {
            return Err(ServiceError::conflict(format!(
                "sync conflict {} already exists",
                conflict.id
            )));
        }
        conflicts.insert(conflict.id.clone(), conflict.clone());
        Ok(conflict)
    }

    async fn update_conflict(&self, conflict: SyncConflict) -> ServiceResult<SyncConflict> {
        let mut conflicts = self.conflicts.lock().unwrap_or_else(PoisonError::into_inner);
        match conflicts.get_mut(&conflict.id) {
            Some(slot) => {
                *slot = conflict.clone();
                Ok(conflict)
            }
            None => Err(ServiceError::not_found(format!(
                "sync conflict {} not found",
                conflict.id
            ))),
        }
    }

    async fn get_conflict(&self, id: &str) -> ServiceResult<Option<SyncConflict>> {
        let conflicts = self.conflicts.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(conflicts.get(id).cloned())
    }

    async fn list_conflicts(
        &self,
        provider_id: Option<&str>,
        scope: Option<&ScopeRef>,
        status: Option<ConflictStatus>,
    ) -> ServiceResult<Vec<SyncConflict>> {
        let conflicts = self.conflicts.lock().unwrap_or_else(PoisonError::into_inner);
        let mut items: Vec<_> = conflicts
            .values()
            .filter(|c| in_scope(&c.provider_id, &c.scope, provider_id, scope))
            .filter(|c| status.is_none_or(|s| c.status == s))
            .cloned()
            .collect();
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(items)
    }

    async fn put_baseline(&self, baseline: SchemaBaseline) -> ServiceResult<SchemaBaseline> {
        let mut baselines = self.baselines.lock().unwrap_or_else(PoisonError::into_inner);
        baselines.insert(
            (
                baseline.provider_id.clone(),
                baseline.scope.clone(),
                baseline.spec_id.clone(),
            ),
            baseline.clone(),
        );
        Ok(baseline)
    }

    async fn get_baseline(
        &self,
        provider_id: &str,
        scope: &ScopeRef,
        spec_id: &str,
    ) -> ServiceResult<Option<SchemaBaseline>> {
        let baselines = self.baselines.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(baselines
            .get(&(provider_id.to_string(), scope.clone(), spec_id.to_string()))
            .cloned())
    }
}
