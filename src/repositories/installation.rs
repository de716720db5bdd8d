//! Installation repository for database operations

use std::sync::Arc;

use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, IntoActiveModel,
    PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, Select, Set,
};
use serde_json::Value as JsonValue;

use super::RecordFilter;
use crate::error::{ServiceError, ServiceResult};
use crate::models::installation::{self, Column, Entity as Installation};
use crate::models::status::InstallationStatus;
use crate::models::{new_id, now};
use crate::scope::ScopeRef;

/// Repository for installation database operations
#[derive(Debug, Clone)]
pub struct InstallationRepository {
    pub db: Arc<DatabaseConnection>,
}

impl InstallationRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    pub async fn get(&self, id: &str) -> ServiceResult<Option<installation::Model>> {
        Ok(Installation::find_by_id(id.to_string())
            .one(&*self.db)
            .await?)
    }

    /// The installation owning `(provider_id, scope)`, if any.
    pub async fn find_by_scope(
        &self,
        provider_id: &str,
        scope: &ScopeRef,
    ) -> ServiceResult<Option<installation::Model>> {
        Ok(Installation::find()
            .filter(Column::ProviderId.eq(provider_id))
            .filter(Column::ScopeType.eq(scope.scope_type.as_str()))
            .filter(Column::ScopeId.eq(scope.id.as_str()))
            .one(&*self.db)
            .await?)
    }

    /// Insert or update the installation for `(provider_id, scope)`.
    ///
    /// Reactivating an uninstalled row is rejected. An upsert that changes
    /// nothing, including one that repeats `uninstalled`, returns the stored
    /// row untouched.
    pub async fn upsert(
        &self,
        provider_id: &str,
        scope: &ScopeRef,
        install_type: &str,
        status: InstallationStatus,
        metadata: JsonValue,
    ) -> ServiceResult<installation::Model> {
        let now = now();
        match self.find_by_scope(provider_id, scope).await? {
            Some(existing) => {
                let current: InstallationStatus = existing
                    .status
                    .parse()
                    .map_err(|e| ServiceError::internal(format!("{}", e)))?;
                if current == InstallationStatus::Uninstalled
                    && status != InstallationStatus::Uninstalled
                {
                    return Err(ServiceError::conflict(format!(
                        "installation {} is uninstalled",
                        existing.id
                    )));
                }
                if current == InstallationStatus::Uninstalled
                    || (current == status
                        && existing.install_type == install_type
                        && existing.metadata == metadata)
                {
                    return Ok(existing);
                }

                let granted_at = existing.granted_at;
                let mut active = existing.into_active_model();
                active.install_type = Set(install_type.to_string());
                active.status = Set(status.as_str().to_string());
                active.metadata = Set(metadata);
                if status == InstallationStatus::Active && granted_at.is_none() {
                    active.granted_at = Set(Some(now));
                }
                if status == InstallationStatus::Uninstalled {
                    active.revoked_at = Set(Some(now));
                }
                active.updated_at = Set(now);
                Ok(active.update(&*self.db).await?)
            }
            None => {
                let active = installation::ActiveModel {
                    id: Set(new_id("inst")),
                    provider_id: Set(provider_id.to_string()),
                    scope_type: Set(scope.scope_type.as_str().to_string()),
                    scope_id: Set(scope.id.clone()),
                    install_type: Set(install_type.to_string()),
                    status: Set(status.as_str().to_string()),
                    granted_at: Set((status == InstallationStatus::Active).then_some(now)),
                    revoked_at: Set(None),
                    metadata: Set(metadata),
                    created_at: Set(now),
                    updated_at: Set(now),
                };
                Ok(active.insert(&*self.db).await?)
            }
        }
    }

    /// Apply a status transition, rejecting moves the lifecycle forbids.
    pub async fn update_status(
        &self,
        id: &str,
        status: InstallationStatus,
    ) -> ServiceResult<installation::Model> {
        let existing = self
            .get(id)
            .await?
            .ok_or_else(|| ServiceError::not_found(format!("installation {} not found", id)))?;
        let current: InstallationStatus = existing
            .status
            .parse()
            .map_err(|e| ServiceError::internal(format!("{}", e)))?;
        if current == status {
            return Ok(existing);
        }
        if !current.can_transition_to(status) {
            return Err(ServiceError::conflict(format!(
                "installation cannot move from {} to {}",
                current, status
            )));
        }

        let now = now();
        let mut active = existing.into_active_model();
        active.status = Set(status.as_str().to_string());
        if status == InstallationStatus::Uninstalled {
            active.revoked_at = Set(Some(now));
        }
        active.updated_at = Set(now);
        Ok(active.update(&*self.db).await?)
    }

    /// Page through installations ordered by creation time then id.
    pub async fn list(
        &self,
        filter: &RecordFilter,
        limit: u64,
        offset: u64,
    ) -> ServiceResult<(Vec<installation::Model>, u64)> {
        let query = apply_filter(Installation::find(), filter);
        let total = query.clone().count(&*self.db).await?;
        let rows = query
            .order_by_asc(Column::CreatedAt)
            .order_by_asc(Column::Id)
            .offset(offset)
            .limit(limit)
            .all(&*self.db)
            .await?;
        Ok((rows, total))
    }
}

fn apply_filter(mut query: Select<Installation>, filter: &RecordFilter) -> Select<Installation> {
    if let Some(provider_id) = &filter.provider_id {
        query = query.filter(Column::ProviderId.eq(provider_id.as_str()));
    }
    if let Some(scope_type) = &filter.scope_type {
        query = query.filter(Column::ScopeType.eq(scope_type.as_str()));
    }
    if let Some(scope_id) = &filter.scope_id {
        query = query.filter(Column::ScopeId.eq(scope_id.as_str()));
    }
    if let Some(status) = &filter.status {
        query = query.filter(Column::Status.eq(status.as_str()));
    }
    query
}
