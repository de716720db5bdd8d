//! Connection repository for database operations
//!
//! Connections are keyed structurally by `(provider_id, scope,
//! external_account_id)`; completing a callback for an account that already
//! has a row reactivates that row instead of inserting a duplicate.

use std::collections::BTreeMap;
use std::sync::Arc;

use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait,
    IntoActiveModel, PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, Select, Set,
};

use super::{RecordFilter, StatusCount, status_map};
use crate::error::{ServiceError, ServiceResult};
use crate::models::connection::{self, Column, Entity as Connection};
use crate::models::status::ConnectionStatus;
use crate::models::{new_id, now};
use crate::scope::ScopeRef;

/// Repository for connection database operations
#[derive(Debug, Clone)]
pub struct ConnectionRepository {
    /// Database connection pool
    pub db: Arc<DatabaseConnection>,
}

impl ConnectionRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    pub async fn get(&self, id: &str) -> ServiceResult<Option<connection::Model>> {
        Ok(Connection::find_by_id(id.to_string()).one(&*self.db).await?)
    }

    /// Like [`Self::get`] but missing rows are a `not_found` error.
    pub async fn require(&self, id: &str) -> ServiceResult<connection::Model> {
        self.get(id)
            .await?
            .ok_or_else(|| ServiceError::not_found(format!("connection {} not found", id)))
    }

    /// Find the connection for an external account, creating it when absent.
    /// Existing rows are reactivated and their last error cleared.
    pub async fn find_or_create<C: ConnectionTrait>(
        db: &C,
        provider_id: &str,
        scope: &ScopeRef,
        external_account_id: &str,
    ) -> ServiceResult<connection::Model> {
        let now = now();
        let existing = Connection::find()
            .filter(Column::ProviderId.eq(provider_id))
            .filter(Column::ScopeType.eq(scope.scope_type.as_str()))
            .filter(Column::ScopeId.eq(scope.id.as_str()))
            .filter(Column::ExternalAccountId.eq(external_account_id))
            .one(db)
            .await?;

        match existing {
            Some(row) => {
                let mut active = row.into_active_model();
                active.status = Set(ConnectionStatus::Active.as_str().to_string());
                active.last_error = Set(None);
                active.updated_at = Set(now);
                Ok(active.update(db).await?)
            }
            None => {
                let active = connection::ActiveModel {
                    id: Set(new_id("conn")),
                    provider_id: Set(provider_id.to_string()),
                    scope_type: Set(scope.scope_type.as_str().to_string()),
                    scope_id: Set(scope.id.clone()),
                    external_account_id: Set(external_account_id.to_string()),
                    status: Set(ConnectionStatus::Active.as_str().to_string()),
                    last_error: Set(None),
                    created_at: Set(now),
                    updated_at: Set(now),
                };
                Ok(active.insert(db).await?)
            }
        }
    }

    pub async fn update_status<C: ConnectionTrait>(
        db: &C,
        id: &str,
        status: ConnectionStatus,
        last_error: Option<String>,
    ) -> ServiceResult<()> {
        let result = Connection::update_many()
            .col_expr(Column::Status, Expr::value(status.as_str()))
            .col_expr(Column::LastError, Expr::value(last_error))
            .col_expr(Column::UpdatedAt, Expr::value(now()))
            .filter(Column::Id.eq(id))
            .exec(db)
            .await?;
        if result.rows_affected == 0 {
            return Err(ServiceError::not_found(format!(
                "connection {} not found",
                id
            )));
        }
        Ok(())
    }

    /// Page through connections ordered by creation time then id.
    pub async fn list(
        &self,
        filter: &RecordFilter,
        limit: u64,
        offset: u64,
    ) -> ServiceResult<(Vec<connection::Model>, u64)> {
        let query = apply_filter(Connection::find(), filter);
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

    pub async fn status_counts(&self) -> ServiceResult<BTreeMap<String, u64>> {
        let rows = Connection::find()
            .select_only()
            .column(Column::Status)
            .column_as(Expr::col(Column::Id).count(), "count")
            .group_by(Column::Status)
            .into_model::<StatusCount>()
            .all(&*self.db)
            .await?;
        Ok(status_map(rows))
    }
}

fn apply_filter(mut query: Select<Connection>, filter: &RecordFilter) -> Select<Connection> {
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
