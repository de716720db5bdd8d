//! Scope references and per-request scope resolution.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::auth::ActorContext;
use crate::error::{ServiceError, ServiceResult};

/// Kind of context a services action is performed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ScopeType {
    User,
    Org,
}

impl ScopeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScopeType::User => "user",
            ScopeType::Org => "org",
        }
    }
}

impl fmt::Display for ScopeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScopeType {
    type Err = ServiceError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "user" => Ok(ScopeType::User),
            "org" | "organization" => Ok(ScopeType::Org),
            other => Err(ServiceError::validation(format!(
                "scope_type must be 'user' or 'org', got '{}'",
                other
            ))),
        }
    }
}

/// `{type, id}` pair identifying where a services action applies.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema)]
pub struct ScopeRef {
    #[serde(rename = "type")]
    pub scope_type: ScopeType,
    pub id: String,
}

impl ScopeRef {
    pub fn new(scope_type: ScopeType, id: impl Into<String>) -> Self {
        Self {
            scope_type,
            id: id.into(),
        }
    }

    pub fn user(id: impl Into<String>) -> Self {
        Self::new(ScopeType::User, id)
    }

    pub fn org(id: impl Into<String>) -> Self {
        Self::new(ScopeType::Org, id)
    }

    /// Rebuild a scope from persisted columns.
    pub fn from_columns(scope_type: &str, scope_id: &str) -> ServiceResult<Self> {
        Ok(Self::new(scope_type.parse()?, scope_id))
    }
}

impl fmt::Display for ScopeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scope_type, self.id)
    }
}

/// Scope fields accepted from a request body or query string.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ScopeInput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

fn non_empty(value: Option<&String>) -> Option<&str> {
    value.map(|v| v.trim()).filter(|v| !v.is_empty())
}

/// Resolve the request scope.
///
/// Body fields win over query fields. Without an explicit id, org scopes fall
/// back to the actor's organization then `org_id`; user scopes fall back to the
/// actor id, the actor subject, then `user_id`.
pub fn resolve_scope(
    body: &ScopeInput,
    query: &ScopeInput,
    actor: &ActorContext,
) -> ServiceResult<ScopeRef> {
    let scope_type = match non_empty(body.scope_type.as_ref())
        .or_else(|| non_empty(query.scope_type.as_ref()))
    {
        Some(raw) => raw.parse()?,
        None => ScopeType::User,
    };

    let explicit =
        non_empty(body.scope_id.as_ref()).or_else(|| non_empty(query.scope_id.as_ref()));

    let fallback = || match scope_type {
        ScopeType::Org => non_empty(actor.organization_id.as_ref())
            .or_else(|| non_empty(body.org_id.as_ref()))
            .or_else(|| non_empty(query.org_id.as_ref())),
        ScopeType::User => non_empty(actor.actor_id.as_ref())
            .or_else(|| non_empty(actor.subject.as_ref()))
            .or_else(|| non_empty(body.user_id.as_ref()))
            .or_else(|| non_empty(query.user_id.as_ref())),
    };

    let id = explicit.or_else(fallback).ok_or_else(|| {
        ServiceError::validation(format!("unable to resolve {} scope id", scope_type))
    })?;

    Ok(ScopeRef::new(scope_type, id))
}
