//! # Authentication and Authorization
//!
//! Operator bearer authentication, actor attribution from request headers and
//! the permission-checking [`Authorizer`] seam used by every services route.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::{FromRequestParts, Request, State},
    http::{HeaderMap, header::AUTHORIZATION, request::Parts},
    middleware::Next,
    response::Response,
};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use utoipa::ToSchema;

use crate::config::AppConfig;
use crate::error::{ApiError, ServiceError};

pub const ACTOR_ID_HEADER: &str = "x-actor-id";
pub const ACTOR_SUBJECT_HEADER: &str = "x-actor-subject";
pub const ORGANIZATION_ID_HEADER: &str = "x-organization-id";

/// Permission strings checked by the services routes.
pub mod permissions {
    pub const VIEW: &str = "admin.services.view";
    pub const ACTIVITY_VIEW: &str = "admin.services.activity.view";
    pub const EDIT: &str = "admin.services.edit";
    pub const CONNECT: &str = "admin.services.connect";
    pub const RECONSENT: &str = "admin.services.reconsent";
    pub const REVOKE: &str = "admin.services.revoke";
    pub const WEBHOOKS: &str = "admin.services.webhooks";
}

/// Authenticated caller attributes used for scope resolution and auditing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ActorContext {
    pub actor_id: Option<String>,
    pub subject: Option<String>,
    pub organization_id: Option<String>,
}

impl ActorContext {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let read = |name: &str| {
            headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string)
        };

        Self {
            actor_id: read(ACTOR_ID_HEADER),
            subject: read(ACTOR_SUBJECT_HEADER),
            organization_id: read(ORGANIZATION_ID_HEADER),
        }
    }

    /// Identifier used in idempotency keys and activity rows.
    pub fn key(&self) -> &str {
        self.actor_id
            .as_deref()
            .or(self.subject.as_deref())
            .unwrap_or("anonymous")
    }
}

impl<S> FromRequestParts<S> for ActorContext
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(parts
            .extensions
            .get::<ActorContext>()
            .cloned()
            .unwrap_or_else(|| ActorContext::from_headers(&parts.headers)))
    }
}

/// Decides whether an actor may perform `action` on `resource`.
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn can(&self, actor: &ActorContext, action: &str, resource: &str) -> bool;
}

/// Authorizer that permits everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAllAuthorizer;

#[async_trait]
impl Authorizer for AllowAllAuthorizer {
    async fn can(&self, _actor: &ActorContext, _action: &str, _resource: &str) -> bool {
        true
    }
}

/// Authorizer backed by fixed permission sets.
///
/// Denied permissions always lose. When an allow-list is present, only listed
/// permissions pass.
#[derive(Debug, Clone, Default)]
pub struct StaticAuthorizer {
    allow: Option<HashSet<String>>,
    deny: HashSet<String>,
}

impl StaticAuthorizer {
    pub fn deny<I, S>(permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allow: None,
            deny: permissions.into_iter().map(Into::into).collect(),
        }
    }

    pub fn allow_only<I, S>(permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allow: Some(permissions.into_iter().map(Into::into).collect()),
            deny: HashSet::new(),
        }
    }
}

#[async_trait]
impl Authorizer for StaticAuthorizer {
    async fn can(&self, _actor: &ActorContext, action: &str, _resource: &str) -> bool {
        if self.deny.contains(action) {
            return false;
        }
        self.allow
            .as_ref()
            .is_none_or(|allowed| allowed.contains(action))
    }
}

/// Authentication middleware.
///
/// When operator tokens are configured a matching bearer token is required.
/// The actor context is attached to the request either way.
pub async fn auth_middleware(
    State(config): State<Arc<AppConfig>>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if !config.operator_tokens.is_empty() {
        let token = extract_bearer_token(request.headers())?;
        validate_token(&config, token)?;
    }

    let actor = ActorContext::from_headers(request.headers());
    tracing::debug!(actor = %actor.key(), "Attributed services request");
    request.extensions_mut().insert(actor);

    Ok(next.run(request).await)
}

fn extract_bearer_token(headers: &HeaderMap) -> Result<&str, ApiError> {
    let value = headers
        .get(AUTHORIZATION)
        .ok_or_else(|| ApiError::from(ServiceError::unauthorized("Missing Authorization header")))?
        .to_str()
        .map_err(|_| ApiError::from(ServiceError::unauthorized("Invalid Authorization header")))?;

    value.strip_prefix("Bearer ").ok_or_else(|| {
        ServiceError::unauthorized("Authorization header must use Bearer scheme").into()
    })
}

fn validate_token(config: &AppConfig, token: &str) -> Result<(), ApiError> {
    let is_valid = config
        .operator_tokens
        .iter()
        .any(|configured| ConstantTimeEq::ct_eq(token.as_bytes(), configured.as_bytes()).into());

    if is_valid {
        Ok(())
    } else {
        Err(ServiceError::unauthorized("Invalid bearer token").into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn actor_context_reads_trimmed_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(ACTOR_ID_HEADER, HeaderValue::from_static(" user-1 "));
        headers.insert(ORGANIZATION_ID_HEADER, HeaderValue::from_static("org-9"));
        headers.insert(ACTOR_SUBJECT_HEADER, HeaderValue::from_static(""));

        let actor = ActorContext::from_headers(&headers);
        assert_eq!(actor.actor_id.as_deref(), Some("user-1"));
        assert_eq!(actor.subject, None);
        assert_eq!(actor.organization_id.as_deref(), Some("org-9"));
        assert_eq!(actor.key(), "user-1");
        assert_eq!(ActorContext::default().key(), "anonymous");
    }

    #[test]
    fn bearer_token_validation() {
        let config = AppConfig {
            operator_tokens: vec!["secret-token".to_string()],
            ..AppConfig::default()
        };

        let mut headers = HeaderMap::new();
        assert!(extract_bearer_token(&headers).is_err());

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert!(extract_bearer_token(&headers).is_err());

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer secret-token"));
        let token = extract_bearer_token(&headers).unwrap();
        assert!(validate_token(&config, token).is_ok());
        assert!(validate_token(&config, "other").is_err());
    }

    #[tokio::test]
    async fn static_authorizer_rules() {
        let actor = ActorContext::default();

        let deny = StaticAuthorizer::deny([permissions::VIEW]);
        assert!(!deny.can(&actor, permissions::VIEW, "/providers").await);
        assert!(deny.can(&actor, permissions::EDIT, "/providers").await);

        let allow = StaticAuthorizer::allow_only([permissions::VIEW]);
        assert!(allow.can(&actor, permissions::VIEW, "/providers").await);
        assert!(!allow.can(&actor, permissions::EDIT, "/providers").await);

        assert!(AllowAllAuthorizer.can(&actor, "anything", "/").await);
    }
}
