//! Deterministic in-process provider used by local profiles and tests.

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::json;
use url::Url;

use super::{
    AuthKind, BeginAuthRequest, BeginAuthResponse, CapabilityDescriptor, CompleteAuthRequest,
    CompleteAuthResponse, CredentialPayload, DeniedBehavior, ProviderDescriptor, ProviderError,
    ProviderLifecycle, SyncBatch,
};
use crate::scope::ScopeType;

pub const PROVIDER_ID: &str = "example";
const AUTHORIZE_URL: &str = "https://auth.example.test/oauth/authorize";

/// Authorization code that makes [`ExampleProvider::complete_auth`] fail.
pub const DENIED_CODE: &str = "denied";

pub struct ExampleProvider {
    descriptor: ProviderDescriptor,
    refresh_failure: Mutex<Option<ProviderError>>,
}

impl ExampleProvider {
    pub fn new() -> Self {
        Self::with_id(PROVIDER_ID)
    }

    pub fn with_id(id: &str) -> Self {
        Self {
            descriptor: ProviderDescriptor {
                id: id.to_string(),
                name: "Example".to_string(),
                auth_kind: AuthKind::Oauth2,
                supported_scope_types: vec![ScopeType::User, ScopeType::Org],
                default_grants: vec!["records:read".to_string()],
                capabilities: vec![
                    CapabilityDescriptor::new(
                        "records.read",
                        &["records:read"],
                        DeniedBehavior::Block,
                    ),
                    CapabilityDescriptor::new(
                        "records.write",
                        &["records:write"],
                        DeniedBehavior::Warn,
                    )
                    .with_optional(&["records:admin"]),
                ],
            },
            refresh_failure: Mutex::new(None),
        }
    }

    /// Make subsequent refreshes fail with `error` until cleared with `None`.
    pub fn fail_refresh_with(&self, error: Option<ProviderError>) {
        *self
            .refresh_failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = error;
    }
}

impl Default for ExampleProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProviderLifecycle for ExampleProvider {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    async fn begin_auth(
        &self,
        request: BeginAuthRequest,
    ) -> Result<BeginAuthResponse, ProviderError> {
        let mut url = Url::parse(AUTHORIZE_URL)
            .map_err(|err| ProviderError::Configuration(err.to_string()))?;
        url.query_pairs_mut()
            .append_pair("client_id", "example-client")
            .append_pair("redirect_uri", &request.redirect_uri)
            .append_pair("scope", &request.requested_grants.join(" "))
            .append_pair("state", &request.state);

        Ok(BeginAuthResponse {
            authorization_url: url.to_string(),
            state: request.state,
            requested_grants: request.requested_grants,
            metadata: json!({ "provider": self.descriptor.id }),
        })
    }

    async fn complete_auth(
        &self,
        request: CompleteAuthRequest,
    ) -> Result<CompleteAuthResponse, ProviderError> {
        if request.code == DENIED_CODE {
            return Err(ProviderError::Unauthorized(
                "authorization code was rejected".to_string(),
            ));
        }

        let requested: Vec<String> = request
            .metadata
            .get("requested_grants")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_else(|| self.descriptor.default_grants.clone());
        let granted: Vec<String> = request
            .metadata
            .get("granted_grants")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_else(|| requested.clone());

        Ok(CompleteAuthResponse {
            external_account_id: format!("acct-{}", request.scope.id),
            credential: CredentialPayload {
                access_token: format!("example-access-{}", request.code),
                refresh_token: Some(format!("example-refresh-{}", request.code)),
                token_type: "bearer".to_string(),
                requested_grants: requested,
                granted_grants: granted,
                expires_at: Some(Utc::now() + Duration::hours(1)),
            },
            metadata: json!({}),
        })
    }

    async fn refresh(
        &self,
        credential: &CredentialPayload,
    ) -> Result<CredentialPayload, ProviderError> {
        let failure = self
            .refresh_failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(error) = failure {
            return Err(error);
        }
        if credential.refresh_token.is_none() {
            return Err(ProviderError::Unsupported(
                "credential has no refresh token".to_string(),
            ));
        }

        Ok(CredentialPayload {
            access_token: format!("{}-r", credential.access_token),
            expires_at: Some(Utc::now() + Duration::hours(1)),
            ..credential.clone()
        })
    }

    async fn read_changes(
        &self,
        _credential: &CredentialPayload,
        _resource_type: &str,
        _resource_id: &str,
        cursor: Option<&str>,
    ) -> Result<SyncBatch, ProviderError> {
        let position = cursor
            .and_then(|c| c.strip_prefix("cursor-"))
            .and_then(|n| n.parse::<u64>().ok())
            .unwrap_or(0);
        Ok(SyncBatch {
            next_cursor: Some(format!("cursor-{}", position + 1)),
            fetched: 1,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::ScopeRef;

    #[tokio::test]
    async fn begin_auth_builds_authorize_url() {
        let provider = ExampleProvider::new();
        let response = provider
            .begin_auth(BeginAuthRequest {
                scope: ScopeRef::user("u-1"),
                redirect_uri: "https://admin.test/cb".into(),
                state: "state-a".into(),
                requested_grants: vec!["records:read".into(), "records:write".into()],
                metadata: json!({}),
            })
            .await
            .unwrap();

        let url = Url::parse(&response.authorization_url).unwrap();
        let pairs: std::collections::HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(pairs["state"], "state-a");
        assert_eq!(pairs["scope"], "records:read records:write");
        assert_eq!(pairs["redirect_uri"], "https://admin.test/cb");
    }

    #[tokio::test]
    async fn refresh_failure_toggle() {
        let provider = ExampleProvider::new();
        let credential = provider
            .complete_auth(CompleteAuthRequest {
                scope: ScopeRef::user("u-1"),
                code: "abc".into(),
                state: "s".into(),
                redirect_uri: "https://admin.test/cb".into(),
                metadata: json!({}),
            })
            .await
            .unwrap()
            .credential;
        assert_eq!(credential.granted_grants, vec!["records:read"]);

        provider.fail_refresh_with(Some(ProviderError::Network("down".into())));
        assert!(provider.refresh(&credential).await.is_err());

        provider.fail_refresh_with(None);
        let refreshed = provider.refresh(&credential).await.unwrap();
        assert_eq!(refreshed.access_token, "example-access-abc-r");
    }

    #[tokio::test]
    async fn read_changes_advances_cursor() {
        let provider = ExampleProvider::new();
        let credential = CredentialPayload {
            access_token: "t".into(),
            refresh_token: None,
            token_type: "bearer".into(),
            requested_grants: vec![],
            granted_grants: vec![],
            expires_at: None,
        };
        let first = provider
            .read_changes(&credential, "records", "all", None)
            .await
            .unwrap();
        assert_eq!(first.next_cursor.as_deref(), Some("cursor-1"));
        let second = provider
            .read_changes(&credential, "records", "all", Some("cursor-1"))
            .await
            .unwrap();
        assert_eq!(second.next_cursor.as_deref(), Some("cursor-2"));
    }
}
