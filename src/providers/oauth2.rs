//! Generic OAuth2 authorization-code provider
//!
//! Backs the `github` and `google` packs. Authorize URLs are built with `url`;
//! code exchange and refresh are form-encoded POSTs answered with JSON.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::{ACCEPT, RETRY_AFTER};
use serde::Deserialize;
use serde_json::{Value, json};
use url::Url;

use super::{
    AuthKind, BeginAuthRequest, BeginAuthResponse, CapabilityDescriptor, CompleteAuthRequest,
    CompleteAuthResponse, CredentialPayload, DeniedBehavior, ProviderDescriptor, ProviderError,
    ProviderLifecycle,
};
use crate::config::OAuthClientConfig;
use crate::scope::ScopeType;

pub const BUILTIN_PACKS: &[&str] = &["github", "google"];

const HTTP_TIMEOUT: Duration = Duration::from_secs(15);

/// Endpoints and descriptor for one OAuth2 provider.
#[derive(Debug, Clone)]
pub struct OAuth2Settings {
    pub authorize_url: String,
    pub token_url: String,
    /// Separator used by the provider in the `scope` parameter.
    pub scope_separator: &'static str,
    /// Extra query pairs appended to the authorize URL.
    pub extra_authorize_params: Vec<(String, String)>,
}

pub struct OAuth2Provider {
    descriptor: ProviderDescriptor,
    settings: OAuth2Settings,
    client_id: String,
    client_secret: String,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    refresh_token: Option<String>,
    token_type: Option<String>,
    expires_in: Option<i64>,
    scope: Option<String>,
    account_id: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

impl OAuth2Provider {
    pub fn new(
        descriptor: ProviderDescriptor,
        settings: OAuth2Settings,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Result<Self, ProviderError> {
        Url::parse(&settings.authorize_url)
            .map_err(|err| ProviderError::Configuration(format!("authorize_url: {}", err)))?;
        Url::parse(&settings.token_url)
            .map_err(|err| ProviderError::Configuration(format!("token_url: {}", err)))?;

        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|err| ProviderError::Configuration(err.to_string()))?;

        Ok(Self {
            descriptor,
            settings,
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            http,
        })
    }

    /// Build one of the [`BUILTIN_PACKS`], honouring endpoint overrides from config.
    pub fn builtin(pack: &str, client: &OAuthClientConfig) -> Result<Self, ProviderError> {
        let (descriptor, mut settings) = match pack {
            "github" => github_pack(),
            "google" => google_pack(),
            other => {
                return Err(ProviderError::Unsupported(format!(
                    "unknown provider pack '{}'",
                    other
                )));
            }
        };
        if let Some(url) = &client.authorize_url {
            settings.authorize_url = url.clone();
        }
        if let Some(url) = &client.token_url {
            settings.token_url = url.clone();
        }
        Self::new(
            descriptor,
            settings,
            client.client_id.clone(),
            client.client_secret.clone(),
        )
    }

    async fn token_request(&self, params: &[(&str, &str)]) -> Result<TokenResponse, ProviderError> {
        let response = self
            .http
            .post(&self.settings.token_url)
            .header(ACCEPT, "application/json")
            .form(params)
            .send()
            .await
            .map_err(|err| ProviderError::Network(err.to_string()))?;

        let status = response.status();
        if status.as_u16() == 429 {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok());
            return Err(ProviderError::RateLimited {
                retry_after,
                limit: None,
                remaining: None,
            });
        }
        if status.as_u16() == 401 {
            return Err(ProviderError::Unauthorized(
                "token endpoint rejected client credentials".to_string(),
            ));
        }
        if !status.is_success() {
            let body = response.text().await.ok();
            return Err(ProviderError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|err| ProviderError::InvalidResponse(err.to_string()))?;
        if let Some(error) = &token.error {
            let description = token.error_description.clone().unwrap_or_default();
            return Err(ProviderError::Unauthorized(format!("{}: {}", error, description)));
        }
        Ok(token)
    }

    fn split_scopes(&self, raw: &str) -> Vec<String> {
        raw.split([' ', ','])
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }

    fn credential_from(
        &self,
        token: TokenResponse,
        requested: Vec<String>,
        previous_refresh: Option<String>,
    ) -> Result<CredentialPayload, ProviderError> {
        let access_token = token
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ProviderError::InvalidResponse("missing access_token".to_string()))?;
        let granted = match &token.scope {
            Some(scope) => self.split_scopes(scope),
            None => requested.clone(),
        };

        Ok(CredentialPayload {
            access_token,
            refresh_token: token.refresh_token.or(previous_refresh),
            token_type: token.token_type.unwrap_or_else(|| "bearer".to_string()),
            requested_grants: requested,
            granted_grants: granted,
            expires_at: token
                .expires_in
                .map(|seconds| Utc::now() + chrono::Duration::seconds(seconds)),
        })
    }
}

#[async_trait]
impl ProviderLifecycle for OAuth2Provider {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    async fn begin_auth(
        &self,
        request: BeginAuthRequest,
    ) -> Result<BeginAuthResponse, ProviderError> {
        let mut url = Url::parse(&self.settings.authorize_url)
            .map_err(|err| ProviderError::Configuration(err.to_string()))?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs
                .append_pair("client_id", &self.client_id)
                .append_pair("redirect_uri", &request.redirect_uri)
                .append_pair("response_type", "code")
                .append_pair(
                    "scope",
                    &request
                        .requested_grants
                        .join(self.settings.scope_separator),
                )
                .append_pair("state", &request.state);
            for (key, value) in &self.settings.extra_authorize_params {
                pairs.append_pair(key, value);
            }
        }

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
        let token = self
            .token_request(&[
                ("grant_type", "authorization_code"),
                ("code", &request.code),
                ("redirect_uri", &request.redirect_uri),
                ("client_id", &self.client_id),
                ("client_secret", &self.client_secret),
            ])
            .await?;

        let external_account_id = token
            .account_id
            .clone()
            .or_else(|| {
                request
                    .metadata
                    .get("external_account_id")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .unwrap_or_else(|| request.scope.id.clone());
        let requested = request
            .metadata
            .get("requested_grants")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_else(|| self.descriptor.default_grants.clone());

        Ok(CompleteAuthResponse {
            external_account_id,
            credential: self.credential_from(token, requested, None)?,
            metadata: json!({}),
        })
    }

    async fn refresh(
        &self,
        credential: &CredentialPayload,
    ) -> Result<CredentialPayload, ProviderError> {
        let refresh_token = credential.refresh_token.clone().ok_or_else(|| {
            ProviderError::Unsupported("credential has no refresh token".to_string())
        })?;

        let token = self
            .token_request(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", &refresh_token),
                ("client_id", &self.client_id),
                ("client_secret", &self.client_secret),
            ])
            .await?;

        self.credential_from(
            token,
            credential.requested_grants.clone(),
            Some(refresh_token),
        )
    }
}

fn github_pack() -> (ProviderDescriptor, OAuth2Settings) {
    (
        ProviderDescriptor {
            id: "github".to_string(),
            name: "GitHub".to_string(),
            auth_kind: AuthKind::Oauth2,
            supported_scope_types: vec![ScopeType::User, ScopeType::Org],
            default_grants: vec!["repo".to_string(), "read:org".to_string()],
            capabilities: vec![
                CapabilityDescriptor::new("repo.read", &["repo"], DeniedBehavior::Block),
                CapabilityDescriptor::new(
                    "issues.write",
                    &["repo", "write:discussion"],
                    DeniedBehavior::Block,
                ),
                CapabilityDescriptor::new("org.members.read", &["read:org"], DeniedBehavior::Warn),
            ],
        },
        OAuth2Settings {
            authorize_url: "https://github.com/login/oauth/authorize".to_string(),
            token_url: "https://github.com/login/oauth/access_token".to_string(),
            scope_separator: " ",
            extra_authorize_params: Vec::new(),
        },
    )
}

fn google_pack() -> (ProviderDescriptor, OAuth2Settings) {
    const DRIVE: &str = "https://www.googleapis.com/auth/drive.readonly";
    const CALENDAR: &str = "https://www.googleapis.com/auth/calendar.readonly";
    (
        ProviderDescriptor {
            id: "google".to_string(),
            name: "Google Workspace".to_string(),
            auth_kind: AuthKind::Oauth2,
            supported_scope_types: vec![ScopeType::User],
            default_grants: vec![DRIVE.to_string()],
            capabilities: vec![
                CapabilityDescriptor::new("drive.read", &[DRIVE], DeniedBehavior::Block),
                CapabilityDescriptor::new("calendar.read", &[CALENDAR], DeniedBehavior::Warn),
            ],
        },
        OAuth2Settings {
            authorize_url: "https://accounts.google.com/o/oauth2/v2/auth".to_string(),
            token_url: "https://oauth2.googleapis.com/token".to_string(),
            scope_separator: " ",
            extra_authorize_params: vec![
                ("access_type".to_string(), "offline".to_string()),
                ("prompt".to_string(), "consent".to_string()),
            ],
        },
    )
}
