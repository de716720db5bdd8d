//! # Providers
//!
//! Provider descriptors, the lifecycle trait every provider implements, the
//! registry and the built-in provider packs.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use utoipa::ToSchema;

use crate::config::AppConfig;
use crate::error::ServiceError;
use crate::scope::ScopeRef;

pub mod descriptor;
pub mod example;
pub mod oauth2;
pub mod registry;

pub use descriptor::{AuthKind, CapabilityDescriptor, DeniedBehavior, ProviderDescriptor};
pub use example::ExampleProvider;
pub use oauth2::OAuth2Provider;
pub use registry::{ProviderRegistry, RegistryError};

/// Errors surfaced by provider adapters.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("network error talking to provider: {0}")]
    Network(String),
    #[error("provider returned HTTP {status}")]
    Http { status: u16, body: Option<String> },
    #[error("provider rejected credentials: {0}")]
    Unauthorized(String),
    #[error("provider rate limited the request")]
    RateLimited {
        retry_after: Option<u64>,
        limit: Option<u32>,
        remaining: Option<u32>,
    },
    #[error("malformed provider response: {0}")]
    InvalidResponse(String),
    #[error("provider misconfigured: {0}")]
    Configuration(String),
    #[error("operation not supported by provider: {0}")]
    Unsupported(String),
}

impl From<ProviderError> for ServiceError {
    fn from(error: ProviderError) -> Self {
        match error {
            ProviderError::Unauthorized(message) => ServiceError::unauthorized(message),
            ProviderError::RateLimited { retry_after, .. } => {
                ServiceError::rate_limited("provider rate limit exceeded", retry_after)
            }
            ProviderError::Http { status, .. } if status == 401 => {
                ServiceError::unauthorized("provider rejected credentials")
            }
            ProviderError::Http { status, .. } if status == 429 => {
                ServiceError::rate_limited("provider rate limit exceeded", None)
            }
            ProviderError::Http { status, .. } if (400..500).contains(&status) => {
                ServiceError::validation(format!("provider rejected request with HTTP {}", status))
            }
            ProviderError::Configuration(message) | ProviderError::Unsupported(message) => {
                ServiceError::validation(message)
            }
            other @ (ProviderError::Network(_)
            | ProviderError::Http { .. }
            | ProviderError::InvalidResponse(_)) => {
                ServiceError::provider_unavailable(other.to_string())
            }
        }
    }
}

/// Input to [`ProviderLifecycle::begin_auth`].
#[derive(Debug, Clone)]
pub struct BeginAuthRequest {
    pub scope: ScopeRef,
    pub redirect_uri: String,
    pub state: String,
    pub requested_grants: Vec<String>,
    pub metadata: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct BeginAuthResponse {
    pub authorization_url: String,
    pub state: String,
    pub requested_grants: Vec<String>,
    #[serde(default)]
    pub metadata: Value,
}

#[derive(Debug, Clone)]
pub struct CompleteAuthRequest {
    pub scope: ScopeRef,
    pub code: String,
    pub state: String,
    pub redirect_uri: String,
    pub metadata: Value,
}

/// Secret material persisted (sealed) as a credential version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialPayload {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    pub token_type: String,
    pub requested_grants: Vec<String>,
    pub granted_grants: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl CredentialPayload {
    pub fn refreshable(&self) -> bool {
        self.refresh_token.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct CompleteAuthResponse {
    pub external_account_id: String,
    pub credential: CredentialPayload,
    pub metadata: Value,
}

/// One page of provider-side changes read during an incremental sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncBatch {
    pub next_cursor: Option<String>,
    pub fetched: u64,
}

/// Lifecycle contract implemented by every provider.
#[async_trait]
pub trait ProviderLifecycle: Send + Sync {
    fn descriptor(&self) -> &ProviderDescriptor;

    async fn begin_auth(&self, request: BeginAuthRequest)
    -> Result<BeginAuthResponse, ProviderError>;

    async fn complete_auth(
        &self,
        request: CompleteAuthRequest,
    ) -> Result<CompleteAuthResponse, ProviderError>;

    async fn refresh(&self, credential: &CredentialPayload)
    -> Result<CredentialPayload, ProviderError>;

    /// Read changes after `cursor`. Providers without a sync surface keep the cursor.
    async fn read_changes(
        &self,
        _credential: &CredentialPayload,
        _resource_type: &str,
        _resource_id: &str,
        cursor: Option<&str>,
    ) -> Result<SyncBatch, ProviderError> {
        Ok(SyncBatch {
            next_cursor: cursor.map(str::to_string),
            fetched: 0,
        })
    }
}

/// Register the provider packs enabled by configuration.
///
/// The `example` pack is always present in developer profiles. OAuth2 packs
/// need client credentials; enabled packs without them are skipped with a
/// warning.
pub fn register_builtin_packs(
    registry: &ProviderRegistry,
    config: &AppConfig,
) -> Result<(), RegistryError> {
    if config.is_dev_profile() || config.extensions.pack_enabled(example::PROVIDER_ID) {
        registry.register(Arc::new(ExampleProvider::new()))?;
    }

    for pack in oauth2::BUILTIN_PACKS {
        if !config.extensions.pack_enabled(pack) {
            continue;
        }
        match config.oauth_clients.get(*pack) {
            Some(client) => {
                let provider = OAuth2Provider::builtin(pack, client).map_err(|err| {
                    RegistryError::Invalid {
                        id: pack.to_string(),
                        reason: err.to_string(),
                    }
                })?;
                registry.register(Arc::new(provider))?;
            }
            None => tracing::warn!(
                provider = %pack,
                "Provider pack enabled without OAuth client credentials; skipping"
            ),
        }
    }

    tracing::info!(providers = ?registry.ids(), "Registered provider packs");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OAuthClientConfig;
    use crate::error::{ErrorCategory, map_error};

    #[test]
    fn provider_errors_map_to_categories() {
        let unavailable: ServiceError = ProviderError::Network("reset".into()).into();
        assert_eq!(&*map_error(&unavailable).code, "provider_unavailable");

        let upstream: ServiceError = ProviderError::Http {
            status: 502,
            body: None,
        }
        .into();
        assert_eq!(&*map_error(&upstream).code, "provider_unavailable");

        let limited: ServiceError = ProviderError::RateLimited {
            retry_after: Some(30),
            limit: None,
            remaining: None,
        }
        .into();
        assert_eq!(limited.category, ErrorCategory::RateLimit);
        assert_eq!(limited.retry_after, Some(30));

        let auth: ServiceError = ProviderError::Http {
            status: 401,
            body: None,
        }
        .into();
        assert_eq!(auth.category, ErrorCategory::Auth);
    }

    #[test]
    fn packs_follow_configuration() {
        let mut config = AppConfig {
            profile: "production".into(),
            ..AppConfig::default()
        };
        config.extensions.enabled_provider_packs = vec!["github".into(), "google".into()];
        config.oauth_clients.insert(
            "github".into(),
            OAuthClientConfig {
                client_id: "id".into(),
                client_secret: "secret".into(),
                authorize_url: None,
                token_url: None,
            },
        );

        let registry = ProviderRegistry::new();
        register_builtin_packs(&registry, &config).unwrap();
        assert_eq!(registry.ids(), vec!["github".to_string()]);

        let dev = ProviderRegistry::new();
        register_builtin_packs(&dev, &AppConfig::default()).unwrap();
        assert_eq!(dev.ids(), vec!["example".to_string()]);
    }
}
