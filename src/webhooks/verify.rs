//! # Webhook Signature Verification
//!
//! Pluggable verifiers for webhook and inbound surfaces. All signature and
//! token comparisons are constant-time.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use axum::http::HeaderMap;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::debug;

use crate::config::WebhookConfig;

type HmacSha256 = Hmac<Sha256>;

pub const HUB_SIGNATURE_HEADER: &str = "x-hub-signature-256";
pub const SIGNATURE_HEADER: &str = "x-signature";
pub const SLACK_SIGNATURE_HEADER: &str = "x-slack-signature";
pub const SLACK_TIMESTAMP_HEADER: &str = "x-slack-request-timestamp";
pub const WEBHOOK_TOKEN_HEADER: &str = "x-webhook-token";

/// Providers whose secret is a shared bearer token rather than an HMAC key.
const SHARED_TOKEN_PROVIDERS: &[&str] = &["jira", "zoho-cliq"];

/// Errors that can occur during webhook signature verification
#[derive(Debug, thiserror::Error)]
pub enum VerificationError {
    #[error("Missing required signature header: {header}")]
    MissingSignature { header: String },

    #[error("Invalid signature format: {header}")]
    InvalidSignatureFormat { header: String },

    #[error("Signature verification failed")]
    VerificationFailed,

    #[error("Missing required timestamp header: {header}")]
    MissingTimestamp { header: String },

    #[error("Invalid timestamp format: {header}")]
    InvalidTimestamp { header: String },

    #[error("Timestamp outside tolerance: {seconds}s skew, max allowed: {max_seconds}s")]
    TimestampOutOfRange { seconds: u64, max_seconds: u64 },
}

pub type VerificationResult<T> = Result<T, VerificationError>;

/// Authenticates a raw inbound request before it is claimed.
#[async_trait]
pub trait WebhookVerifier: Send + Sync {
    async fn verify(&self, headers: &HeaderMap, body: &[u8]) -> VerificationResult<()>;
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn hmac_sha256(secret: &str, message: &[u8]) -> VerificationResult<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| VerificationError::VerificationFailed)?;
    mac.update(message);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn constant_time_matches(expected: &[u8], provided: &[u8]) -> VerificationResult<()> {
    if expected.ct_eq(provided).into() {
        Ok(())
    } else {
        Err(VerificationError::VerificationFailed)
    }
}

/// Hex HMAC-SHA256 of the body in `X-Hub-Signature-256` or `X-Signature`,
/// with or without a `sha256=` prefix.
pub struct HmacSignatureVerifier {
    secret: String,
}

impl HmacSignatureVerifier {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// `sha256=<hex>` signature of `body` under `secret`.
    pub fn sign(secret: &str, body: &[u8]) -> String {
        let digest = hmac_sha256(secret, body).unwrap_or_default();
        format!("sha256={}", hex::encode(digest))
    }
}

#[async_trait]
impl WebhookVerifier for HmacSignatureVerifier {
    async fn verify(&self, headers: &HeaderMap, body: &[u8]) -> VerificationResult<()> {
        let (name, provided) = header(headers, HUB_SIGNATURE_HEADER)
            .map(|value| (HUB_SIGNATURE_HEADER, value))
            .or_else(|| header(headers, SIGNATURE_HEADER).map(|value| (SIGNATURE_HEADER, value)))
            .ok_or_else(|| VerificationError::MissingSignature {
                header: format!("{} or {}", HUB_SIGNATURE_HEADER, SIGNATURE_HEADER),
            })?;
        debug!(body_size = body.len(), header = name, "Verifying HMAC signature");

        let hex_signature = provided.strip_prefix("sha256=").unwrap_or(provided);
        let provided = hex::decode(hex_signature).map_err(|_| {
            VerificationError::InvalidSignatureFormat {
                header: format!("{} contains invalid hex", name),
            }
        })?;
        constant_time_matches(&hmac_sha256(&self.secret, body)?, &provided)
    }
}

/// Slack `v0` signatures over `v0:{timestamp}:{body}` with replay tolerance.
pub struct SlackSignatureVerifier {
    secret: String,
    tolerance_seconds: u64,
}

impl SlackSignatureVerifier {
    pub fn new(secret: impl Into<String>, tolerance_seconds: u64) -> Self {
        Self {
            secret: secret.into(),
            tolerance_seconds,
        }
    }

    pub fn sign(secret: &str, timestamp: u64, body: &[u8]) -> String {
        let mut base = format!("v0:{}:", timestamp).into_bytes();
        base.extend_from_slice(body);
        let digest = hmac_sha256(secret, &base).unwrap_or_default();
        format!("v0={}", hex::encode(digest))
    }
}

#[async_trait]
impl WebhookVerifier for SlackSignatureVerifier {
    async fn verify(&self, headers: &HeaderMap, body: &[u8]) -> VerificationResult<()> {
        let signature = header(headers, SLACK_SIGNATURE_HEADER).ok_or_else(|| {
            VerificationError::MissingSignature {
                header: SLACK_SIGNATURE_HEADER.to_string(),
            }
        })?;
        let timestamp = header(headers, SLACK_TIMESTAMP_HEADER)
            .ok_or_else(|| VerificationError::MissingTimestamp {
                header: SLACK_TIMESTAMP_HEADER.to_string(),
            })?
            .parse::<u64>()
            .map_err(|_| VerificationError::InvalidTimestamp {
                header: format!("{} must be a Unix timestamp", SLACK_TIMESTAMP_HEADER),
            })?;

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let skew = now.abs_diff(timestamp);
        if skew > self.tolerance_seconds {
            return Err(VerificationError::TimestampOutOfRange {
                seconds: skew,
                max_seconds: self.tolerance_seconds,
            });
        }

        let hex_signature = signature.strip_prefix("v0=").ok_or_else(|| {
            VerificationError::InvalidSignatureFormat {
                header: format!("{} must start with 'v0='", SLACK_SIGNATURE_HEADER),
            }
        })?;
        let provided = hex::decode(hex_signature).map_err(|_| {
            VerificationError::InvalidSignatureFormat {
                header: format!("{} contains invalid hex", SLACK_SIGNATURE_HEADER),
            }
        })?;

        let mut base = format!("v0:{}:", timestamp).into_bytes();
        base.extend_from_slice(body);
        constant_time_matches(&hmac_sha256(&self.secret, &base)?, &provided)
    }
}

/// Shared secret in `X-Webhook-Token` or `Authorization: Bearer`.
pub struct SharedTokenVerifier {
    token: String,
}

impl SharedTokenVerifier {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl WebhookVerifier for SharedTokenVerifier {
    async fn verify(&self, headers: &HeaderMap, _body: &[u8]) -> VerificationResult<()> {
        let provided = header(headers, WEBHOOK_TOKEN_HEADER)
            .or_else(|| {
                header(headers, "authorization").and_then(|value| value.strip_prefix("Bearer "))
            })
            .ok_or_else(|| VerificationError::MissingSignature {
                header: format!("{} or Authorization (Bearer)", WEBHOOK_TOKEN_HEADER),
            })?;
        constant_time_matches(self.token.as_bytes(), provided.trim().as_bytes())
    }
}

/// Verifiers keyed by provider id.
#[derive(Default)]
pub struct VerifierRegistry {
    verifiers: RwLock<BTreeMap<String, Arc<dyn WebhookVerifier>>>,
}

impl VerifierRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// One verifier per configured signing secret: Slack style for `slack`,
    /// shared tokens for token-authenticated providers, HMAC otherwise.
    pub fn from_config(config: &WebhookConfig) -> Self {
        let registry = Self::new();
        for (provider, secret) in &config.signing_secrets {
            let verifier: Arc<dyn WebhookVerifier> = if provider == "slack" {
                Arc::new(SlackSignatureVerifier::new(
                    secret.clone(),
                    config.slack_tolerance_seconds,
                ))
            } else if SHARED_TOKEN_PROVIDERS.contains(&provider.as_str()) {
                Arc::new(SharedTokenVerifier::new(secret.clone()))
            } else {
                Arc::new(HmacSignatureVerifier::new(secret.clone()))
            };
            registry.register(provider, verifier);
        }
        registry
    }

    pub fn register(&self, provider_id: &str, verifier: Arc<dyn WebhookVerifier>) {
        self.verifiers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(provider_id.trim().to_string(), verifier);
    }

    pub fn get(&self, provider_id: &str) -> Option<Arc<dyn WebhookVerifier>> {
        self.verifiers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(provider_id)
            .cloned()
    }

    pub fn providers(&self) -> Vec<String> {
        self.verifiers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&'static str, String)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_str(value).unwrap());
        }
        map
    }

    #[tokio::test]
    async fn hmac_accepts_both_headers_and_prefixes() {
        let verifier = HmacSignatureVerifier::new("topsecret");
        let body = br#"{"action":"opened"}"#;
        let signed = HmacSignatureVerifier::sign("topsecret", body);

        let hub = headers(&[(HUB_SIGNATURE_HEADER, signed.clone())]);
        assert!(verifier.verify(&hub, body).await.is_ok());

        let bare = signed.trim_start_matches("sha256=").to_string();
        let generic = headers(&[(SIGNATURE_HEADER, bare)]);
        assert!(verifier.verify(&generic, body).await.is_ok());

        assert!(matches!(
            verifier.verify(&hub, b"tampered").await,
            Err(VerificationError::VerificationFailed)
        ));
        assert!(matches!(
            verifier.verify(&HeaderMap::new(), body).await,
            Err(VerificationError::MissingSignature { .. })
        ));
    }

    #[tokio::test]
    async fn slack_rejects_stale_timestamps() {
        let verifier = SlackSignatureVerifier::new("slack-secret", 300);
        let body = b"token=abc&command=/deploy";
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs();

        let fresh = headers(&[
            (SLACK_TIMESTAMP_HEADER, now.to_string()),
            (
                SLACK_SIGNATURE_HEADER,
                SlackSignatureVerifier::sign("slack-secret", now, body),
            ),
        ]);
        assert!(verifier.verify(&fresh, body).await.is_ok());

        let stale_ts = now - 600;
        let stale = headers(&[
            (SLACK_TIMESTAMP_HEADER, stale_ts.to_string()),
            (
                SLACK_SIGNATURE_HEADER,
                SlackSignatureVerifier::sign("slack-secret", stale_ts, body),
            ),
        ]);
        assert!(matches!(
            verifier.verify(&stale, body).await,
            Err(VerificationError::TimestampOutOfRange { .. })
        ));
    }

    #[tokio::test]
    async fn shared_token_accepts_header_or_bearer() {
        let verifier = SharedTokenVerifier::new("tok");
        let direct = headers(&[(WEBHOOK_TOKEN_HEADER, "tok".to_string())]);
        assert!(verifier.verify(&direct, b"").await.is_ok());

        let bearer = headers(&[("authorization", "Bearer tok".to_string())]);
        assert!(verifier.verify(&bearer, b"").await.is_ok());

        let wrong = headers(&[("authorization", "Bearer nope".to_string())]);
        assert!(verifier.verify(&wrong, b"").await.is_err());
    }

    #[test]
    fn registry_picks_verifier_by_provider() {
        let config = WebhookConfig {
            signing_secrets: BTreeMap::from([
                ("github".to_string(), "gh".to_string()),
                ("jira".to_string(), "jt".to_string()),
            ]),
            ..WebhookConfig::default()
        };
        let registry = VerifierRegistry::from_config(&config);
        assert_eq!(registry.providers(), vec!["github", "jira"]);
        assert!(registry.get("github").is_some());
        assert!(registry.get("slack").is_none());
    }
}
