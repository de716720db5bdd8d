//! Configuration loading for the services plane.
//!
//! Loads layered `.env` files and environment variables prefixed with
//! `SERVICES_`, producing a typed [`AppConfig`].

use std::{collections::BTreeMap, env, net::SocketAddr, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

const ENV_PREFIX: &str = "SERVICES_";
const REDACTED: &str = "[REDACTED]";

/// Application configuration derived from `SERVICES_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct AppConfig {
    #[serde(default = "default_profile")]
    pub profile: String,
    #[serde(default = "default_api_bind_addr")]
    pub api_bind_addr: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,
    #[serde(default = "default_db_acquire_timeout_ms")]
    pub db_acquire_timeout_ms: u64,
    /// Base path of the admin API; the services surface mounts under `{base}/services`.
    #[serde(default = "default_admin_api_base")]
    pub admin_api_base: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub operator_tokens: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_key: Option<Vec<u8>>,
    #[serde(default = "default_encryption_key_id")]
    pub encryption_key_id: String,
    #[serde(default = "default_encryption_version")]
    pub encryption_version: u8,
    /// OAuth client credentials keyed by provider id.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub oauth_clients: BTreeMap<String, OAuthClientConfig>,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub callbacks: CallbacksConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub inbound: InboundConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    #[serde(default)]
    pub extensions: ExtensionsConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub sync: SyncConfig,
}

/// Settings for the mutating-request surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct ApiConfig {
    /// Reject mutating requests that omit `Idempotency-Key`.
    #[serde(default)]
    pub require_idempotency_key: bool,
    #[serde(default = "default_idempotency_ttl_seconds")]
    pub idempotency_ttl_seconds: u64,
    /// Event name to activity action label overrides.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub activity_action_label_overrides: BTreeMap<String, String>,
}

/// Callback URL resolution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct CallbacksConfig {
    #[serde(default)]
    pub strict: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_base_url: Option<String>,
    #[serde(default = "default_urlkit_group")]
    pub urlkit_group: String,
    #[serde(default = "default_callback_route")]
    pub default_route: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub provider_routes: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub provider_url_overrides: BTreeMap<String, String>,
}

/// Webhook claim ledger settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct WebhookConfig {
    #[serde(default = "default_claim_lease_ms")]
    pub claim_lease_ms: u64,
    #[serde(default = "default_webhook_max_attempts")]
    pub max_attempts: u32,
    /// HMAC signing secrets keyed by provider id.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub signing_secrets: BTreeMap<String, String>,
    #[serde(default = "default_slack_tolerance_seconds")]
    pub slack_tolerance_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct InboundConfig {
    #[serde(default = "default_inbound_key_ttl_seconds")]
    pub key_ttl_seconds: u64,
}

/// Lifecycle outbox and projector settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct LifecycleConfig {
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub activity: ActivityProjectorConfig,
    #[serde(default)]
    pub notifications: NotificationsProjectorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct DispatcherConfig {
    #[serde(default = "default_dispatcher_batch_size")]
    pub batch_size: u32,
    #[serde(default = "default_dispatcher_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_dispatcher_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Interval of the in-process dispatch loop (0 disables the loop).
    #[serde(default = "default_dispatcher_interval_seconds")]
    pub interval_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct ActivityProjectorConfig {
    /// Number of buffered fallback entries replayed into the primary sink per retention run.
    #[serde(default = "default_activity_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_activity_fallback_buffer_size")]
    pub fallback_buffer_size: usize,
    #[serde(default = "default_activity_retention_ttl_seconds")]
    pub retention_ttl_seconds: u64,
    #[serde(default = "default_activity_retention_row_cap")]
    pub retention_row_cap: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct NotificationsProjectorConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Event name to notification definition code.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub definition_map: BTreeMap<String, String>,
    /// HTTPS endpoint receiving rendered notifications; logged only when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    #[serde(default = "default_notification_timeout_seconds")]
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct ExtensionsConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub enabled_provider_packs: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub feature_flags: BTreeMap<String, bool>,
    #[serde(default = "default_true")]
    pub diagnostics_enabled: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct WorkerConfig {
    /// Hand refresh/renew/sync/retention/webhook requests to the job queue instead of running inline.
    #[serde(default)]
    pub enqueue_enabled: bool,
}

/// Incremental sync job settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct SyncConfig {
    /// Failed runs retry until this many attempts; the job then stays `failed`.
    #[serde(default = "default_sync_max_attempts")]
    pub max_attempts: u32,
}

/// OAuth client registration for a provider pack.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct OAuthClientConfig {
    pub client_id: String,
    pub client_secret: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorize_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_url: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            profile: default_profile(),
            api_bind_addr: default_api_bind_addr(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            database_url: default_database_url(),
            db_max_connections: default_db_max_connections(),
            db_acquire_timeout_ms: default_db_acquire_timeout_ms(),
            admin_api_base: default_admin_api_base(),
            operator_tokens: Vec::new(),
            encryption_key: None,
            encryption_key_id: default_encryption_key_id(),
            encryption_version: default_encryption_version(),
            oauth_clients: BTreeMap::new(),
            api: ApiConfig::default(),
            callbacks: CallbacksConfig::default(),
            webhook: WebhookConfig::default(),
            inbound: InboundConfig::default(),
            lifecycle: LifecycleConfig::default(),
            extensions: ExtensionsConfig::default(),
            worker: WorkerConfig::default(),
            sync: SyncConfig::default(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            require_idempotency_key: false,
            idempotency_ttl_seconds: default_idempotency_ttl_seconds(),
            activity_action_label_overrides: BTreeMap::new(),
        }
    }
}

impl Default for CallbacksConfig {
    fn default() -> Self {
        Self {
            strict: false,
            public_base_url: None,
            urlkit_group: default_urlkit_group(),
            default_route: default_callback_route(),
            provider_routes: BTreeMap::new(),
            provider_url_overrides: BTreeMap::new(),
        }
    }
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            claim_lease_ms: default_claim_lease_ms(),
            max_attempts: default_webhook_max_attempts(),
            signing_secrets: BTreeMap::new(),
            slack_tolerance_seconds: default_slack_tolerance_seconds(),
        }
    }
}

impl Default for InboundConfig {
    fn default() -> Self {
        Self {
            key_ttl_seconds: default_inbound_key_ttl_seconds(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_sync_max_attempts(),
        }
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: default_dispatcher_batch_size(),
            max_attempts: default_dispatcher_max_attempts(),
            initial_backoff_ms: default_dispatcher_initial_backoff_ms(),
            interval_seconds: default_dispatcher_interval_seconds(),
        }
    }
}

impl Default for ActivityProjectorConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_activity_buffer_size(),
            fallback_buffer_size: default_activity_fallback_buffer_size(),
            retention_ttl_seconds: default_activity_retention_ttl_seconds(),
            retention_row_cap: default_activity_retention_row_cap(),
        }
    }
}

impl Default for NotificationsProjectorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            definition_map: BTreeMap::new(),
            webhook_url: None,
            timeout_seconds: default_notification_timeout_seconds(),
        }
    }
}

impl Default for ExtensionsConfig {
    fn default() -> Self {
        Self {
            enabled_provider_packs: Vec::new(),
            feature_flags: BTreeMap::new(),
            diagnostics_enabled: true,
        }
    }
}

impl ApiConfig {
    pub fn idempotency_ttl(&self) -> Duration {
        Duration::from_secs(self.idempotency_ttl_seconds)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.idempotency_ttl_seconds == 0 {
            return Err(ConfigError::NonPositive {
                field: "api.idempotency_ttl",
            });
        }
        Ok(())
    }
}

impl CallbacksConfig {
    /// Validate that overrides and the public base are absolute http(s) URLs.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(base) = &self.public_base_url {
            ensure_http_url("callbacks.public_base_url", base)?;
        }
        for (provider, url) in &self.provider_url_overrides {
            ensure_http_url(&format!("callbacks.provider_url_overrides.{provider}"), url)?;
        }
        if self.default_route.trim().is_empty() {
            return Err(ConfigError::Empty {
                field: "callbacks.default_route",
            });
        }
        Ok(())
    }
}

impl WebhookConfig {
    pub fn claim_lease(&self) -> Duration {
        Duration::from_millis(self.claim_lease_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.claim_lease_ms == 0 {
            return Err(ConfigError::NonPositive {
                field: "webhook.claim_lease",
            });
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::NonPositive {
                field: "webhook.max_attempts",
            });
        }
        if self.slack_tolerance_seconds == 0 {
            return Err(ConfigError::NonPositive {
                field: "webhook.slack_tolerance_seconds",
            });
        }
        Ok(())
    }
}

impl InboundConfig {
    pub fn key_ttl(&self) -> Duration {
        Duration::from_secs(self.key_ttl_seconds)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.key_ttl_seconds == 0 {
            return Err(ConfigError::NonPositive {
                field: "inbound.key_ttl",
            });
        }
        Ok(())
    }
}

impl SyncConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::NonPositive {
                field: "sync.max_attempts",
            });
        }
        Ok(())
    }
}

impl LifecycleConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let dispatcher = &self.dispatcher;
        if dispatcher.batch_size == 0 {
            return Err(ConfigError::NonPositive {
                field: "lifecycle.dispatcher.batch_size",
            });
        }
        if dispatcher.max_attempts == 0 {
            return Err(ConfigError::NonPositive {
                field: "lifecycle.dispatcher.max_attempts",
            });
        }
        if dispatcher.initial_backoff_ms == 0 {
            return Err(ConfigError::NonPositive {
                field: "lifecycle.dispatcher.initial_backoff",
            });
        }

        let activity = &self.activity;
        if activity.buffer_size == 0 {
            return Err(ConfigError::NonPositive {
                field: "lifecycle.projectors.activity.buffer_size",
            });
        }
        if activity.fallback_buffer_size == 0 {
            return Err(ConfigError::NonPositive {
                field: "lifecycle.projectors.activity.fallback_buffer_size",
            });
        }
        if activity.retention_ttl_seconds == 0 {
            return Err(ConfigError::NonPositive {
                field: "lifecycle.projectors.activity.retention_ttl",
            });
        }
        if activity.retention_row_cap == 0 {
            return Err(ConfigError::NonPositive {
                field: "lifecycle.projectors.activity.retention_row_cap",
            });
        }

        if let Some(url) = &self.notifications.webhook_url {
            ensure_http_url("lifecycle.projectors.notifications.webhook_url", url)?;
        }
        Ok(())
    }
}

impl DispatcherConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }
}

impl ActivityProjectorConfig {
    pub fn retention_ttl(&self) -> Duration {
        Duration::from_secs(self.retention_ttl_seconds)
    }
}

impl ExtensionsConfig {
    /// Whether a provider pack is enabled (case-insensitive).
    pub fn pack_enabled(&self, pack: &str) -> bool {
        self.enabled_provider_packs
            .iter()
            .any(|candidate| candidate.eq_ignore_ascii_case(pack))
    }

    pub fn flag(&self, name: &str) -> bool {
        self.feature_flags.get(name).copied().unwrap_or(false)
    }
}

impl AppConfig {
    /// Returns the configured bind address as a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        self.api_bind_addr.parse()
    }

    /// Whether the profile is a developer profile (`local` or `test`).
    pub fn is_dev_profile(&self) -> bool {
        matches!(self.profile.as_str(), "local" | "test")
    }

    /// Path prefix of the services admin surface.
    pub fn services_base_path(&self) -> String {
        format!("{}/services", self.admin_api_base.trim_end_matches('/'))
    }

    /// Returns a redacted JSON representation (secrets are redacted).
    pub fn redacted_json(&self) -> serde_json::Result<String> {
        let mut config = self.clone();
        if !config.operator_tokens.is_empty() {
            config.operator_tokens = vec![REDACTED.to_string()];
        }
        if config.encryption_key.is_some() {
            config.encryption_key = Some(REDACTED.as_bytes().to_vec());
        }
        for client in config.oauth_clients.values_mut() {
            client.client_secret = REDACTED.to_string();
        }
        for secret in config.webhook.signing_secrets.values_mut() {
            *secret = REDACTED.to_string();
        }
        serde_json::to_string_pretty(&config)
    }

    /// Validates the configuration, returning an error if required settings are missing.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match &self.encryption_key {
            Some(key) if key.len() != 32 => {
                return Err(ConfigError::InvalidEncryptionKeyLength { length: key.len() });
            }
            None if !self.is_dev_profile() => return Err(ConfigError::MissingEncryptionKey),
            _ => {}
        }

        if !self.is_dev_profile() && self.operator_tokens.is_empty() {
            return Err(ConfigError::MissingOperatorTokens);
        }

        if self.encryption_key_id.trim().is_empty() {
            return Err(ConfigError::Empty {
                field: "encryption_key_id",
            });
        }
        if self.encryption_version == 0 {
            return Err(ConfigError::NonPositive {
                field: "encryption_version",
            });
        }

        if !self.admin_api_base.starts_with('/') {
            return Err(ConfigError::InvalidAdminApiBase {
                value: self.admin_api_base.clone(),
            });
        }

        for (provider, client) in &self.oauth_clients {
            if client.client_id.trim().is_empty() || client.client_secret.trim().is_empty() {
                return Err(ConfigError::IncompleteOAuthClient {
                    provider: provider.clone(),
                });
            }
        }

        self.api.validate()?;
        self.callbacks.validate()?;
        self.webhook.validate()?;
        self.inbound.validate()?;
        self.lifecycle.validate()?;
        self.sync.validate()?;

        Ok(())
    }
}

fn ensure_http_url(field: &str, value: &str) -> Result<(), ConfigError> {
    match Url::parse(value) {
        Ok(url) if matches!(url.scheme(), "http" | "https") && url.has_host() => Ok(()),
        _ => Err(ConfigError::InvalidUrl {
            field: field.to_string(),
            value: value.to_string(),
        }),
    }
}

fn default_profile() -> String {
    "local".to_string()
}

fn default_api_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_database_url() -> String {
    "sqlite://services.db?mode=rwc".to_string()
}

fn default_db_max_connections() -> u32 {
    10
}

fn default_db_acquire_timeout_ms() -> u64 {
    5000
}

fn default_admin_api_base() -> String {
    "/admin/api".to_string()
}

fn default_encryption_key_id() -> String {
    "local".to_string()
}

fn default_encryption_version() -> u8 {
    1
}

fn default_idempotency_ttl_seconds() -> u64 {
    86_400 // 24 hours
}

fn default_urlkit_group() -> String {
    "admin.api".to_string()
}

fn default_callback_route() -> String {
    "services.callback".to_string()
}

fn default_claim_lease_ms() -> u64 {
    30_000
}

fn default_webhook_max_attempts() -> u32 {
    8
}

fn default_slack_tolerance_seconds() -> u64 {
    300 // 5 minutes
}

fn default_sync_max_attempts() -> u32 {
    5
}

fn default_inbound_key_ttl_seconds() -> u64 {
    86_400
}

fn default_dispatcher_batch_size() -> u32 {
    50
}

fn default_dispatcher_max_attempts() -> u32 {
    10
}

fn default_dispatcher_initial_backoff_ms() -> u64 {
    1_000
}

fn default_dispatcher_interval_seconds() -> u64 {
    5
}

fn default_activity_buffer_size() -> usize {
    256
}

fn default_activity_fallback_buffer_size() -> usize {
    1_000
}

fn default_activity_retention_ttl_seconds() -> u64 {
    2_592_000 // 30 days
}

fn default_activity_retention_row_cap() -> u64 {
    100_000
}

fn default_notification_timeout_seconds() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load environment file {path}: {source}")]
    EnvFile {
        path: PathBuf,
        source: dotenvy::Error,
    },
    #[error("invalid api bind address '{value}': {source}")]
    InvalidBindAddr {
        value: String,
        source: std::net::AddrParseError,
    },
    #[error("no operator tokens configured; set SERVICES_OPERATOR_TOKEN or SERVICES_OPERATOR_TOKENS")]
    MissingOperatorTokens,
    #[error("encryption key is missing; set SERVICES_ENCRYPTION_KEY environment variable")]
    MissingEncryptionKey,
    #[error("encryption key is invalid base64: {error}")]
    InvalidEncryptionKeyBase64 { error: String },
    #[error("encryption key must decode to exactly 32 bytes, got {length} bytes")]
    InvalidEncryptionKeyLength { length: usize },
    #[error("admin api base must start with '/', got '{value}'")]
    InvalidAdminApiBase { value: String },
    #[error("oauth client for provider {provider} requires both client id and client secret")]
    IncompleteOAuthClient { provider: String },
    #[error("{field} must be an absolute http(s) URL, got '{value}'")]
    InvalidUrl { field: String, value: String },
    #[error("{field} must be greater than zero")]
    NonPositive { field: &'static str },
    #[error("{field} must not be empty")]
    Empty { field: &'static str },
    #[error("invalid value for {key}: '{value}'")]
    InvalidValue { key: String, value: String },
}

/// Loads configuration using layered `.env` files and `SERVICES_*` env vars.
pub struct ConfigLoader {
    base_dir: PathBuf,
}

impl ConfigLoader {
    /// Creates a new loader rooted at the current working directory.
    pub fn new() -> Self {
        Self {
            base_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    /// Creates a loader rooted at the provided directory (useful for tests).
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Loads and validates configuration.
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let (mut layered, profile_hint) = self.collect_layered_env()?;

        // Overlay process environment last so it wins.
        for (key, value) in env::vars() {
            if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                layered.insert(stripped.to_string(), value);
            }
        }

        let mut values = Layered(layered);
        let profile = values.string("PROFILE").unwrap_or(profile_hint);

        let operator_tokens = match values.string("OPERATOR_TOKENS") {
            Some(tokens) => parse_list(&tokens),
            None => values.string("OPERATOR_TOKEN").into_iter().collect(),
        };

        let encryption_key = match values.string("ENCRYPTION_KEY") {
            Some(encoded) => {
                use base64::{Engine as _, engine::general_purpose};
                Some(general_purpose::STANDARD.decode(encoded.trim()).map_err(|e| {
                    ConfigError::InvalidEncryptionKeyBase64 {
                        error: e.to_string(),
                    }
                })?)
            }
            None => None,
        };

        let api = ApiConfig {
            require_idempotency_key: values
                .parsed_bool("API_REQUIRE_IDEMPOTENCY_KEY")?
                .unwrap_or(false),
            idempotency_ttl_seconds: values
                .parsed("API_IDEMPOTENCY_TTL_SECONDS")?
                .unwrap_or_else(default_idempotency_ttl_seconds),
            activity_action_label_overrides: values
                .map("API_ACTIVITY_ACTION_LABEL_OVERRIDES")
                .unwrap_or_default(),
        };

        let callbacks = CallbacksConfig {
            strict: values.parsed_bool("CALLBACKS_STRICT")?.unwrap_or(false),
            public_base_url: values.string("CALLBACKS_PUBLIC_BASE_URL"),
            urlkit_group: values
                .string("CALLBACKS_URLKIT_GROUP")
                .unwrap_or_else(default_urlkit_group),
            default_route: values
                .string("CALLBACKS_DEFAULT_ROUTE")
                .unwrap_or_else(default_callback_route),
            provider_routes: values.map("CALLBACKS_PROVIDER_ROUTES").unwrap_or_default(),
            provider_url_overrides: values
                .map("CALLBACKS_PROVIDER_URL_OVERRIDES")
                .unwrap_or_default(),
        };

        let webhook = WebhookConfig {
            claim_lease_ms: values
                .parsed("WEBHOOK_CLAIM_LEASE_MS")?
                .unwrap_or_else(default_claim_lease_ms),
            max_attempts: values
                .parsed("WEBHOOK_MAX_ATTEMPTS")?
                .unwrap_or_else(default_webhook_max_attempts),
            signing_secrets: values.map("WEBHOOK_SIGNING_SECRETS").unwrap_or_default(),
            slack_tolerance_seconds: values
                .parsed("WEBHOOK_SLACK_TOLERANCE_SECONDS")?
                .unwrap_or_else(default_slack_tolerance_seconds),
        };

        let inbound = InboundConfig {
            key_ttl_seconds: values
                .parsed("INBOUND_KEY_TTL_SECONDS")?
                .unwrap_or_else(default_inbound_key_ttl_seconds),
        };

        let lifecycle = LifecycleConfig {
            dispatcher: DispatcherConfig {
                batch_size: values
                    .parsed("LIFECYCLE_DISPATCHER_BATCH_SIZE")?
                    .unwrap_or_else(default_dispatcher_batch_size),
                max_attempts: values
                    .parsed("LIFECYCLE_DISPATCHER_MAX_ATTEMPTS")?
                    .unwrap_or_else(default_dispatcher_max_attempts),
                initial_backoff_ms: values
                    .parsed("LIFECYCLE_DISPATCHER_INITIAL_BACKOFF_MS")?
                    .unwrap_or_else(default_dispatcher_initial_backoff_ms),
                interval_seconds: values
                    .parsed("LIFECYCLE_DISPATCHER_INTERVAL_SECONDS")?
                    .unwrap_or_else(default_dispatcher_interval_seconds),
            },
            activity: ActivityProjectorConfig {
                buffer_size: values
                    .parsed("LIFECYCLE_ACTIVITY_BUFFER_SIZE")?
                    .unwrap_or_else(default_activity_buffer_size),
                fallback_buffer_size: values
                    .parsed("LIFECYCLE_ACTIVITY_FALLBACK_BUFFER_SIZE")?
                    .unwrap_or_else(default_activity_fallback_buffer_size),
                retention_ttl_seconds: values
                    .parsed("LIFECYCLE_ACTIVITY_RETENTION_TTL_SECONDS")?
                    .unwrap_or_else(default_activity_retention_ttl_seconds),
                retention_row_cap: values
                    .parsed("LIFECYCLE_ACTIVITY_RETENTION_ROW_CAP")?
                    .unwrap_or_else(default_activity_retention_row_cap),
            },
            notifications: NotificationsProjectorConfig {
                enabled: values
                    .parsed_bool("LIFECYCLE_NOTIFICATIONS_ENABLED")?
                    .unwrap_or(true),
                definition_map: values
                    .map("LIFECYCLE_NOTIFICATIONS_DEFINITION_MAP")
                    .unwrap_or_default(),
                webhook_url: values.string("LIFECYCLE_NOTIFICATIONS_WEBHOOK_URL"),
                timeout_seconds: values
                    .parsed("LIFECYCLE_NOTIFICATIONS_TIMEOUT_SECONDS")?
                    .unwrap_or_else(default_notification_timeout_seconds),
            },
        };

        let mut feature_flags = BTreeMap::new();
        for (name, raw) in values.map("EXTENSIONS_FEATURE_FLAGS").unwrap_or_default() {
            let enabled = parse_bool(&raw).ok_or_else(|| ConfigError::InvalidValue {
                key: format!("EXTENSIONS_FEATURE_FLAGS.{name}"),
                value: raw.clone(),
            })?;
            feature_flags.insert(name, enabled);
        }
        let extensions = ExtensionsConfig {
            enabled_provider_packs: values
                .string("EXTENSIONS_ENABLED_PROVIDER_PACKS")
                .map(|packs| parse_list(&packs))
                .unwrap_or_default(),
            feature_flags,
            diagnostics_enabled: values
                .parsed_bool("EXTENSIONS_DIAGNOSTICS_ENABLED")?
                .unwrap_or(true),
        };

        let worker = WorkerConfig {
            enqueue_enabled: values
                .parsed_bool("WORKER_ENQUEUE_ENABLED")?
                .unwrap_or(false),
        };

        let sync = SyncConfig {
            max_attempts: values
                .parsed("SYNC_MAX_ATTEMPTS")?
                .unwrap_or_else(default_sync_max_attempts),
        };

        let config = AppConfig {
            profile,
            api_bind_addr: values
                .string("API_BIND_ADDR")
                .unwrap_or_else(default_api_bind_addr),
            log_level: values.string("LOG_LEVEL").unwrap_or_else(default_log_level),
            log_format: values.string("LOG_FORMAT").unwrap_or_else(default_log_format),
            database_url: values
                .string("DATABASE_URL")
                .unwrap_or_else(default_database_url),
            db_max_connections: values
                .parsed("DB_MAX_CONNECTIONS")?
                .unwrap_or_else(default_db_max_connections),
            db_acquire_timeout_ms: values
                .parsed("DB_ACQUIRE_TIMEOUT_MS")?
                .unwrap_or_else(default_db_acquire_timeout_ms),
            admin_api_base: values
                .string("ADMIN_API_BASE")
                .unwrap_or_else(default_admin_api_base),
            operator_tokens,
            encryption_key,
            encryption_key_id: values
                .string("ENCRYPTION_KEY_ID")
                .unwrap_or_else(default_encryption_key_id),
            encryption_version: values
                .parsed("ENCRYPTION_VERSION")?
                .unwrap_or_else(default_encryption_version),
            oauth_clients: collect_oauth_clients(&mut values),
            api,
            callbacks,
            webhook,
            inbound,
            lifecycle,
            extensions,
            worker,
            sync,
        };

        config.validate()?;

        match config.bind_addr() {
            Ok(_) => Ok(config),
            Err(source) => Err(ConfigError::InvalidBindAddr {
                value: config.api_bind_addr.clone(),
                source,
            }),
        }
    }

    fn collect_layered_env(&self) -> Result<(BTreeMap<String, String>, String), ConfigError> {
        let mut values = BTreeMap::new();

        self.merge_dotenv(self.base_dir.join(".env"), &mut values)?;
        self.merge_dotenv(self.base_dir.join(".env.local"), &mut values)?;

        let profile = env::var(format!("{ENV_PREFIX}PROFILE"))
            .ok()
            .or_else(|| values.get("PROFILE").cloned())
            .unwrap_or_else(default_profile);

        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}", &profile)),
            &mut values,
        )?;
        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}.local", &profile)),
            &mut values,
        )?;

        Ok((values, profile))
    }

    fn merge_dotenv(
        &self,
        path: PathBuf,
        values: &mut BTreeMap<String, String>,
    ) -> Result<(), ConfigError> {
        match dotenvy::from_path_iter(&path) {
            Ok(iter) => {
                for item in iter {
                    let (key, value) = item.map_err(|source| ConfigError::EnvFile {
                        path: path.clone(),
                        source,
                    })?;
                    if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                        values.insert(stripped.to_string(), value);
                    }
                }
                Ok(())
            }
            Err(dotenvy::Error::Io(ref io_err))
                if io_err.kind() == std::io::ErrorKind::NotFound =>
            {
                Ok(())
            }
            Err(err) => Err(ConfigError::EnvFile { path, source: err }),
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Prefix-stripped key/value pairs consumed while building [`AppConfig`].
struct Layered(BTreeMap<String, String>);

impl Layered {
    fn string(&mut self, key: &str) -> Option<String> {
        self.0
            .remove(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn parsed<T: std::str::FromStr>(&mut self, key: &str) -> Result<Option<T>, ConfigError> {
        match self.string(key) {
            Some(raw) => raw
                .parse()
                .map(Some)
                .map_err(|_| ConfigError::InvalidValue {
                    key: key.to_string(),
                    value: raw,
                }),
            None => Ok(None),
        }
    }

    fn parsed_bool(&mut self, key: &str) -> Result<Option<bool>, ConfigError> {
        match self.string(key) {
            Some(raw) => parse_bool(&raw)
                .map(Some)
                .ok_or_else(|| ConfigError::InvalidValue {
                    key: key.to_string(),
                    value: raw,
                }),
            None => Ok(None),
        }
    }

    fn map(&mut self, key: &str) -> Option<BTreeMap<String, String>> {
        self.string(key).map(|raw| parse_map(&raw))
    }
}

/// Collect `OAUTH_<PROVIDER>_<SETTING>` variables into per-provider client configs.
fn collect_oauth_clients(values: &mut Layered) -> BTreeMap<String, OAuthClientConfig> {
    const SETTINGS: [&str; 4] = ["CLIENT_ID", "CLIENT_SECRET", "AUTHORIZE_URL", "TOKEN_URL"];

    let mut clients: BTreeMap<String, OAuthClientConfig> = BTreeMap::new();
    let keys: Vec<String> = values
        .0
        .keys()
        .filter(|key| key.starts_with("OAUTH_"))
        .cloned()
        .collect();

    for key in keys {
        let Some(rest) = key.strip_prefix("OAUTH_") else {
            continue;
        };
        let Some(setting) = SETTINGS.iter().find(|s| rest.ends_with(&format!("_{s}"))) else {
            continue;
        };
        let provider = rest[..rest.len() - setting.len() - 1].to_lowercase();
        if provider.is_empty() {
            continue;
        }
        let Some(value) = values.string(&key) else {
            continue;
        };
        let entry = clients.entry(provider).or_default();
        match *setting {
            "CLIENT_ID" => entry.client_id = value,
            "CLIENT_SECRET" => entry.client_secret = value,
            "AUTHORIZE_URL" => entry.authorize_url = Some(value),
            _ => entry.token_url = Some(value),
        }
    }

    clients
}

/// Parse a comma-separated list, dropping blanks.
pub fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Parse `key=value,key=value` pairs; entries without `=` are ignored.
pub fn parse_map(raw: &str) -> BTreeMap<String, String> {
    raw.split(',')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            let key = key.trim();
            if key.is_empty() {
                return None;
            }
            Some((key.to_string(), value.trim().to_string()))
        })
        .collect()
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid_for_local_profile() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.services_base_path(), "/admin/api/services");
        assert_eq!(config.webhook.claim_lease(), Duration::from_secs(30));
        assert_eq!(config.webhook.max_attempts, 8);
        assert_eq!(config.lifecycle.dispatcher.batch_size, 50);
        assert_eq!(config.lifecycle.dispatcher.max_attempts, 10);
    }

    #[test]
    fn production_profile_requires_key_and_tokens() {
        let mut config = AppConfig {
            profile: "production".to_string(),
            ..AppConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingEncryptionKey)
        ));

        config.encryption_key = Some(vec![7u8; 32]);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingOperatorTokens)
        ));

        config.operator_tokens = vec!["token".to_string()];
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_short_encryption_key() {
        let config = AppConfig {
            encryption_key: Some(vec![1u8; 16]),
            ..AppConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidEncryptionKeyLength { length: 16 })
        ));
    }

    #[test]
    fn rejects_zero_durations_and_counts() {
        let mut config = AppConfig::default();
        config.webhook.claim_lease_ms = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.lifecycle.activity.retention_row_cap = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.lifecycle.dispatcher.batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_relative_callback_override() {
        let mut config = AppConfig::default();
        config
            .callbacks
            .provider_url_overrides
            .insert("github".to_string(), "/relative/path".to_string());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn parses_maps_and_lists() {
        let map = parse_map("github=https://a.example/cb, slack = x ,broken,=empty");
        assert_eq!(map.len(), 2);
        assert_eq!(map["github"], "https://a.example/cb");
        assert_eq!(map["slack"], "x");

        assert_eq!(parse_list(" a, ,b "), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(parse_bool("YES"), Some(true));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn redacts_secrets() {
        let mut config = AppConfig::default();
        config.operator_tokens = vec!["super-secret".to_string()];
        config
            .webhook
            .signing_secrets
            .insert("github".to_string(), "hmac-secret".to_string());
        config.oauth_clients.insert(
            "github".to_string(),
            OAuthClientConfig {
                client_id: "id".to_string(),
                client_secret: "client-secret".to_string(),
                ..OAuthClientConfig::default()
            },
        );

        let json = config.redacted_json().unwrap();
        assert!(!json.contains("super-secret"));
        assert!(!json.contains("hmac-secret"));
        assert!(!json.contains("client-secret"));
        assert!(json.contains(REDACTED));
    }
}
