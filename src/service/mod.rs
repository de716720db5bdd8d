//! # Services Facade
//!
//! The only writer of installations, connections, credentials, grant
//! snapshots and subscriptions. Every mutation enqueues a lifecycle event in
//! the same transaction where the store allows it.

use std::sync::Arc;

use chrono::{Duration, Utc};
use metrics::counter;
use rand::Rng;
use sea_orm::TransactionTrait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use utoipa::ToSchema;

use crate::crypto::SecretProvider;
use crate::error::{ServiceError, ServiceResult};
use crate::lifecycle::{LifecycleEvent, events};
use crate::models::status::{ConnectionStatus, InstallationStatus, SubscriptionStatus};
use crate::models::{connection, json_strings, to_db_time};
use crate::pagination::Page;
use crate::providers::{
    BeginAuthRequest, BeginAuthResponse, CompleteAuthRequest, DeniedBehavior, ProviderError,
    ProviderLifecycle, ProviderRegistry,
};
use crate::repositories::rate_limit::RateLimitObservation;
use crate::repositories::subscription::SubscriptionDraft;
use crate::repositories::{
    ConnectionRepository, CredentialRepository, GrantSnapshotRepository, OutboxRepository,
    RecordFilter, Repositories, SubscriptionRepository,
};
use crate::scope::ScopeRef;

pub mod views;

pub use views::{
    ConnectionView, CredentialView, GrantSnapshotView, InstallationView, RateLimitView,
    SubscriptionView, SyncCursorView, SyncJobView,
};

const DEFAULT_INSTALL_TYPE: &str = "oauth";
const DEFAULT_RENEWAL_TTL_SECONDS: u64 = 7 * 24 * 3600;
const REFRESH_BUCKET: &str = "refresh";

#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub provider_id: String,
    pub scope: ScopeRef,
    pub redirect_uri: String,
    pub state: Option<String>,
    pub requested_grants: Vec<String>,
    pub metadata: Value,
}

#[derive(Debug, Clone)]
pub struct CallbackRequest {
    pub provider_id: String,
    pub scope: ScopeRef,
    pub code: String,
    pub state: String,
    pub redirect_uri: String,
    pub metadata: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CallbackResult {
    pub connection: ConnectionView,
    pub credential: CredentialView,
    pub grants: GrantSnapshotView,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RefreshResult {
    pub connection: ConnectionView,
    pub credential: CredentialView,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RevokeResult {
    pub connection: ConnectionView,
    pub reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct InvokeCapabilityRequest {
    pub provider_id: String,
    pub capability: String,
    pub scope: ScopeRef,
    pub connection_id: Option<String>,
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct CapabilityResult {
    pub allowed: bool,
    /// `allow`, or the capability's denied behavior (`block` | `warn`).
    pub mode: String,
    pub metadata: Value,
}

impl CapabilityResult {
    /// A blocked capability as the `missing_permissions` error callers surface.
    pub fn into_result(self) -> ServiceResult<Self> {
        if !self.allowed && self.mode == "block" {
            let missing = json_strings(&self.metadata["missing_grants"]);
            return Err(ServiceError::missing_permissions(missing));
        }
        Ok(self)
    }
}

#[derive(Debug, Clone)]
pub struct UpsertInstallationRequest {
    pub provider_id: String,
    pub scope: ScopeRef,
    pub install_type: Option<String>,
    pub status: InstallationStatus,
    pub metadata: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ConnectionDetail {
    pub connection: ConnectionView,
    pub credential: Option<CredentialView>,
    pub grants: Option<GrantSnapshotView>,
}

#[derive(Debug, Clone)]
pub struct ReconsentRequest {
    pub connection_id: String,
    pub redirect_uri: String,
    pub state: Option<String>,
    pub requested_grants: Vec<String>,
    pub metadata: Value,
}

pub struct ServicesFacade {
    repos: Repositories,
    providers: Arc<ProviderRegistry>,
    secrets: Arc<dyn SecretProvider>,
}

impl ServicesFacade {
    pub fn new(
        repos: Repositories,
        providers: Arc<ProviderRegistry>,
        secrets: Arc<dyn SecretProvider>,
    ) -> Self {
        Self {
            repos,
            providers,
            secrets,
        }
    }

    pub fn repositories(&self) -> &Repositories {
        &self.repos
    }

    pub fn providers(&self) -> &Arc<ProviderRegistry> {
        &self.providers
    }

    pub fn secrets(&self) -> &Arc<dyn SecretProvider> {
        &self.secrets
    }

    pub fn provider(&self, provider_id: &str) -> ServiceResult<Arc<dyn ProviderLifecycle>> {
        self.providers
            .get(provider_id)
            .ok_or_else(|| ServiceError::not_found(format!("provider {} not found", provider_id)))
    }

    fn provider_for_scope(
        &self,
        provider_id: &str,
        scope: &ScopeRef,
    ) -> ServiceResult<Arc<dyn ProviderLifecycle>> {
        let provider = self.provider(provider_id)?;
        if !provider.descriptor().supports_scope(scope.scope_type) {
            return Err(ServiceError::validation(format!(
                "provider {} does not support {} scopes",
                provider_id, scope.scope_type
            )));
        }
        Ok(provider)
    }

    /// Start the authorization flow and return the provider's authorize URL.
    pub async fn connect(&self, request: ConnectRequest) -> ServiceResult<BeginAuthResponse> {
        let provider = self.provider_for_scope(&request.provider_id, &request.scope)?;
        if request.redirect_uri.trim().is_empty() {
            return Err(ServiceError::validation("redirect_uri is required"));
        }

        let requested_grants = if request.requested_grants.is_empty() {
            normalize_grants(&provider.descriptor().default_grants)
        } else {
            normalize_grants(&request.requested_grants)
        };
        let state = normalize_state(request.state.as_deref());

        let response = provider
            .begin_auth(BeginAuthRequest {
                scope: request.scope.clone(),
                redirect_uri: request.redirect_uri,
                state,
                requested_grants,
                metadata: request.metadata,
            })
            .await?;
        tracing::info!(
            provider_id = %request.provider_id,
            scope = %request.scope,
            "Started provider authorization"
        );
        Ok(response)
    }

    /// Exchange the callback code and persist connection, credential and grants.
    pub async fn complete_callback(&self, request: CallbackRequest) -> ServiceResult<CallbackResult> {
        let provider = self.provider_for_scope(&request.provider_id, &request.scope)?;
        if request.code.trim().is_empty() {
            return Err(ServiceError::validation("code is required"));
        }

        let install_type = request
            .metadata
            .get("install_type")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_INSTALL_TYPE)
            .to_string();
        let completed = provider
            .complete_auth(CompleteAuthRequest {
                scope: request.scope.clone(),
                code: request.code,
                state: request.state,
                redirect_uri: request.redirect_uri,
                metadata: request.metadata,
            })
            .await?;

        let txn = self.repos.db.begin().await?;
        let connection = ConnectionRepository::find_or_create(
            &txn,
            &request.provider_id,
            &request.scope,
            &completed.external_account_id,
        )
        .await?;
        let credential = CredentialRepository::rotate(
            &txn,
            self.secrets.as_ref(),
            &connection.id,
            &completed.credential,
        )
        .await?;
        let grants = GrantSnapshotRepository::capture(
            &txn,
            &connection.id,
            &completed.credential.requested_grants,
            &completed.credential.granted_grants,
            completed.metadata.clone(),
        )
        .await?;
        let event = LifecycleEvent::new(
            events::CONNECTION_CONNECTED,
            &request.provider_id,
            request.scope.clone(),
        )
        .with_connection(connection.id.clone())
        .with_payload(json!({
            "external_account_id": completed.external_account_id,
            "credential_version": credential.version,
            "granted_grants": completed.credential.granted_grants,
        }));
        OutboxRepository::insert(&txn, &event).await?;
        txn.commit().await?;

        if self
            .repos
            .installations
            .find_by_scope(&request.provider_id, &request.scope)
            .await?
            .is_none()
        {
            self.upsert_installation(UpsertInstallationRequest {
                provider_id: request.provider_id.clone(),
                scope: request.scope.clone(),
                install_type: Some(install_type),
                status: InstallationStatus::Active,
                metadata: json!({ "connection_id": connection.id }),
            })
            .await?;
        }

        counter!("services_connections_connected_total").increment(1);
        tracing::info!(
            provider_id = %request.provider_id,
            connection_id = %connection.id,
            credential_version = credential.version,
            "Connection authorized"
        );
        Ok(CallbackResult {
            connection: connection.into(),
            credential: credential.into(),
            grants: grants.into(),
        })
    }

    /// Rotate the credential through the provider's refresh flow. Failures
    /// degrade the connection and keep the existing credential.
    pub async fn refresh(
        &self,
        provider_id: Option<&str>,
        connection_id: &str,
    ) -> ServiceResult<RefreshResult> {
        let connection = self.require_connection(provider_id, connection_id).await?;
        if connection.status == ConnectionStatus::Disconnected.as_str() {
            return Err(ServiceError::conflict(format!(
                "connection {} is disconnected",
                connection.id
            )));
        }
        let provider = self.provider(&connection.provider_id)?;
        let scope = ScopeRef::from_columns(&connection.scope_type, &connection.scope_id)?;
        let current = self
            .repos
            .credentials
            .active_for(&connection.id)
            .await?
            .ok_or_else(|| {
                ServiceError::conflict(format!("connection {} has no active credential", connection.id))
            })?;
        let payload = CredentialRepository::open(self.secrets.as_ref(), &current)?;

        let refreshed = match provider.refresh(&payload).await {
            Ok(refreshed) => refreshed,
            Err(err) => return Err(self.record_refresh_failure(&connection, &scope, err).await),
        };

        let txn = self.repos.db.begin().await?;
        let credential =
            CredentialRepository::rotate(&txn, self.secrets.as_ref(), &connection.id, &refreshed)
                .await?;
        if normalize_grants(&refreshed.granted_grants) != normalize_grants(&payload.granted_grants) {
            GrantSnapshotRepository::capture(
                &txn,
                &connection.id,
                &refreshed.requested_grants,
                &refreshed.granted_grants,
                json!({ "source": "refresh" }),
            )
            .await?;
        }
        ConnectionRepository::update_status(&txn, &connection.id, ConnectionStatus::Active, None)
            .await?;
        let event = LifecycleEvent::new(
            events::CONNECTION_REFRESHED,
            &connection.provider_id,
            scope,
        )
        .with_connection(connection.id.clone())
        .with_payload(json!({ "credential_version": credential.version }));
        OutboxRepository::insert(&txn, &event).await?;
        txn.commit().await?;

        counter!("services_refresh_total", "outcome" => "ok").increment(1);
        let connection = self.repos.connections.require(&connection.id).await?;
        Ok(RefreshResult {
            connection: connection.into(),
            credential: credential.into(),
        })
    }

    async fn record_refresh_failure(
        &self,
        connection: &connection::Model,
        scope: &ScopeRef,
        err: ProviderError,
    ) -> ServiceError {
        counter!("services_refresh_total", "outcome" => "error").increment(1);
        tracing::warn!(
            provider_id = %connection.provider_id,
            connection_id = %connection.id,
            error = %err,
            "Credential refresh failed"
        );

        if let ProviderError::RateLimited {
            retry_after,
            limit,
            remaining,
        } = &err
        {
            self.record_rate_limit(connection, scope, *retry_after, *limit, *remaining)
                .await;
        }

        let message = err.to_string();
        let degraded = async {
            ConnectionRepository::update_status(
                &*self.repos.db,
                &connection.id,
                ConnectionStatus::Degraded,
                Some(message.clone()),
            )
            .await?;
            let event = LifecycleEvent::new(
                events::CONNECTION_REFRESH_FAILED,
                &connection.provider_id,
                scope.clone(),
            )
            .with_connection(connection.id.clone())
            .with_payload(json!({ "error": message }));
            OutboxRepository::insert(&*self.repos.db, &event).await
        };
        if let Err(store_err) = degraded.await {
            tracing::error!(
                connection_id = %connection.id,
                error = %store_err,
                "Failed to record refresh failure"
            );
        }
        err.into()
    }

    async fn record_rate_limit(
        &self,
        connection: &connection::Model,
        scope: &ScopeRef,
        retry_after: Option<u64>,
        limit: Option<u32>,
        remaining: Option<u32>,
    ) {
        let Some(store) = self.repos.rate_limits() else {
            tracing::debug!(provider_id = %connection.provider_id, "Rate-limit store not configured");
            return;
        };
        let retry_after = retry_after.unwrap_or_default();
        let reset_at = Duration::try_seconds(i64::try_from(retry_after).unwrap_or(i64::MAX))
            .and_then(|delay| Utc::now().checked_add_signed(delay))
            .map(to_db_time);
        let observation = RateLimitObservation {
            provider_id: connection.provider_id.clone(),
            scope: scope.clone(),
            bucket_key: REFRESH_BUCKET.to_string(),
            limit: limit.and_then(|v| i32::try_from(v).ok()).unwrap_or_default(),
            remaining: remaining.and_then(|v| i32::try_from(v).ok()).unwrap_or_default(),
            reset_at,
            retry_after: i64::try_from(retry_after).unwrap_or(i64::MAX),
            metadata: json!({ "connection_id": connection.id }),
        };
        if let Err(err) = store.upsert(observation).await {
            tracing::warn!(error = %err, "Failed to record rate-limit state");
        }
    }

    /// Revoke every credential and disconnect. Repeat calls return the same view.
    pub async fn revoke(&self, connection_id: &str, reason: Option<String>) -> ServiceResult<RevokeResult> {
        let connection = self.repos.connections.require(connection_id).await?;
        let has_active = self
            .repos
            .credentials
            .active_for(&connection.id)
            .await?
            .is_some();
        if connection.status == ConnectionStatus::Disconnected.as_str() && !has_active {
            return Ok(RevokeResult {
                connection: connection.into(),
                reason,
            });
        }

        let scope = ScopeRef::from_columns(&connection.scope_type, &connection.scope_id)?;
        let txn = self.repos.db.begin().await?;
        let revoked = CredentialRepository::revoke_all(&txn, &connection.id).await?;
        ConnectionRepository::update_status(
            &txn,
            &connection.id,
            ConnectionStatus::Disconnected,
            None,
        )
        .await?;
        let event = LifecycleEvent::new(events::CONNECTION_REVOKED, &connection.provider_id, scope)
            .with_connection(connection.id.clone())
            .with_payload(json!({ "reason": reason, "revoked_credentials": revoked }));
        OutboxRepository::insert(&txn, &event).await?;
        txn.commit().await?;

        tracing::info!(connection_id = %connection.id, revoked, "Connection revoked");
        let connection = self.repos.connections.require(&connection.id).await?;
        Ok(RevokeResult {
            connection: connection.into(),
            reason,
        })
    }

    /// Check the capability's required grants against the latest snapshot.
    pub async fn invoke_capability(
        &self,
        request: InvokeCapabilityRequest,
    ) -> ServiceResult<CapabilityResult> {
        let capability = self
            .providers
            .capability(&request.provider_id, &request.capability)
            .ok_or_else(|| {
                ServiceError::not_found(format!(
                    "capability {} not found for provider {}",
                    request.capability, request.provider_id
                ))
            })?;

        let connection = match &request.connection_id {
            Some(id) => Some(self.require_connection(Some(&request.provider_id), id).await?),
            None => self.active_connection(&request.provider_id, &request.scope).await?,
        };
        let granted = match &connection {
            Some(connection) => self
                .repos
                .grants
                .latest(&connection.id)
                .await?
                .map(|snapshot| json_strings(&snapshot.granted_grants))
                .unwrap_or_default(),
            None => Vec::new(),
        };

        let missing = capability.missing_grants(&granted);
        let allowed = missing.is_empty();
        let mode = if allowed {
            "allow"
        } else {
            match capability.denied_behavior {
                DeniedBehavior::Block => "block",
                DeniedBehavior::Warn => "warn",
            }
        };

        let connection_id = connection.as_ref().map(|c| c.id.clone());
        let mut event = LifecycleEvent::new(
            events::CAPABILITY_INVOKED,
            &request.provider_id,
            request.scope.clone(),
        )
        .with_payload(json!({
            "capability": capability.name,
            "allowed": allowed,
            "mode": mode,
            "missing_grants": missing,
        }));
        if let Some(id) = &connection_id {
            event = event.with_connection(id.clone());
        }
        OutboxRepository::insert(&*self.repos.db, &event).await?;

        counter!("services_capability_invocations_total", "mode" => mode).increment(1);
        Ok(CapabilityResult {
            allowed,
            mode: mode.to_string(),
            metadata: json!({
                "missing_grants": missing,
                "required_grants": capability.required_grants,
                "connection_id": connection_id,
                "payload": request.payload,
            }),
        })
    }

    pub async fn upsert_installation(
        &self,
        request: UpsertInstallationRequest,
    ) -> ServiceResult<InstallationView> {
        self.provider_for_scope(&request.provider_id, &request.scope)?;
        let install_type = request
            .install_type
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .unwrap_or(DEFAULT_INSTALL_TYPE);
        let installation = self
            .repos
            .installations
            .upsert(
                &request.provider_id,
                &request.scope,
                install_type,
                request.status,
                request.metadata,
            )
            .await?;
        let event = LifecycleEvent::new(
            events::INSTALLATION_UPSERTED,
            &request.provider_id,
            request.scope,
        )
        .with_payload(json!({
            "installation_id": installation.id,
            "status": installation.status,
        }));
        OutboxRepository::insert(&*self.repos.db, &event).await?;
        Ok(installation.into())
    }

    pub async fn get_installation(&self, id: &str) -> ServiceResult<InstallationView> {
        self.repos
            .installations
            .get(id)
            .await?
            .map(InstallationView::from)
            .ok_or_else(|| ServiceError::not_found(format!("installation {} not found", id)))
    }

    pub async fn update_installation_status(
        &self,
        id: &str,
        status: InstallationStatus,
        reason: Option<String>,
    ) -> ServiceResult<InstallationView> {
        let before = self.get_installation(id).await?;
        let installation = self.repos.installations.update_status(id, status).await?;
        if before.status != installation.status {
            let scope = ScopeRef::from_columns(&installation.scope_type, &installation.scope_id)?;
            let event = LifecycleEvent::new(
                events::INSTALLATION_STATUS_CHANGED,
                &installation.provider_id,
                scope,
            )
            .with_payload(json!({
                "installation_id": installation.id,
                "from": before.status,
                "to": installation.status,
                "reason": reason,
            }));
            OutboxRepository::insert(&*self.repos.db, &event).await?;
        }
        Ok(installation.into())
    }

    pub async fn list_installations(
        &self,
        filter: &RecordFilter,
        page: Page,
    ) -> ServiceResult<(Vec<InstallationView>, u64)> {
        let (rows, total) = self
            .repos
            .installations
            .list(filter, page.limit, page.offset)
            .await?;
        Ok((rows.into_iter().map(Into::into).collect(), total))
    }

    /// Authorization flow for installing the provider into a scope.
    pub async fn begin_installation(&self, request: ConnectRequest) -> ServiceResult<BeginAuthResponse> {
        let mut request = request;
        if let Value::Object(map) = &mut request.metadata {
            map.entry("install_type")
                .or_insert_with(|| json!(DEFAULT_INSTALL_TYPE));
        } else {
            request.metadata = json!({ "install_type": DEFAULT_INSTALL_TYPE });
        }
        self.connect(request).await
    }

    pub async fn list_connections(
        &self,
        filter: &RecordFilter,
        page: Page,
    ) -> ServiceResult<(Vec<ConnectionView>, u64)> {
        let (rows, total) = self
            .repos
            .connections
            .list(filter, page.limit, page.offset)
            .await?;
        Ok((rows.into_iter().map(Into::into).collect(), total))
    }

    pub async fn get_connection(&self, id: &str) -> ServiceResult<ConnectionDetail> {
        let connection = self.repos.connections.require(id).await?;
        let credential = self.repos.credentials.active_for(id).await?;
        let grants = self.repos.grants.latest(id).await?;
        Ok(ConnectionDetail {
            connection: connection.into(),
            credential: credential.map(Into::into),
            grants: grants.map(Into::into),
        })
    }

    pub async fn grant_snapshot(&self, connection_id: &str) -> ServiceResult<GrantSnapshotView> {
        self.repos.connections.require(connection_id).await?;
        self.repos
            .grants
            .latest(connection_id)
            .await?
            .map(GrantSnapshotView::from)
            .ok_or_else(|| {
                ServiceError::not_found(format!(
                    "no grant snapshot for connection {}",
                    connection_id
                ))
            })
    }

    /// Ask the account owner to re-authorize with the union of previously
    /// requested and newly requested grants.
    pub async fn reconsent_begin(&self, request: ReconsentRequest) -> ServiceResult<BeginAuthResponse> {
        let connection = self.repos.connections.require(&request.connection_id).await?;
        let scope = ScopeRef::from_columns(&connection.scope_type, &connection.scope_id)?;
        let mut grants = self
            .repos
            .grants
            .latest(&connection.id)
            .await?
            .map(|snapshot| json_strings(&snapshot.requested_grants))
            .unwrap_or_default();
        grants.extend(request.requested_grants);

        let response = self
            .connect(ConnectRequest {
                provider_id: connection.provider_id.clone(),
                scope: scope.clone(),
                redirect_uri: request.redirect_uri,
                state: request.state,
                requested_grants: grants,
                metadata: request.metadata,
            })
            .await?;

        let event = LifecycleEvent::new(
            events::CONNECTION_RECONSENT_REQUESTED,
            &connection.provider_id,
            scope,
        )
        .with_connection(connection.id.clone())
        .with_payload(json!({ "requested_grants": response.requested_grants }));
        OutboxRepository::insert(&*self.repos.db, &event).await?;
        Ok(response)
    }

    pub async fn upsert_subscription(&self, draft: SubscriptionDraft) -> ServiceResult<SubscriptionView> {
        let connection = self
            .require_connection(Some(&draft.provider_id), &draft.connection_id)
            .await?;
        let scope = ScopeRef::from_columns(&connection.scope_type, &connection.scope_id)?;

        let txn = self.repos.db.begin().await?;
        let subscription = SubscriptionRepository::upsert(&txn, draft).await?;
        let event = LifecycleEvent::new(
            events::SUBSCRIPTION_UPSERTED,
            &subscription.provider_id,
            scope,
        )
        .with_connection(subscription.connection_id.clone())
        .with_payload(json!({
            "subscription_id": subscription.id,
            "resource_type": subscription.resource_type,
            "resource_id": subscription.resource_id,
        }));
        OutboxRepository::insert(&txn, &event).await?;
        txn.commit().await?;
        Ok(subscription.into())
    }

    /// Extend the subscription by `ttl_seconds` (seven days by default).
    pub async fn renew_subscription(
        &self,
        subscription_id: &str,
        ttl_seconds: Option<u64>,
    ) -> ServiceResult<SubscriptionView> {
        let subscription = self.repos.subscriptions.require(subscription_id).await?;
        if subscription.status == SubscriptionStatus::Cancelled.as_str() {
            return Err(ServiceError::conflict(format!(
                "subscription {} is cancelled",
                subscription.id
            )));
        }
        let connection = self.repos.connections.require(&subscription.connection_id).await?;
        let scope = ScopeRef::from_columns(&connection.scope_type, &connection.scope_id)?;

        let ttl = ttl_seconds.unwrap_or(DEFAULT_RENEWAL_TTL_SECONDS);
        let expires_at = Duration::try_seconds(i64::try_from(ttl).unwrap_or(i64::MAX))
            .and_then(|ttl| Utc::now().checked_add_signed(ttl))
            .ok_or_else(|| ServiceError::validation("ttl_seconds is out of range"))?;

        let txn = self.repos.db.begin().await?;
        let renewed = SubscriptionRepository::set_status(
            &txn,
            subscription,
            SubscriptionStatus::Active,
            Some(to_db_time(expires_at)),
        )
        .await?;
        let event = LifecycleEvent::new(events::SUBSCRIPTION_RENEWED, &renewed.provider_id, scope)
            .with_connection(renewed.connection_id.clone())
            .with_payload(json!({
                "subscription_id": renewed.id,
                "expires_at": expires_at,
            }));
        OutboxRepository::insert(&txn, &event).await?;
        txn.commit().await?;
        Ok(renewed.into())
    }

    /// Cancel the subscription; cancelling twice is a no-op.
    pub async fn cancel_subscription(
        &self,
        subscription_id: &str,
        reason: Option<String>,
    ) -> ServiceResult<SubscriptionView> {
        let subscription = self.repos.subscriptions.require(subscription_id).await?;
        if subscription.status == SubscriptionStatus::Cancelled.as_str() {
            return Ok(subscription.into());
        }
        let connection = self.repos.connections.require(&subscription.connection_id).await?;
        let scope = ScopeRef::from_columns(&connection.scope_type, &connection.scope_id)?;

        let txn = self.repos.db.begin().await?;
        let cancelled = SubscriptionRepository::set_status(
            &txn,
            subscription,
            SubscriptionStatus::Cancelled,
            None,
        )
        .await?;
        let event = LifecycleEvent::new(
            events::SUBSCRIPTION_CANCELLED,
            &cancelled.provider_id,
            scope,
        )
        .with_connection(cancelled.connection_id.clone())
        .with_payload(json!({ "subscription_id": cancelled.id, "reason": reason }));
        OutboxRepository::insert(&txn, &event).await?;
        txn.commit().await?;
        Ok(cancelled.into())
    }

    pub async fn list_subscriptions(
        &self,
        filter: &RecordFilter,
        page: Page,
    ) -> ServiceResult<(Vec<SubscriptionView>, u64)> {
        let (rows, total) = self
            .repos
            .subscriptions
            .list(filter, page.limit, page.offset)
            .await?;
        Ok((rows.into_iter().map(Into::into).collect(), total))
    }

    pub async fn list_rate_limits(
        &self,
        filter: &RecordFilter,
        limit: u64,
    ) -> ServiceResult<Vec<RateLimitView>> {
        match self.repos.rate_limits() {
            Some(store) => Ok(store
                .list(filter, limit)
                .await?
                .into_iter()
                .map(Into::into)
                .collect()),
            None => Ok(Vec::new()),
        }
    }

    async fn require_connection(
        &self,
        provider_id: Option<&str>,
        connection_id: &str,
    ) -> ServiceResult<connection::Model> {
        let connection = self.repos.connections.require(connection_id).await?;
        if let Some(provider_id) = provider_id
            && connection.provider_id != provider_id
        {
            return Err(ServiceError::validation(format!(
                "connection {} belongs to provider {}",
                connection.id, connection.provider_id
            )));
        }
        Ok(connection)
    }

    async fn active_connection(
        &self,
        provider_id: &str,
        scope: &ScopeRef,
    ) -> ServiceResult<Option<connection::Model>> {
        let filter = RecordFilter {
            provider_id: Some(provider_id.to_string()),
            scope_type: Some(scope.scope_type.as_str().to_string()),
            scope_id: Some(scope.id.clone()),
            status: Some(ConnectionStatus::Active.as_str().to_string()),
            ..RecordFilter::default()
        };
        let (mut rows, _) = self.repos.connections.list(&filter, 1, 0).await?;
        Ok(rows.pop())
    }
}

/// Trim, drop blanks, sort and dedupe.
pub fn normalize_grants(grants: &[String]) -> Vec<String> {
    let mut grants: Vec<String> = grants
        .iter()
        .map(|g| g.trim().to_string())
        .filter(|g| !g.is_empty())
        .collect();
    grants.sort();
    grants.dedup();
    grants
}

/// Caller state, or 32 random bytes encoded URL-safe.
fn normalize_state(state: Option<&str>) -> String {
    state
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| {
            let mut bytes = [0u8; 32];
            rand::thread_rng().fill(&mut bytes);
            base64_url::encode(&bytes)
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grants_are_normalized() {
        let grants = vec![" repo ".to_string(), "".into(), "admin".into(), "repo".into()];
        assert_eq!(normalize_grants(&grants), vec!["admin", "repo"]);
    }

    #[test]
    fn blank_state_is_generated() {
        assert_eq!(normalize_state(Some(" state-a ")), "state-a");
        let generated = normalize_state(Some("  "));
        assert_eq!(generated.len(), 43);
        assert!(generated.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        assert_ne!(normalize_state(None), generated);
    }

    #[test]
    fn blocked_capability_becomes_missing_permissions() {
        let result = CapabilityResult {
            allowed: false,
            mode: "block".into(),
            metadata: json!({ "missing_grants": ["repo"] }),
        };
        let err = result.into_result().unwrap_err();
        assert_eq!(&*crate::error::map_error(&err).code, "missing_permissions");

        let warned = CapabilityResult {
            allowed: false,
            mode: "warn".into(),
            metadata: json!({ "missing_grants": ["repo"] }),
        };
        assert!(warned.into_result().is_ok());
    }
}
