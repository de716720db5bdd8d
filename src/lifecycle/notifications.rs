//! Notifications projector
//!
//! Resolves a notification definition and recipients for each lifecycle
//! event, then sends at most once per `(event, definition, recipient)` using
//! the dispatch ledger as the dedupe authority.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use url::Url;

use super::{LifecycleEvent, Projector};
use crate::error::{ServiceError, ServiceResult};
use crate::scope::ScopeType;

pub const PROJECTOR_NAME: &str = "notifications";

const MAX_WEBHOOK_URL_LENGTH: usize = 2048;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipientKind {
    Org,
    User,
}

impl RecipientKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecipientKind::Org => "org",
            RecipientKind::User => "user",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Recipient {
    pub kind: RecipientKind,
    pub id: String,
}

impl Recipient {
    /// `recipient_type:recipient_id`
    pub fn key(&self) -> String {
        format!("{}:{}", self.kind.as_str(), self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub idempotency_key: String,
    pub definition_code: String,
    pub recipient: Recipient,
    pub event_id: String,
    pub event_name: String,
    pub provider_id: String,
    pub payload: Value,
}

/// Outcome row persisted for every send attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchRecord {
    pub idempotency_key: String,
    pub event_id: String,
    pub projector: String,
    pub definition_code: String,
    pub recipient_key: String,
    /// sent | failed
    pub status: String,
    pub error: Option<String>,
    pub metadata: Value,
}

/// Ledger of notification sends keyed by idempotency key.
#[async_trait]
pub trait DispatchLedger: Send + Sync {
    /// True iff a `sent` row exists for `key`.
    async fn seen(&self, key: &str) -> ServiceResult<bool>;

    /// Upsert on `idempotency_key`; a `sent` row is never downgraded.
    async fn record(&self, record: &DispatchRecord) -> ServiceResult<()>;
}

#[async_trait]
pub trait NotificationSender: Send + Sync {
    async fn send(&self, notification: &Notification) -> ServiceResult<()>;
}

/// Sender that only logs; used when no delivery target is configured.
#[derive(Debug, Default)]
pub struct LoggingNotificationSender;

#[async_trait]
impl NotificationSender for LoggingNotificationSender {
    async fn send(&self, notification: &Notification) -> ServiceResult<()> {
        tracing::info!(
            definition = %notification.definition_code,
            recipient = %notification.recipient.key(),
            event_id = %notification.event_id,
            "Notification dispatched"
        );
        Ok(())
    }
}

/// Posts notifications as JSON to an HTTPS endpoint.
pub struct WebhookNotificationSender {
    client: reqwest::Client,
    target: Url,
}

impl WebhookNotificationSender {
    pub fn new(target: &str, timeout: Duration) -> ServiceResult<Self> {
        if target.len() > MAX_WEBHOOK_URL_LENGTH {
            return Err(ServiceError::validation("notification webhook URL is too long"));
        }
        let url = Url::parse(target)
            .map_err(|err| ServiceError::validation(format!("invalid notification URL: {}", err)))?;
        if url.scheme() != "https" && !is_local_http(&url) {
            return Err(ServiceError::validation(
                "notification webhook URL must use https",
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| ServiceError::internal(err.to_string()))?;
        Ok(Self {
            client,
            target: url,
        })
    }

    /// Host and path without query string or credentials, for logs.
    pub fn redacted_target(&self) -> String {
        format!(
            "{}://{}{}",
            self.target.scheme(),
            self.target.host_str().unwrap_or_default(),
            self.target.path()
        )
    }
}

fn is_local_http(url: &Url) -> bool {
    url.scheme() == "http" && matches!(url.host_str(), Some("localhost" | "127.0.0.1"))
}

#[async_trait]
impl NotificationSender for WebhookNotificationSender {
    async fn send(&self, notification: &Notification) -> ServiceResult<()> {
        let response = self
            .client
            .post(self.target.clone())
            .json(notification)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    ServiceError::timeout("notification webhook timed out")
                } else {
                    ServiceError::provider_unavailable(format!(
                        "notification webhook {} unreachable",
                        self.redacted_target()
                    ))
                }
            })?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(ServiceError::provider_unavailable(format!(
                "notification webhook {} answered {}",
                self.redacted_target(),
                status
            )))
        }
    }
}

/// Resolves the notification definition code for an event.
#[derive(Debug, Clone, Default)]
pub struct DefinitionResolver {
    definition_map: BTreeMap<String, String>,
}

impl DefinitionResolver {
    pub fn new(definition_map: BTreeMap<String, String>) -> Self {
        Self { definition_map }
    }

    /// Explicit `metadata.notification_definition`, else the event-name mapping.
    pub fn resolve(&self, event: &LifecycleEvent) -> Option<String> {
        event
            .metadata_str("notification_definition")
            .map(str::to_string)
            .or_else(|| self.definition_map.get(&event.event_name).cloned())
    }
}

/// User scopes notify the user; `metadata.recipient_user_ids` and
/// `metadata.recipient_org_ids` add more. Deduplicated and sorted.
pub fn resolve_recipients(event: &LifecycleEvent) -> Vec<Recipient> {
    let mut recipients = BTreeSet::new();
    if event.scope.scope_type == ScopeType::User {
        recipients.insert(Recipient {
            kind: RecipientKind::User,
            id: event.scope.id.clone(),
        });
    }

    for (field, kind) in [
        ("recipient_user_ids", RecipientKind::User),
        ("recipient_org_ids", RecipientKind::Org),
    ] {
        let ids = event
            .metadata
            .get(field)
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(Value::as_str)
            .map(str::trim)
            .filter(|id| !id.is_empty());
        for id in ids {
            recipients.insert(Recipient {
                kind: kind.clone(),
                id: id.to_string(),
            });
        }
    }

    recipients.into_iter().collect()
}

/// `event_id|projector|definition_code|recipient_type:recipient_id`
pub fn dedupe_key(event_id: &str, definition_code: &str, recipient: &Recipient) -> String {
    format!(
        "{}|{}|{}|{}",
        event_id,
        PROJECTOR_NAME,
        definition_code,
        recipient.key()
    )
}

pub struct NotificationsProjector {
    resolver: DefinitionResolver,
    ledger: Arc<dyn DispatchLedger>,
    sender: Arc<dyn NotificationSender>,
}

impl NotificationsProjector {
    pub fn new(
        resolver: DefinitionResolver,
        ledger: Arc<dyn DispatchLedger>,
        sender: Arc<dyn NotificationSender>,
    ) -> Self {
        Self {
            resolver,
            ledger,
            sender,
        }
    }
}

#[async_trait]
impl Projector for NotificationsProjector {
    fn name(&self) -> &str {
        PROJECTOR_NAME
    }

    async fn project(&self, event: &LifecycleEvent) -> ServiceResult<()> {
        let Some(definition_code) = self.resolver.resolve(event) else {
            return Ok(());
        };

        let mut failures = Vec::new();
        for recipient in resolve_recipients(event) {
            let key = dedupe_key(&event.event_id, &definition_code, &recipient);
            if self.ledger.seen(&key).await? {
                tracing::debug!(idempotency_key = %key, "Notification already sent");
                continue;
            }

            let notification = Notification {
                idempotency_key: key.clone(),
                definition_code: definition_code.clone(),
                recipient: recipient.clone(),
                event_id: event.event_id.clone(),
                event_name: event.event_name.clone(),
                provider_id: event.provider_id.clone(),
                payload: event.payload.clone(),
            };
            let outcome = self.sender.send(&notification).await;
            let error = outcome.as_ref().err().map(ToString::to_string);

            self.ledger
                .record(&DispatchRecord {
                    idempotency_key: key,
                    event_id: event.event_id.clone(),
                    projector: PROJECTOR_NAME.to_string(),
                    definition_code: definition_code.clone(),
                    recipient_key: recipient.key(),
                    status: if error.is_none() { "sent" } else { "failed" }.to_string(),
                    error: error.clone(),
                    metadata: json!({ "event_name": event.event_name }),
                })
                .await?;

            if let Err(err) = outcome {
                failures.push(format!("{}: {}", recipient.key(), err));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(ServiceError::operation(format!(
                "notification delivery failed for {}",
                failures.join(", ")
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::ScopeRef;

    #[test]
    fn recipients_are_deduped_and_sorted() {
        let event = LifecycleEvent::new("services.test", "github", ScopeRef::user("u-2"))
            .with_metadata(json!({
                "recipient_user_ids": ["u-3", "u-2", " "],
                "recipient_org_ids": ["org-1", "org-1"],
            }));

        let keys: Vec<_> = resolve_recipients(&event).iter().map(Recipient::key).collect();
        assert_eq!(keys, vec!["org:org-1", "user:u-2", "user:u-3"]);

        let org_event = LifecycleEvent::new("services.test", "github", ScopeRef::org("org-1"));
        assert!(resolve_recipients(&org_event).is_empty());
    }

    #[test]
    fn explicit_definition_wins() {
        let resolver = DefinitionResolver::new(BTreeMap::from([(
            "services.connection.connected".to_string(),
            "connection_ready".to_string(),
        )]));
        let event = LifecycleEvent::new(
            "services.connection.connected",
            "github",
            ScopeRef::user("u-1"),
        );
        assert_eq!(resolver.resolve(&event).as_deref(), Some("connection_ready"));

        let explicit = event
            .clone()
            .with_metadata(json!({ "notification_definition": "custom" }));
        assert_eq!(resolver.resolve(&explicit).as_deref(), Some("custom"));

        let unmapped = LifecycleEvent::new("services.other", "github", ScopeRef::user("u-1"));
        assert_eq!(resolver.resolve(&unmapped), None);
    }

    #[test]
    fn dedupe_key_is_stable() {
        let recipient = Recipient {
            kind: RecipientKind::User,
            id: "u-1".into(),
        };
        assert_eq!(
            dedupe_key("evt_1", "connection_ready", &recipient),
            "evt_1|notifications|connection_ready|user:u-1"
        );
    }

    #[test]
    fn webhook_sender_validates_target() {
        assert!(WebhookNotificationSender::new("http://example.com/hook", Duration::from_secs(1)).is_err());
        assert!(WebhookNotificationSender::new("not a url", Duration::from_secs(1)).is_err());

        let sender = WebhookNotificationSender::new(
            "https://hooks.example.com/notify?token=secret",
            Duration::from_secs(1),
        )
        .unwrap();
        assert_eq!(sender.redacted_target(), "https://hooks.example.com/notify");
    }
}
