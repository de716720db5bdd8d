//! Lifecycle status values persisted as strings.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

macro_rules! status_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownStatus;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                match value.trim().to_ascii_lowercase().as_str() {
                    $($text => Ok(Self::$variant),)+
                    other => Err(UnknownStatus(other.to_string())),
                }
            }
        }
    };
}

/// A persisted status string that no variant recognises.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown status '{0}'")]
pub struct UnknownStatus(pub String);

status_enum!(InstallationStatus {
    Active => "active",
    Suspended => "suspended",
    Uninstalled => "uninstalled",
});

status_enum!(ConnectionStatus {
    Active => "active",
    Degraded => "degraded",
    Disconnected => "disconnected",
});

status_enum!(CredentialStatus {
    Active => "active",
    Revoked => "revoked",
});

status_enum!(SubscriptionStatus {
    Active => "active",
    Cancelled => "cancelled",
    Expired => "expired",
});

status_enum!(SyncJobStatus {
    Pending => "pending",
    Running => "running",
    Succeeded => "succeeded",
    Failed => "failed",
});

status_enum!(OutboxStatus {
    Pending => "pending",
    Processing => "processing",
    Delivered => "delivered",
    Failed => "failed",
    Dead => "dead",
});

status_enum!(DispatchStatus {
    Sent => "sent",
    Failed => "failed",
});

status_enum!(
    /// Webhook delivery ledger status.
    DeliveryStatus {
        Pending => "pending",
        Processing => "processing",
        RetryReady => "retry_ready",
        Processed => "processed",
        Dead => "dead",
    }
);

status_enum!(ActivityStatus {
    Ok => "ok",
    Error => "error",
});

impl InstallationStatus {
    /// Whether moving from `self` to `next` is a permitted transition.
    pub fn can_transition_to(&self, next: InstallationStatus) -> bool {
        use InstallationStatus::*;
        matches!(
            (self, next),
            (Active, Suspended) | (Suspended, Active) | (Active | Suspended, Uninstalled)
        ) || *self == next && *self != Uninstalled
    }
}
