//! Webhook claim ledger contract.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use utoipa::ToSchema;

use crate::error::ServiceResult;
use crate::models::status::DeliveryStatus;

const MAX_RETRY_DELAY: Duration = Duration::from_secs(3600);

/// One `(provider, delivery)` row of the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct DeliveryRecord {
    pub id: String,
    pub provider_id: String,
    pub delivery_id: String,
    pub status: DeliveryStatus,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claim_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimOutcome {
    pub record: DeliveryRecord,
    pub claimed: bool,
}

/// Serializes concurrent attempts at the same delivery. First claim wins.
#[async_trait]
pub trait ClaimLedger: Send + Sync {
    /// Create the row if needed and try to claim it. Claiming bumps
    /// `attempts`, assigns a fresh `claim_id` and leases the row until
    /// `now + lease`.
    async fn claim(
        &self,
        provider_id: &str,
        delivery_id: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> ServiceResult<ClaimOutcome>;

    async fn complete(&self, claim_id: &str, now: DateTime<Utc>) -> ServiceResult<()>;

    /// `dead` once `attempts >= max_attempts`, else `retry_ready` until `next_attempt_at`.
    async fn fail(
        &self,
        claim_id: &str,
        error: &str,
        next_attempt_at: DateTime<Utc>,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> ServiceResult<DeliveryRecord>;

    async fn get(&self, provider_id: &str, delivery_id: &str)
    -> ServiceResult<Option<DeliveryRecord>>;

    async fn status_counts(&self) -> ServiceResult<BTreeMap<String, u64>>;
}

/// Whether a record may be claimed at `now`.
pub fn is_claimable(record: &DeliveryRecord, now: DateTime<Utc>) -> bool {
    match record.status {
        DeliveryStatus::Pending => true,
        DeliveryStatus::RetryReady | DeliveryStatus::Processing => {
            record.next_attempt_at.is_none_or(|at| at <= now)
        }
        DeliveryStatus::Processed | DeliveryStatus::Dead => false,
    }
}

/// `lease × 2^(attempts−1)`, capped at one hour.
pub fn retry_delay(lease: Duration, attempts: u32) -> Duration {
    let exponent = attempts.saturating_sub(1).min(20);
    lease
        .checked_mul(1u32 << exponent)
        .unwrap_or(MAX_RETRY_DELAY)
        .min(MAX_RETRY_DELAY)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(status: DeliveryStatus, next_attempt_at: Option<DateTime<Utc>>) -> DeliveryRecord {
        let now = Utc::now();
        DeliveryRecord {
            id: "whd_1".into(),
            provider_id: "github".into(),
            delivery_id: "d-1".into(),
            status,
            attempts: 1,
            claim_id: None,
            next_attempt_at,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn claimability_follows_status_and_lease() {
        let now = Utc::now();
        let later = now + chrono::Duration::seconds(5);
        let earlier = now - chrono::Duration::seconds(5);

        assert!(is_claimable(&record(DeliveryStatus::Pending, None), now));
        assert!(!is_claimable(&record(DeliveryStatus::RetryReady, Some(later)), now));
        assert!(is_claimable(&record(DeliveryStatus::RetryReady, Some(earlier)), now));
        assert!(!is_claimable(&record(DeliveryStatus::Processing, Some(later)), now));
        assert!(is_claimable(&record(DeliveryStatus::Processing, Some(earlier)), now));
        assert!(!is_claimable(&record(DeliveryStatus::Processed, None), now));
        assert!(!is_claimable(&record(DeliveryStatus::Dead, None), now));
    }

    #[test]
    fn retry_delay_doubles_from_lease() {
        let lease = Duration::from_secs(1);
        assert_eq!(retry_delay(lease, 1), Duration::from_secs(1));
        assert_eq!(retry_delay(lease, 3), Duration::from_secs(4));
        assert_eq!(retry_delay(lease, 40), MAX_RETRY_DELAY);
    }
}
