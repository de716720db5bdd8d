//! Webhook delivery claim ledger over `service_webhook_deliveries`.
//!
//! `claim` inserts the row if missing (ignoring the unique-key conflict) and
//! then takes it with a single conditional update, so first-claim-wins holds
//! across processes sharing the database.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{
    ColumnTrait, Condition, DatabaseConnection, EntityTrait, QueryFilter, QuerySelect, Set,
};

use super::{StatusCount, status_map};
use crate::error::{ServiceError, ServiceResult};
use crate::models::status::DeliveryStatus;
use crate::models::webhook_delivery::{self, Column, Entity as WebhookDelivery};
use crate::models::{from_db_time, new_id, to_db_time};
use crate::webhooks::ledger::{ClaimLedger, ClaimOutcome, DeliveryRecord};

#[derive(Debug, Clone)]
pub struct WebhookDeliveryRepository {
    pub db: Arc<DatabaseConnection>,
}

impl WebhookDeliveryRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    async fn find(
        &self,
        provider_id: &str,
        delivery_id: &str,
    ) -> ServiceResult<Option<webhook_delivery::Model>> {
        Ok(WebhookDelivery::find()
            .filter(Column::ProviderId.eq(provider_id))
            .filter(Column::DeliveryId.eq(delivery_id))
            .one(&*self.db)
            .await?)
    }

    async fn find_by_claim(&self, claim_id: &str) -> ServiceResult<webhook_delivery::Model> {
        WebhookDelivery::find()
            .filter(Column::ClaimId.eq(claim_id))
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::not_found(format!("webhook claim {} not found", claim_id)))
    }
}

fn to_record(model: webhook_delivery::Model) -> ServiceResult<DeliveryRecord> {
    let status = model
        .status
        .parse()
        .map_err(|e| ServiceError::internal(format!("{}", e)))?;
    Ok(DeliveryRecord {
        id: model.id,
        provider_id: model.provider_id,
        delivery_id: model.delivery_id,
        status,
        attempts: u32::try_from(model.attempts).unwrap_or_default(),
        claim_id: model.claim_id,
        next_attempt_at: model.next_attempt_at.map(from_db_time),
        last_error: model.last_error,
        created_at: from_db_time(model.created_at),
        updated_at: from_db_time(model.updated_at),
    })
}

#[async_trait]
impl ClaimLedger for WebhookDeliveryRepository {
    async fn claim(
        &self,
        provider_id: &str,
        delivery_id: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> ServiceResult<ClaimOutcome> {
        let now_db = to_db_time(now);
        let lease_until = chrono::Duration::from_std(lease)
            .ok()
            .and_then(|lease| now.checked_add_signed(lease))
            .map(to_db_time)
            .ok_or_else(|| ServiceError::validation("invalid webhook claim lease"))?;

        let row = webhook_delivery::ActiveModel {
            id: Set(new_id("whd")),
            provider_id: Set(provider_id.to_string()),
            delivery_id: Set(delivery_id.to_string()),
            status: Set(DeliveryStatus::Pending.as_str().to_string()),
            attempts: Set(0),
            claim_id: Set(None),
            next_attempt_at: Set(None),
            last_error: Set(None),
            created_at: Set(now_db),
            updated_at: Set(now_db),
        };
        WebhookDelivery::insert(row)
            .on_conflict(
                OnConflict::columns([Column::ProviderId, Column::DeliveryId])
                    .do_nothing()
                    .to_owned(),
            )
            .exec_without_returning(&*self.db)
            .await?;

        let claimable = Condition::any()
            .add(Column::Status.eq(DeliveryStatus::Pending.as_str()))
            .add(
                Condition::all()
                    .add(Column::Status.is_in([
                        DeliveryStatus::RetryReady.as_str(),
                        DeliveryStatus::Processing.as_str(),
                    ]))
                    .add(
                        Condition::any()
                            .add(Column::NextAttemptAt.is_null())
                            .add(Column::NextAttemptAt.lte(now_db)),
                    ),
            );

        let claim_id = new_id("claim");
        let result = WebhookDelivery::update_many()
            .col_expr(Column::Status, Expr::value(DeliveryStatus::Processing.as_str()))
            .col_expr(Column::Attempts, Expr::col(Column::Attempts).add(1))
            .col_expr(Column::ClaimId, Expr::value(Some(claim_id.clone())))
            .col_expr(Column::NextAttemptAt, Expr::value(Some(lease_until)))
            .col_expr(Column::UpdatedAt, Expr::value(now_db))
            .filter(Column::ProviderId.eq(provider_id))
            .filter(Column::DeliveryId.eq(delivery_id))
            .filter(claimable)
            .exec(&*self.db)
            .await?;

        let record = self
            .find(provider_id, delivery_id)
            .await?
            .ok_or_else(|| ServiceError::internal("webhook delivery row vanished during claim"))?;
        let claimed = result.rows_affected == 1;
        if claimed {
            counter!("services_webhook_claims_total").increment(1);
        } else {
            counter!("services_webhook_dedupes_total").increment(1);
        }

        Ok(ClaimOutcome {
            record: to_record(record)?,
            claimed,
        })
    }

    async fn complete(&self, claim_id: &str, now: DateTime<Utc>) -> ServiceResult<()> {
        let result = WebhookDelivery::update_many()
            .col_expr(Column::Status, Expr::value(DeliveryStatus::Processed.as_str()))
            .col_expr(
                Column::NextAttemptAt,
                Expr::value(Option::<sea_orm::prelude::DateTimeWithTimeZone>::None),
            )
            .col_expr(Column::LastError, Expr::value(Option::<String>::None))
            .col_expr(Column::UpdatedAt, Expr::value(to_db_time(now)))
            .filter(Column::ClaimId.eq(claim_id))
            .exec(&*self.db)
            .await?;
        if result.rows_affected == 0 {
            return Err(ServiceError::not_found(format!(
                "webhook claim {} not found",
                claim_id
            )));
        }
        Ok(())
    }

    async fn fail(
        &self,
        claim_id: &str,
        error: &str,
        next_attempt_at: DateTime<Utc>,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> ServiceResult<DeliveryRecord> {
        let current = self.find_by_claim(claim_id).await?;
        let dead = u32::try_from(current.attempts).unwrap_or_default() >= max_attempts;
        let (status, next_attempt_at) = if dead {
            (DeliveryStatus::Dead, None)
        } else {
            (DeliveryStatus::RetryReady, Some(to_db_time(next_attempt_at)))
        };

        WebhookDelivery::update_many()
            .col_expr(Column::Status, Expr::value(status.as_str()))
            .col_expr(Column::NextAttemptAt, Expr::value(next_attempt_at))
            .col_expr(Column::LastError, Expr::value(Some(error.to_string())))
            .col_expr(Column::UpdatedAt, Expr::value(to_db_time(now)))
            .filter(Column::ClaimId.eq(claim_id))
            .exec(&*self.db)
            .await?;

        if dead {
            counter!("services_webhook_dead_total").increment(1);
            tracing::error!(
                provider_id = %current.provider_id,
                delivery_id = %current.delivery_id,
                attempts = current.attempts,
                "Webhook delivery exhausted its attempts"
            );
        }
        to_record(self.find_by_claim(claim_id).await?)
    }

    async fn get(
        &self,
        provider_id: &str,
        delivery_id: &str,
    ) -> ServiceResult<Option<DeliveryRecord>> {
        self.find(provider_id, delivery_id)
            .await?
            .map(to_record)
            .transpose()
    }

    async fn status_counts(&self) -> ServiceResult<BTreeMap<String, u64>> {
        let rows = WebhookDelivery::find()
            .select_only()
            .column(Column::Status)
            .column_as(Expr::col(Column::Id).count(), "count")
            .group_by(Column::Status)
            .into_model::<StatusCount>()
            .all(&*self.db)
            .await?;
        Ok(status_map(rows))
    }
}
