//! Creates the webhook delivery claim ledger.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(ServiceWebhookDeliveries::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ServiceWebhookDeliveries::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(ServiceWebhookDeliveries::ProviderId)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ServiceWebhookDeliveries::DeliveryId)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ServiceWebhookDeliveries::Status)
                            .string()
                            .not_null()
                            .default("pending"),
                    )
                    .col(
                        ColumnDef::new(ServiceWebhookDeliveries::Attempts)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(ServiceWebhookDeliveries::ClaimId)
                            .string()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(ServiceWebhookDeliveries::NextAttemptAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(ServiceWebhookDeliveries::LastError)
                            .text()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(ServiceWebhookDeliveries::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(ServiceWebhookDeliveries::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_service_webhook_deliveries_provider_delivery")
                    .table(ServiceWebhookDeliveries::Table)
                    .col(ServiceWebhookDeliveries::ProviderId)
                    .col(ServiceWebhookDeliveries::DeliveryId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_service_webhook_deliveries_claim_id")
                    .table(ServiceWebhookDeliveries::Table)
                    .col(ServiceWebhookDeliveries::ClaimId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(
                Table::drop()
                    .table(ServiceWebhookDeliveries::Table)
                    .to_owned(),
            )
            .await
    }
}

#[derive(DeriveIden)]
enum ServiceWebhookDeliveries {
    Table,
    Id,
    ProviderId,
    DeliveryId,
    Status,
    Attempts,
    ClaimId,
    NextAttemptAt,
    LastError,
    CreatedAt,
    UpdatedAt,
}
