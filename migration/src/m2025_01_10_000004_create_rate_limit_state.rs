//! Creates the provider rate-limit state table.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(ServiceRateLimitState::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ServiceRateLimitState::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(ServiceRateLimitState::ProviderId)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ServiceRateLimitState::ScopeType)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ServiceRateLimitState::ScopeId)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ServiceRateLimitState::BucketKey)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ServiceRateLimitState::Limit)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(ServiceRateLimitState::Remaining)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(ServiceRateLimitState::ResetAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(ServiceRateLimitState::RetryAfter)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(ServiceRateLimitState::Metadata)
                            .json_binary()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ServiceRateLimitState::UpdatedAt)
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
                    .name("idx_service_rate_limit_state_bucket")
                    .table(ServiceRateLimitState::Table)
                    .col(ServiceRateLimitState::ProviderId)
                    .col(ServiceRateLimitState::ScopeType)
                    .col(ServiceRateLimitState::ScopeId)
                    .col(ServiceRateLimitState::BucketKey)
                    .unique()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(ServiceRateLimitState::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum ServiceRateLimitState {
    Table,
    Id,
    ProviderId,
    ScopeType,
    ScopeId,
    BucketKey,
    Limit,
    Remaining,
    ResetAt,
    RetryAfter,
    Metadata,
    UpdatedAt,
}
