//! Creates the versioned credential and grant snapshot tables.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(ServiceCredentials::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ServiceCredentials::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(ServiceCredentials::ConnectionId)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ServiceCredentials::Version)
                            .integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ServiceCredentials::EncryptedPayload)
                            .binary()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ServiceCredentials::TokenType)
                            .string()
                            .not_null()
                            .default("bearer"),
                    )
                    .col(
                        ColumnDef::new(ServiceCredentials::RequestedScopes)
                            .json_binary()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ServiceCredentials::GrantedScopes)
                            .json_binary()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ServiceCredentials::ExpiresAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(ServiceCredentials::Refreshable)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(ServiceCredentials::Status)
                            .string()
                            .not_null()
                            .default("active"),
                    )
                    .col(
                        ColumnDef::new(ServiceCredentials::EncryptionKeyId)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ServiceCredentials::EncryptionVersion)
                            .integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ServiceCredentials::RevokedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(ServiceCredentials::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(ServiceCredentials::UpdatedAt)
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
                    .name("idx_service_credentials_connection_version")
                    .table(ServiceCredentials::Table)
                    .col(ServiceCredentials::ConnectionId)
                    .col(ServiceCredentials::Version)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(ServiceGrantSnapshots::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ServiceGrantSnapshots::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(ServiceGrantSnapshots::ConnectionId)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ServiceGrantSnapshots::Version)
                            .integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ServiceGrantSnapshots::RequestedGrants)
                            .json_binary()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ServiceGrantSnapshots::GrantedGrants)
                            .json_binary()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ServiceGrantSnapshots::Metadata)
                            .json_binary()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ServiceGrantSnapshots::CapturedAt)
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
                    .name("idx_service_grant_snapshots_connection_version")
                    .table(ServiceGrantSnapshots::Table)
                    .col(ServiceGrantSnapshots::ConnectionId)
                    .col(ServiceGrantSnapshots::Version)
                    .unique()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(ServiceGrantSnapshots::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(ServiceCredentials::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum ServiceCredentials {
    Table,
    Id,
    ConnectionId,
    Version,
    EncryptedPayload,
    TokenType,
    RequestedScopes,
    GrantedScopes,
    ExpiresAt,
    Refreshable,
    Status,
    EncryptionKeyId,
    EncryptionVersion,
    RevokedAt,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum ServiceGrantSnapshots {
    Table,
    Id,
    ConnectionId,
    Version,
    RequestedGrants,
    GrantedGrants,
    Metadata,
    CapturedAt,
}
