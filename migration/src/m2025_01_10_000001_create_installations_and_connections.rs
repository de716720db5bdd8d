//! Creates the installation and connection tables.
//!
//! An installation is the presence of a provider within a scope; connections
//! are credentialed links to external accounts under that `(provider, scope)`.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(ServiceInstallations::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ServiceInstallations::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(ServiceInstallations::ProviderId)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ServiceInstallations::ScopeType)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ServiceInstallations::ScopeId)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ServiceInstallations::InstallType)
                            .string()
                            .not_null()
                            .default("standard"),
                    )
                    .col(
                        ColumnDef::new(ServiceInstallations::Status)
                            .string()
                            .not_null()
                            .default("active"),
                    )
                    .col(
                        ColumnDef::new(ServiceInstallations::GrantedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(ServiceInstallations::RevokedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(ServiceInstallations::Metadata)
                            .json_binary()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ServiceInstallations::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(ServiceInstallations::UpdatedAt)
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
                    .name("idx_service_installations_provider_scope")
                    .table(ServiceInstallations::Table)
                    .col(ServiceInstallations::ProviderId)
                    .col(ServiceInstallations::ScopeType)
                    .col(ServiceInstallations::ScopeId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(ServiceConnections::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ServiceConnections::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(ServiceConnections::ProviderId)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ServiceConnections::ScopeType)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ServiceConnections::ScopeId)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ServiceConnections::ExternalAccountId)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ServiceConnections::Status)
                            .string()
                            .not_null()
                            .default("active"),
                    )
                    .col(ColumnDef::new(ServiceConnections::LastError).text().null())
                    .col(
                        ColumnDef::new(ServiceConnections::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(ServiceConnections::UpdatedAt)
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
                    .name("idx_service_connections_account")
                    .table(ServiceConnections::Table)
                    .col(ServiceConnections::ProviderId)
                    .col(ServiceConnections::ScopeType)
                    .col(ServiceConnections::ScopeId)
                    .col(ServiceConnections::ExternalAccountId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(ServiceConnections::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(ServiceInstallations::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum ServiceInstallations {
    Table,
    Id,
    ProviderId,
    ScopeType,
    ScopeId,
    InstallType,
    Status,
    GrantedAt,
    RevokedAt,
    Metadata,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum ServiceConnections {
    Table,
    Id,
    ProviderId,
    ScopeType,
    ScopeId,
    ExternalAccountId,
    Status,
    LastError,
    CreatedAt,
    UpdatedAt,
}
