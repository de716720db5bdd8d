//! Creates subscription, sync cursor and sync job tables.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(ServiceSubscriptions::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ServiceSubscriptions::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(ServiceSubscriptions::ConnectionId)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ServiceSubscriptions::ProviderId)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ServiceSubscriptions::ResourceType)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ServiceSubscriptions::ResourceId)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ServiceSubscriptions::ChannelId)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ServiceSubscriptions::RemoteSubscriptionId)
                            .string()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(ServiceSubscriptions::CallbackUrl)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ServiceSubscriptions::Status)
                            .string()
                            .not_null()
                            .default("active"),
                    )
                    .col(
                        ColumnDef::new(ServiceSubscriptions::ExpiresAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(ServiceSubscriptions::LastNotifiedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(ServiceSubscriptions::Metadata)
                            .json_binary()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ServiceSubscriptions::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(ServiceSubscriptions::UpdatedAt)
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
                    .name("idx_service_subscriptions_connection")
                    .table(ServiceSubscriptions::Table)
                    .col(ServiceSubscriptions::ConnectionId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(ServiceSyncCursors::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ServiceSyncCursors::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(ServiceSyncCursors::ConnectionId)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ServiceSyncCursors::ResourceType)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ServiceSyncCursors::ResourceId)
                            .string()
                            .not_null(),
                    )
                    .col(ColumnDef::new(ServiceSyncCursors::Cursor).text().null())
                    .col(
                        ColumnDef::new(ServiceSyncCursors::Status)
                            .string()
                            .not_null()
                            .default("idle"),
                    )
                    .col(
                        ColumnDef::new(ServiceSyncCursors::LastSyncedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(ServiceSyncCursors::Metadata)
                            .json_binary()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ServiceSyncCursors::UpdatedAt)
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
                    .name("idx_service_sync_cursors_resource")
                    .table(ServiceSyncCursors::Table)
                    .col(ServiceSyncCursors::ConnectionId)
                    .col(ServiceSyncCursors::ResourceType)
                    .col(ServiceSyncCursors::ResourceId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(ServiceSyncJobs::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ServiceSyncJobs::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(ServiceSyncJobs::ConnectionId)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ServiceSyncJobs::ProviderId)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ServiceSyncJobs::ResourceType)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ServiceSyncJobs::ResourceId)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ServiceSyncJobs::Mode)
                            .string()
                            .not_null()
                            .default("incremental"),
                    )
                    .col(ColumnDef::new(ServiceSyncJobs::Checkpoint).text().null())
                    .col(
                        ColumnDef::new(ServiceSyncJobs::Status)
                            .string()
                            .not_null()
                            .default("pending"),
                    )
                    .col(
                        ColumnDef::new(ServiceSyncJobs::Attempts)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(ServiceSyncJobs::NextAttemptAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(ColumnDef::new(ServiceSyncJobs::LastError).text().null())
                    .col(
                        ColumnDef::new(ServiceSyncJobs::Metadata)
                            .json_binary()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ServiceSyncJobs::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(ServiceSyncJobs::UpdatedAt)
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
                    .name("idx_service_sync_jobs_resource")
                    .table(ServiceSyncJobs::Table)
                    .col(ServiceSyncJobs::ConnectionId)
                    .col(ServiceSyncJobs::ResourceType)
                    .col(ServiceSyncJobs::ResourceId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(ServiceSyncJobs::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(ServiceSyncCursors::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(ServiceSubscriptions::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum ServiceSubscriptions {
    Table,
    Id,
    ConnectionId,
    ProviderId,
    ResourceType,
    ResourceId,
    ChannelId,
    RemoteSubscriptionId,
    CallbackUrl,
    Status,
    ExpiresAt,
    LastNotifiedAt,
    Metadata,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum ServiceSyncCursors {
    Table,
    Id,
    ConnectionId,
    ResourceType,
    ResourceId,
    Cursor,
    Status,
    LastSyncedAt,
    Metadata,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum ServiceSyncJobs {
    Table,
    Id,
    ConnectionId,
    ProviderId,
    ResourceType,
    ResourceId,
    Mode,
    Checkpoint,
    Status,
    Attempts,
    NextAttemptAt,
    LastError,
    Metadata,
    CreatedAt,
    UpdatedAt,
}
