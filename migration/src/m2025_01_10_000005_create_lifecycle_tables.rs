//! Creates the activity, lifecycle outbox and notification dispatch ledger tables.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(ServiceActivityEntries::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ServiceActivityEntries::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(ServiceActivityEntries::ProviderId)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ServiceActivityEntries::ScopeType)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ServiceActivityEntries::ScopeId)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ServiceActivityEntries::ConnectionId)
                            .string()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(ServiceActivityEntries::Channel)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ServiceActivityEntries::Action)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ServiceActivityEntries::ObjectType)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ServiceActivityEntries::ObjectId)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ServiceActivityEntries::Actor)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ServiceActivityEntries::ActorType)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ServiceActivityEntries::Status)
                            .string()
                            .not_null()
                            .default("ok"),
                    )
                    .col(
                        ColumnDef::new(ServiceActivityEntries::Metadata)
                            .json_binary()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ServiceActivityEntries::CreatedAt)
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
                    .name("idx_service_activity_entries_created_at")
                    .table(ServiceActivityEntries::Table)
                    .col(ServiceActivityEntries::CreatedAt)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(ServiceLifecycleOutbox::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ServiceLifecycleOutbox::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(ServiceLifecycleOutbox::EventId)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ServiceLifecycleOutbox::EventName)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ServiceLifecycleOutbox::ProviderId)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ServiceLifecycleOutbox::ScopeType)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ServiceLifecycleOutbox::ScopeId)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ServiceLifecycleOutbox::ConnectionId)
                            .string()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(ServiceLifecycleOutbox::Payload)
                            .json_binary()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ServiceLifecycleOutbox::Metadata)
                            .json_binary()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ServiceLifecycleOutbox::Status)
                            .string()
                            .not_null()
                            .default("pending"),
                    )
                    .col(
                        ColumnDef::new(ServiceLifecycleOutbox::Attempts)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(ServiceLifecycleOutbox::NextAttemptAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(ServiceLifecycleOutbox::LastError)
                            .text()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(ServiceLifecycleOutbox::OccurredAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ServiceLifecycleOutbox::UpdatedAt)
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
                    .name("idx_service_lifecycle_outbox_dispatch")
                    .table(ServiceLifecycleOutbox::Table)
                    .col(ServiceLifecycleOutbox::Status)
                    .col(ServiceLifecycleOutbox::NextAttemptAt)
                    .col(ServiceLifecycleOutbox::OccurredAt)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(ServiceNotificationDispatches::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ServiceNotificationDispatches::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(ServiceNotificationDispatches::IdempotencyKey)
                            .string()
                            .not_null()
                            .unique_key(),
                    )
                    .col(
                        ColumnDef::new(ServiceNotificationDispatches::EventId)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ServiceNotificationDispatches::Projector)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ServiceNotificationDispatches::DefinitionCode)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ServiceNotificationDispatches::RecipientKey)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ServiceNotificationDispatches::Status)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ServiceNotificationDispatches::Error)
                            .text()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(ServiceNotificationDispatches::Metadata)
                            .json_binary()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ServiceNotificationDispatches::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(
                Table::drop()
                    .table(ServiceNotificationDispatches::Table)
                    .to_owned(),
            )
            .await?;
        manager
            .drop_table(Table::drop().table(ServiceLifecycleOutbox::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(ServiceActivityEntries::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum ServiceActivityEntries {
    Table,
    Id,
    ProviderId,
    ScopeType,
    ScopeId,
    ConnectionId,
    Channel,
    Action,
    ObjectType,
    ObjectId,
    Actor,
    ActorType,
    Status,
    Metadata,
    CreatedAt,
}

#[derive(DeriveIden)]
enum ServiceLifecycleOutbox {
    Table,
    Id,
    EventId,
    EventName,
    ProviderId,
    ScopeType,
    ScopeId,
    ConnectionId,
    Payload,
    Metadata,
    Status,
    Attempts,
    NextAttemptAt,
    LastError,
    OccurredAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum ServiceNotificationDispatches {
    Table,
    Id,
    IdempotencyKey,
    EventId,
    Projector,
    DefinitionCode,
    RecipientKey,
    Status,
    Error,
    Metadata,
    CreatedAt,
}
