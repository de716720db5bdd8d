//! Database migrations for the services plane.
//!
//! This module contains all database migrations using SeaORM Migration.

pub use sea_orm_migration::prelude::*;

mod m2025_01_10_000001_create_installations_and_connections;
mod m2025_01_10_000002_create_credentials_and_grants;
mod m2025_01_10_000003_create_subscriptions_and_sync;
mod m2025_01_10_000004_create_rate_limit_state;
mod m2025_01_10_000005_create_lifecycle_tables;
mod m2025_01_10_000006_create_webhook_deliveries;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m2025_01_10_000001_create_installations_and_connections::Migration),
            Box::new(m2025_01_10_000002_create_credentials_and_grants::Migration),
            Box::new(m2025_01_10_000003_create_subscriptions_and_sync::Migration),
            Box::new(m2025_01_10_000004_create_rate_limit_state::Migration),
            Box::new(m2025_01_10_000005_create_lifecycle_tables::Migration),
            Box::new(m2025_01_10_000006_create_webhook_deliveries::Migration),
        ]
    }
}
