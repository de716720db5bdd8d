//! # Services Plane Main Entry Point
//!
//! `serve` runs the HTTP API with the background outbox loop, `migrate`
//! applies schema migrations and `dispatch-outbox` drains one outbox batch
//! for external schedulers.

use anyhow::Context;
use clap::{Parser, Subcommand};
use migration::{Migrator, MigratorTrait};
use services_plane::{
    config::{AppConfig, ConfigLoader},
    db,
    server::{AppStateBuilder, run_server},
    telemetry::init_tracing,
};

#[derive(Debug, Parser)]
#[command(name = "services-plane", version, about = "Provider services plane")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve the HTTP API (default)
    Serve {
        /// Apply pending migrations before accepting traffic
        #[arg(long)]
        migrate: bool,
    },
    /// Apply pending migrations and exit
    Migrate,
    /// Dispatch one batch of pending outbox events and exit
    DispatchOutbox,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = ConfigLoader::new()
        .load()
        .context("loading configuration")?;
    init_tracing(&config).context("initializing tracing")?;

    tracing::info!(profile = %config.profile, "Loaded configuration");
    if let Ok(redacted) = config.redacted_json() {
        tracing::debug!(config = %redacted, "Effective configuration");
    }

    match cli.command.unwrap_or(Command::Serve { migrate: false }) {
        Command::Serve { migrate } => {
            let db = db::init_pool(&config).await?;
            // An in-memory database starts empty every run.
            if migrate || config.database_url.contains(":memory:") {
                apply_migrations(&db).await?;
            }
            run_server(config, db).await
        }
        Command::Migrate => {
            let db = db::init_pool(&config).await?;
            apply_migrations(&db).await
        }
        Command::DispatchOutbox => dispatch_outbox(config).await,
    }
}

async fn apply_migrations(db: &sea_orm::DatabaseConnection) -> anyhow::Result<()> {
    Migrator::up(db, None)
        .await
        .context("applying migrations")?;
    tracing::info!("Migrations applied");
    Ok(())
}

async fn dispatch_outbox(config: AppConfig) -> anyhow::Result<()> {
    let db = db::init_pool(&config).await?;
    let state = AppStateBuilder::new(config, db).build()?;
    let report = state.dispatcher.dispatch_pending().await?;
    tracing::info!(
        claimed = report.claimed,
        delivered = report.delivered,
        failed = report.failed,
        dead = report.dead,
        "Outbox batch dispatched"
    );
    Ok(())
}
