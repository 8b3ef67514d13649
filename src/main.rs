//! nodebeat: telemetry ingestion and liveness tracking for game-server fleets.
//!
//! With no subcommand the daemon runs until ctrl-c or SIGTERM. The
//! maintenance subcommands work on the registry directly and exit without
//! starting the HTTP surface.

use anyhow::Result;
use clap::{Parser, Subcommand};
use nodebeat::config::Config;
use nodebeat::daemon::Daemon;
use nodebeat::enrich::A2sProber;
use nodebeat::maintenance::{self, MaintenanceTask};
use nodebeat::registry::Registry;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "nodebeat")]
#[command(about = "Telemetry ingestion and liveness tracking for game-server fleets")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "nodebeat.toml")]
    config: PathBuf,

    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Delete nodes that never answered a live query
    PruneEmpty {
        /// Only touch one application ("any" matches all)
        #[arg(long)]
        app: Option<String>,
    },

    /// Re-probe nodes without live-query data; delete the unreachable
    CheckInactive {
        /// Only touch one application ("any" matches all)
        #[arg(long)]
        app: Option<String>,
    },

    /// Re-probe every node; delete the unreachable, refresh the rest
    CheckAll {
        /// Only touch one application ("any" matches all)
        #[arg(long)]
        app: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let log_level = match cli.verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // A partial or absent file is fine; every field has a default.
    let config = if cli.config.exists() {
        Config::load(&cli.config)?
    } else {
        info!(path = %cli.config.display(), "Config file not found, using defaults");
        Config::default()
    };

    match cli.command {
        None => run_daemon(config).await,
        Some(Commands::PruneEmpty { app }) => {
            run_maintenance(config, MaintenanceTask::PruneEmpty, app).await
        }
        Some(Commands::CheckInactive { app }) => {
            run_maintenance(config, MaintenanceTask::CheckInactive, app).await
        }
        Some(Commands::CheckAll { app }) => {
            run_maintenance(config, MaintenanceTask::CheckAll, app).await
        }
    }
}

async fn run_daemon(config: Config) -> Result<()> {
    let daemon = Daemon::start(config).await?;
    daemon.run().await
}

async fn run_maintenance(
    config: Config,
    task: MaintenanceTask,
    app: Option<String>,
) -> Result<()> {
    let registry = Arc::new(Registry::open(&config.storage.database_path).await?);
    let prober = Arc::new(A2sProber::new(
        config.query.timeout(),
        config.query.buffer_size,
    ));

    let report = maintenance::run_task(
        task,
        maintenance::app_filter(app.as_deref()),
        registry.clone(),
        prober,
    )
    .await?;

    registry.close().await;

    info!(
        processed = report.processed,
        deleted = report.deleted,
        updated = report.updated,
        "Maintenance finished"
    );
    Ok(())
}
