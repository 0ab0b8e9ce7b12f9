//! cdcrepld - host process for the MariaDB to ColumnStore replicator
//!
//! # Usage
//!
//! ```bash
//! # Replicate, resuming from the stored checkpoint or source.gtid
//! cdcrepld -c cdcrepl.yaml
//!
//! # Start from an explicit GTID when no checkpoint exists yet
//! cdcrepld -c cdcrepl.yaml 0-3000-1
//!
//! # Validate configuration
//! cdcrepld -c cdcrepl.yaml validate
//! ```

use anyhow::{Context, Result};
use cdcrepl::{Gtid, Replicator, ReplicatorConfig};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LIVENESS_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Parser)]
#[command(name = "cdcrepld")]
#[command(version, about = "MariaDB binlog to ColumnStore replicator")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, default_value = "cdcrepl.yaml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Start position used when no checkpoint is stored (overrides source.gtid)
    gtid: Option<Gtid>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate configuration file
    Validate,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = ReplicatorConfig::from_file(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;
    if let Some(gtid) = cli.gtid {
        config.source.gtid = Some(gtid);
    }

    match cli.command {
        Some(Commands::Validate) => {
            validate_config(&config);
            Ok(ExitCode::SUCCESS)
        }
        None => run(config).await,
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

async fn run(config: ReplicatorConfig) -> Result<ExitCode> {
    info!(
        servers = config.source.servers.len(),
        server_id = config.source.server_id,
        state_dir = %config.state.dir.display(),
        "Starting cdcrepld"
    );

    let replicator = Replicator::start(&config)
        .await
        .context("Failed to start replicator")?;

    let mut liveness = tokio::time::interval(LIVENESS_INTERVAL);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Received shutdown signal (Ctrl+C)");
                replicator.stop().await;
                info!(position = ?replicator.position(), "Replicator stopped");
                return Ok(ExitCode::SUCCESS);
            }
            _ = liveness.tick() => {
                if !replicator.ok() {
                    let health = replicator.health();
                    error!(
                        position = ?health.position,
                        error = health.last_error.as_deref().unwrap_or("unknown"),
                        "Replicator is no longer running"
                    );
                    replicator.stop().await;
                    return Ok(ExitCode::FAILURE);
                }
            }
        }
    }
}

fn validate_config(config: &ReplicatorConfig) {
    println!("✓ Configuration valid!\n");

    println!("Source:");
    for server in &config.source.servers {
        println!("  - {}", server);
    }
    println!("  Replica id: {}", config.source.server_id);
    match &config.source.gtid {
        Some(gtid) => println!("  Start GTID: {}", gtid),
        None => println!("  Start GTID: (stored checkpoint only)"),
    }
    println!(
        "  Heartbeat: {}s (read timeout {}s)",
        config.source.heartbeat_period_secs,
        config.source.read_timeout().as_secs()
    );
    println!();

    println!("Sink:");
    println!("  Target: {}", config.sink.endpoint());
    println!("  Bulk metadata: {}", config.sink.bulk_metadata.display());
    if let Some(database) = &config.sink.database {
        println!("  Database override: {}", database);
    }
    println!();

    println!("State:");
    println!("  Directory: {}", config.state.dir.display());
    println!();

    let settings = &config.replicator;
    println!("Replicator:");
    if settings.retry.is_infinite() {
        println!("  Max retries: unbounded");
    } else {
        println!("  Max retries: {}", settings.retry.max_retries());
    }
    println!(
        "  Backoff: {}ms .. {}ms",
        settings.retry.retry_delay().as_millis(),
        settings.retry.max_delay().as_millis()
    );
    if !settings.include_tables.is_empty() {
        println!("  Include: {}", settings.include_tables.join(", "));
    }
    if !settings.exclude_tables.is_empty() {
        println!("  Exclude: {}", settings.exclude_tables.join(", "));
    }
}
