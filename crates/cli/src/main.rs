mod commands;

use algo_pipeline_core::{config_loader::DEFAULT_CONFIG_PATH, ConfigLoader};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use commands::StageKind;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "algo-pipeline")]
#[command(about = "Kraken candle pipeline: aggregation, indicators, signals and paper orders", long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Commands {
    /// Stream candles from Kraken, store them and publish closed ones
    Aggregate,
    /// Compute indicators for closed candles
    Analyze,
    /// Evaluate strategies against enriched candles
    Evaluate,
    /// Turn signals into paper orders
    Coordinate,
    /// Run every stage in this process
    RunAll {
        /// Use the in-process bus and stores instead of Postgres
        #[arg(long)]
        in_memory: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = ConfigLoader::load_from(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config))?;

    let shutdown = Arc::new(watch::channel(false).0);
    listen_for_shutdown(Arc::clone(&shutdown))?;

    let kind = match cli.command {
        Commands::Aggregate => StageKind::Aggregate,
        Commands::Analyze => StageKind::Analyze,
        Commands::Evaluate => StageKind::Evaluate,
        Commands::Coordinate => StageKind::Coordinate,
        Commands::RunAll { in_memory } => {
            tracing::info!(in_memory, config = %cli.config, "Starting all pipeline stages");
            return commands::run_all(&config, in_memory, shutdown).await;
        }
    };

    tracing::info!(stage = kind.name(), config = %cli.config, "Starting pipeline stage");
    commands::run_stage(kind, &config, shutdown.subscribe()).await
}

/// Flips the shutdown flag on SIGTERM or SIGINT. Stages finish their
/// current step before stopping.
fn listen_for_shutdown(shutdown: Arc<watch::Sender<bool>>) -> Result<()> {
    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => tracing::info!("Received SIGTERM, initiating graceful shutdown"),
            _ = sigint.recv() => tracing::info!("Received SIGINT, initiating graceful shutdown"),
        }
        shutdown.send_replace(true);
    });

    Ok(())
}
