//! Tracklink daemon entry point
//!
//! Runs the tracking service as a standalone process: one broker session,
//! telemetry persisted into the in-memory store, shutdown on SIGINT/SIGTERM
//! or when the session gives up reconnecting.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracklink::config::TrackerConfig;
use tracklink::observability::{init_default_logging, init_logging, LogFormat};
use tracklink::service::TrackerService;
use tracklink::store::MemoryStore;
use tracklink::transport::mqtt::ConnectionState;

/// MQTT command and telemetry core for fleet device tracking
#[derive(Parser)]
#[command(name = "tracklink")]
#[command(about = "MQTT command and telemetry core for fleet device tracking")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the tracking service
    Run,
    /// Validate configuration
    Config {
        /// Show the effective configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.verbose {
        0 => init_default_logging(),
        1 => init_logging(tracing::Level::DEBUG, LogFormat::Pretty, false),
        _ => init_logging(tracing::Level::TRACE, LogFormat::Pretty, true),
    }

    info!("Starting tracklink v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_service(config).await,
        Commands::Config { show } => handle_config_command(config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<TrackerConfig, Box<dyn std::error::Error>> {
    match config_path {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            Ok(TrackerConfig::load_from_file(path)?)
        }
        None => {
            let default_paths = ["tracker.toml", "config/tracker.toml"];

            for path_str in default_paths {
                let path = PathBuf::from(path_str);
                if path.exists() {
                    info!("Loading configuration from: {}", path.display());
                    return Ok(TrackerConfig::load_from_file(&path)?);
                }
            }

            warn!("No configuration file found, using built-in defaults (public broker)");
            Ok(TrackerConfig::default())
        }
    }
}

async fn run_service(config: TrackerConfig) -> Result<(), Box<dyn std::error::Error>> {
    let store = Arc::new(MemoryStore::new());
    let mut service = TrackerService::new(config, store)?;

    info!("Service starting with client ID: {}", service.client_id());
    service.start().await?;

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    info!("Service is running, tracking devices over MQTT...");

    tokio::select! {
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down gracefully...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down gracefully...");
        }
        reason = monitor_failed_session(service.watch_connection_state()) => {
            error!("Broker session permanently lost ({}), shutting down...", reason);
        }
    }

    info!("Application shutdown initiated");
    service.shutdown().await;
    Ok(())
}

/// Resolve once the session enters the terminal failed state
async fn monitor_failed_session(mut state_rx: watch::Receiver<ConnectionState>) -> String {
    loop {
        if let ConnectionState::Failed(reason) = &*state_rx.borrow() {
            return reason.clone();
        }
        if state_rx.changed().await.is_err() {
            return "state channel closed".to_string();
        }
    }
}

fn handle_config_command(
    config: TrackerConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(&config)?);
    }

    info!("Configuration validation complete");
    Ok(())
}
