//! hublink - device client entry point

use clap::{Parser, Subcommand};
use hublink::commands::default_registry;
use hublink::config::HubConfig;
use hublink::connection::ReconnectCoordinator;
use hublink::error::{HubError, HubResult};
use hublink::observability::{init_default_logging, init_logging, LogFormat};
use hublink::transport::mqtt::MqttTransportFactory;
use hublink::twin::TwinSyncEngine;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};

/// Resilient IoT hub device client
#[derive(Parser)]
#[command(name = "hublink")]
#[command(about = "Keeps a device connected to its IoT hub")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and run telemetry and command loops until interrupted
    Run,
    /// Validate configuration
    Config {
        /// Show the configuration with secrets redacted
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let logging = match cli.verbose {
        0 => init_default_logging(),
        1 => init_logging(Level::DEBUG, LogFormat::Compact, false),
        _ => init_logging(Level::TRACE, LogFormat::Compact, true),
    };
    if let Err(e) = logging {
        eprintln!("Failed to initialize logging: {e}");
    }

    info!("Starting hublink v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e.sanitized(), "Failed to load configuration");
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_device(config).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!(error = %e.sanitized(), "Command failed");
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn load_configuration(explicit: Option<&std::path::Path>) -> HubResult<HubConfig> {
    let path = HubConfig::locate(explicit)?;
    info!("Loading configuration from: {}", path.display());
    Ok(HubConfig::load_from_file(&path)?)
}

async fn run_device(config: HubConfig) -> HubResult<()> {
    info!(device_id = %config.device.id, "Device client starting");

    let credentials = config.resolve_credentials()?;
    let cancel = CancellationToken::new();

    let coordinator = ReconnectCoordinator::builder(
        MqttTransportFactory::new(config.mqtt_settings()),
        credentials,
    )
    .settings(config.coordinator_settings())
    .twin(Arc::new(TwinSyncEngine::default()))
    .commands(default_registry(config.long_running_delay()))
    .cancellation_token(cancel.clone())
    .build();

    tokio::spawn(watch_for_shutdown(cancel.clone(), config.run_duration()));

    let summary = coordinator.run().await.map_err(HubError::from)?;
    info!(
        telemetry_sent = summary.telemetry_sent,
        commands_received = summary.commands.received,
        commands_acknowledged = summary.commands.acknowledged,
        final_state = %summary.final_state,
        desired_version = summary.desired_version,
        generations = summary.generations,
        "Run finished"
    );
    Ok(())
}

/// Cancel the run on SIGINT, SIGTERM or when the bounded run time elapses
async fn watch_for_shutdown(cancel: CancellationToken, run_duration: Option<Duration>) {
    let deadline = async {
        match run_duration {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        _ = cancel.cancelled() => return,
        _ = signal::ctrl_c() => info!("Received SIGINT, shutting down gracefully..."),
        _ = terminate() => info!("Received SIGTERM, shutting down gracefully..."),
        _ = deadline => info!("Run duration elapsed, shutting down..."),
    }
    cancel.cancel();
}

#[cfg(unix)]
async fn terminate() {
    match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            warn!(error = %e, "Failed to install SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}

fn handle_config_command(config: &HubConfig, show: bool) -> HubResult<()> {
    if show {
        println!("Current configuration:");
        println!("{}", config.to_redacted_toml()?);
    }

    info!(
        device_id = %config.device.id,
        credentials = config.connection.credentials.len(),
        "Configuration validation complete"
    );
    Ok(())
}
