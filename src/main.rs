//! IoT Platform server - Main Entry Point
//!
//! Serves the device registry over HTTP and ingests device messages from MQTT.
//! A broker that cannot be reached at startup leaves the server running
//! without messaging.

use clap::{Parser, Subcommand};
use iot_platform::api::{self, ApiState};
use iot_platform::config::{DEFAULT_CONFIG_PATHS, PlatformConfig};
use iot_platform::ingest::register_device_handlers;
use iot_platform::observability::init_default_logging;
use iot_platform::storage::{DeviceRepository, InMemoryRepository, run_retention_sweep};
use iot_platform::transport::mqtt::{ConnectionHandle, ConnectionState, MqttClient};
use iot_platform::{PlatformError, PlatformResult};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

/// IoT device registry with MQTT telemetry ingestion
#[derive(Parser)]
#[command(name = "iot-platform")]
#[command(about = "IoT device registry backend with MQTT telemetry ingestion")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP server and MQTT ingestion
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

    init_default_logging();

    info!("Starting IoT Platform v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(cli.config.as_ref()) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_platform(config).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!(error = %e, "Command failed");
        process::exit(1);
    }

    info!("Application shutdown complete");
}

/// Explicit path, then the default locations, then defaults plus environment
fn load_configuration(config_path: Option<&PathBuf>) -> PlatformResult<PlatformConfig> {
    if let Some(path) = config_path {
        info!(path = %path.display(), "Loading configuration");
        return Ok(PlatformConfig::load_from_file(path)?);
    }

    for path_str in DEFAULT_CONFIG_PATHS {
        let path = PathBuf::from(path_str);
        if path.exists() {
            info!(path = %path.display(), "Loading configuration");
            return Ok(PlatformConfig::load_from_file(&path)?);
        }
    }

    info!("No configuration file found, using defaults and environment");
    Ok(PlatformConfig::from_env()?)
}

async fn run_platform(config: PlatformConfig) -> PlatformResult<()> {
    let addr: SocketAddr = config
        .server_addr()
        .parse()
        .map_err(|e| PlatformError::server(format!("invalid server address: {e}")))?;

    let repository: Arc<dyn DeviceRepository> = Arc::new(InMemoryRepository::new());

    let retention = config.storage.telemetry_retention().map(|period| {
        tokio::spawn(run_retention_sweep(
            Arc::clone(&repository),
            period,
            config.storage.retention_sweep_interval(),
        ))
    });

    let client = Arc::new(MqttClient::with_dispatch(
        config.mqtt.clone(),
        &config.dispatch,
    )?);

    let connection = match client.connect().await {
        Ok(()) => {
            info!(broker = %config.mqtt.broker_url, "Connected to MQTT broker");
            if let Err(e) = register_device_handlers(client.as_ref(), Arc::clone(&repository)).await
            {
                warn!(error = %e, "Failed to subscribe to device topics");
            }
            client.handle()
        }
        Err(e) => {
            warn!(error = %e, "Failed to connect to MQTT broker, serving without messaging");
            client.disconnect().await?;
            ConnectionHandle::fixed(ConnectionState::Disconnected)
        }
    };

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(api::serve(
        ApiState::new(Arc::clone(&repository), connection),
        addr,
        async move {
            let _ = shutdown_rx.await;
        },
    ));

    wait_for_shutdown_signal().await?;

    info!("Shutting down IoT Platform");
    if let Some(sweep) = retention {
        sweep.abort();
    }
    if let Err(e) = client.disconnect().await {
        error!(error = %e, "Error disconnecting MQTT client");
    } else {
        info!("MQTT client disconnected");
    }

    let _ = shutdown_tx.send(());
    match server.await {
        Ok(result) => result,
        Err(e) => Err(PlatformError::internal(format!("HTTP server task failed: {e}"))),
    }
}

async fn wait_for_shutdown_signal() -> PlatformResult<()> {
    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .map_err(|e| PlatformError::internal(format!("failed to install SIGINT handler: {e}")))?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .map_err(|e| PlatformError::internal(format!("failed to install SIGTERM handler: {e}")))?;

    info!("IoT Platform is running");

    tokio::select! {
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down gracefully...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down gracefully...");
        }
    }
    Ok(())
}

fn handle_config_command(config: &PlatformConfig, show: bool) -> PlatformResult<()> {
    if show {
        let rendered = toml::to_string_pretty(config)
            .map_err(|e| PlatformError::internal(format!("failed to render configuration: {e}")))?;
        println!("Effective configuration:");
        println!("{rendered}");
    }

    info!("Configuration validation complete");
    Ok(())
}
