//! Presence and dispatch coordinator: tracks online devices and sends each a
//! command on a fixed period until interrupted

use clap::{Parser, Subcommand};
use iotlink::config::AppConfig;
use iotlink::coordinator::{coordinator_session, Coordinator};
use iotlink::observability::{init_default_logging, metrics};
use iotlink::sink::LoggingSink;
use iotlink::transport::mqtt::{MqttClient, ReconnectConfig};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::{
    signal,
    time::{sleep, Duration},
};
use tracing::{error, info};

/// Presence and dispatch coordinator
#[derive(Parser)]
#[command(name = "iot-server")]
#[command(about = "Tracks device presence and dispatches periodic commands")]
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
    /// Connect and run the coordinator until interrupted
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

    // .env is optional
    let _ = dotenvy::dotenv();
    init_default_logging();

    info!("Starting iot-server v{}", env!("CARGO_PKG_VERSION"));

    let config = match AppConfig::discover(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_coordinator(config).await,
        Commands::Config { show } => handle_config_command(config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Coordinator shutdown complete");
}

async fn run_coordinator(config: AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    let settings = config.coordinator.clone();
    info!("Coordinator starting with ID: {}", settings.id);

    let transport = MqttClient::new(
        coordinator_session(&settings.id),
        config.mqtt.clone(),
        ReconnectConfig::from(&config.reconnect),
    )?;
    let mut coordinator = Coordinator::new(
        settings,
        config.topics.clone(),
        transport,
        Arc::new(LoggingSink::new()),
    );

    coordinator.start().await?;

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    info!("Coordinator is running and tracking device presence");

    let mut fatal = false;
    tokio::select! {
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down gracefully...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down gracefully...");
        }
        _ = wait_for_permanent_disconnect(&coordinator) => {
            error!("MQTT connection permanently lost, shutting down coordinator...");
            fatal = true;
        }
    }

    match coordinator.online_devices().await {
        Ok(devices) => info!(online = ?devices, "Devices online at shutdown"),
        Err(e) => error!("Failed to query online devices: {}", e),
    }

    if let Err(e) = coordinator.shutdown().await {
        error!("Error during shutdown: {}", e);
        return Err(e.into());
    }

    let snapshot = metrics().get_metrics();
    info!(
        metrics = %serde_json::to_string(&snapshot).unwrap_or_default(),
        "Final metrics"
    );

    if fatal {
        return Err("MQTT connection permanently lost".into());
    }
    Ok(())
}

fn handle_config_command(config: AppConfig, show: bool) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(&config)?);
    }

    info!("Configuration validation complete");
    Ok(())
}

async fn wait_for_permanent_disconnect<T>(coordinator: &Coordinator<T>)
where
    T: iotlink::transport::Transport,
{
    loop {
        if coordinator.is_permanently_disconnected() {
            break;
        }
        sleep(Duration::from_millis(100)).await;
    }
}
