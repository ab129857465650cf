//! Simulated IoT device: announces presence, publishes telemetry and answers
//! commands until interrupted or the broker connection is lost for good

use clap::{Parser, Subcommand};
use iotlink::config::AppConfig;
use iotlink::device::{device_session, DeviceAgent};
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

/// Simulated IoT device
#[derive(Parser)]
#[command(name = "iot-device")]
#[command(about = "Simulated IoT device publishing telemetry and answering commands")]
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
    /// Connect and run the device until interrupted
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

    info!("Starting iot-device v{}", env!("CARGO_PKG_VERSION"));

    let config = match AppConfig::discover(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_device(config).await,
        Commands::Config { show } => handle_config_command(config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Device shutdown complete");
}

async fn run_device(config: AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    let settings = config.device()?.clone();
    info!("Device starting with ID: {}", settings.id);

    let transport = MqttClient::new(
        device_session(&settings.id, &config.topics),
        config.mqtt.clone(),
        ReconnectConfig::from(&config.reconnect),
    )?;
    let mut agent = DeviceAgent::new(
        settings,
        config.topics.clone(),
        transport,
        Arc::new(LoggingSink::new()),
    );

    agent.start().await?;

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    info!("Device is running");

    let mut fatal = false;
    tokio::select! {
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down gracefully...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down gracefully...");
        }
        _ = wait_for_permanent_disconnect(&agent) => {
            error!("MQTT connection permanently lost, shutting down device...");
            fatal = true;
        }
    }

    if let Err(e) = agent.shutdown().await {
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
    config.device()?;
    if show {
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(&config)?);
    }

    info!("Configuration validation complete");
    Ok(())
}

async fn wait_for_permanent_disconnect<T>(agent: &DeviceAgent<T>)
where
    T: iotlink::transport::Transport,
{
    loop {
        if agent.is_permanently_disconnected() {
            break;
        }
        sleep(Duration::from_millis(100)).await;
    }
}
