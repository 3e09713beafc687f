//! ---
//! relay_section: "01-core-functionality"
//! relay_subsection: "binary"
//! relay_type: "source"
//! relay_scope: "code"
//! relay_description: "Binary entrypoint for the envrelay daemon."
//! relay_version: "v0.1.0"
//! relay_owner: "tbd"
//! ---
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use envrelay_common::{init_tracing, AppConfig, RelayRole};
use envrelay_core::{start_quality, start_store, RelayNode};
use envrelay_metrics::{new_registry, spawn_http_server, MetricsServer, SharedRegistry};
use envrelay_msg::{PushSender, SensorType};
use envrelay_sim::{SensorFleet, SensorProfile};
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{info, warn};

const DEFAULT_CONFIG: &str = "configs/envrelay.toml";

#[derive(Debug, Parser)]
#[command(author, version, about = "envrelay edge/fog/cloud telemetry daemon", long_about = None)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Run a fog relay node (primary or backup)")]
    Relay {
        #[arg(long, help = "Override relay.role")]
        role: Option<RelayRole>,
        #[arg(long, help = "Override relay.name")]
        name: Option<String>,
    },
    #[command(about = "Run the central store")]
    Store {
        #[arg(
            long,
            num_args = 0..=1,
            default_missing_value = "true",
            default_value_t = false,
            action = clap::ArgAction::Set,
            help = "Drop and recreate the store before serving"
        )]
        reset: bool,
    },
    #[command(about = "Run the quality controller")]
    Quality,
    #[command(about = "Run simulated sensors of one type")]
    Sensor {
        #[arg(long, help = "Temperature, Humidity or Smoke")]
        sensor_type: SensorType,
        #[arg(long, default_value_t = 1, help = "Number of sensor workers")]
        workers: usize,
        #[arg(
            long = "profile",
            value_name = "FILE",
            help = "Sensor profile per worker; defaults to configs/sensors/<type>.json"
        )]
        profiles: Vec<PathBuf>,
        #[arg(long, help = "Seed for reproducible sampling")]
        seed: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from(DEFAULT_CONFIG));

    let loaded = AppConfig::load_with_source(&candidates)?;
    let mut config = loaded.config;

    match cli.command {
        Commands::Relay { role, name } => {
            if let Some(role) = role {
                config.relay.role = role;
            }
            if let Some(name) = name {
                config.relay.name = name;
            }
            init_tracing("envrelayd-relay", &config.logging)?;
            info!(config_path = %loaded.source.display(), "configuration loaded");
            run_relay(config).await
        }
        Commands::Store { reset } => {
            init_tracing("envrelayd-store", &config.logging)?;
            info!(config_path = %loaded.source.display(), "configuration loaded");
            run_store(config, reset).await
        }
        Commands::Quality => {
            init_tracing("envrelayd-quality", &config.logging)?;
            info!(config_path = %loaded.source.display(), "configuration loaded");
            run_quality(config).await
        }
        Commands::Sensor {
            sensor_type,
            workers,
            profiles,
            seed,
        } => {
            init_tracing("envrelayd-sensor", &config.logging)?;
            info!(config_path = %loaded.source.display(), "configuration loaded");
            run_sensors(config, sensor_type, workers, profiles, seed).await
        }
    }
}

fn start_metrics(config: &AppConfig) -> Result<(Option<SharedRegistry>, Option<MetricsServer>)> {
    if !config.metrics.enabled {
        info!("metrics exporter disabled by configuration");
        return Ok((None, None));
    }
    let registry = new_registry();
    let server = spawn_http_server(registry.clone(), config.metrics.listen)?;
    info!(address = %server.addr(), "metrics exporter enabled");
    Ok((Some(registry), Some(server)))
}

async fn stop_metrics(server: Option<MetricsServer>) -> Result<()> {
    if let Some(server) = server {
        server.shutdown().await?;
    }
    Ok(())
}

async fn wait_for_ctrl_c() -> Result<()> {
    signal::ctrl_c()
        .await
        .context("unable to listen for ctrl-c")?;
    info!("ctrl-c received; shutting down");
    Ok(())
}

async fn run_relay(config: AppConfig) -> Result<()> {
    let (registry, metrics_server) = start_metrics(&config)?;
    let role = config.relay.role;
    let handle = RelayNode::new(config, registry)?.start().await?;
    info!(?role, ingest = ?handle.ingest_addr(), heartbeat = ?handle.heartbeat_addr(), "relay running; waiting for termination signal");
    wait_for_ctrl_c().await?;
    handle.shutdown().await?;
    stop_metrics(metrics_server).await
}

async fn run_store(config: AppConfig, reset: bool) -> Result<()> {
    let (registry, metrics_server) = start_metrics(&config)?;
    let handle = start_store(&config, reset, registry).await?;
    wait_for_ctrl_c().await?;
    handle.shutdown().await?;
    stop_metrics(metrics_server).await
}

async fn run_quality(config: AppConfig) -> Result<()> {
    let (registry, metrics_server) = start_metrics(&config)?;
    let handle = start_quality(&config, registry).await?;
    wait_for_ctrl_c().await?;
    handle.shutdown().await?;
    stop_metrics(metrics_server).await
}

async fn run_sensors(
    config: AppConfig,
    sensor: SensorType,
    workers: usize,
    mut profile_paths: Vec<PathBuf>,
    seed: Option<u64>,
) -> Result<()> {
    if profile_paths.is_empty() {
        let fallback = PathBuf::from(format!(
            "configs/sensors/{}.json",
            sensor.to_string().to_lowercase()
        ));
        warn!(profile = %fallback.display(), "no profile given; using default");
        profile_paths.push(fallback);
    }
    let profiles = profile_paths
        .iter()
        .map(|path| SensorProfile::from_path(sensor, path))
        .collect::<Result<Vec<_>>>()?;
    let mut fleet = SensorFleet::new(sensor, profiles, workers)?;
    if let Some(seed) = seed {
        fleet = fleet.with_seed(seed);
    }

    let sender = PushSender::new(
        config.sensor.relay_endpoints.clone(),
        config.sensor.connect_timeout_ms,
    );
    let (shutdown_tx, shutdown_rx) = broadcast::channel(4);
    let task = tokio::spawn(fleet.run(sender, config.sensor.queue_capacity, shutdown_rx));
    info!(sensor = %sensor, workers, relays = ?config.sensor.relay_endpoints, "sensors running; waiting for termination signal");
    wait_for_ctrl_c().await?;
    let _ = shutdown_tx.send(());
    let stats = task.await.context("sensor fleet task panicked")?;
    info!(
        readings = stats.readings,
        alerts = stats.alerts,
        dropped = stats.dropped,
        "sensors stopped"
    );
    Ok(())
}
