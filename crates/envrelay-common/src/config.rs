//! ---
//! relay_section: "01-core-functionality"
//! relay_subsection: "module"
//! relay_type: "source"
//! relay_scope: "code"
//! relay_description: "Shared primitives and utilities for the relay runtime."
//! relay_version: "v0.1.0"
//! relay_owner: "tbd"
//! ---
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use tracing::debug;

use crate::logging::LogFormat;

fn default_relay_name() -> String {
    "fog-relay".to_owned()
}

fn default_ingest_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 5555))
}

fn default_queue_capacity() -> usize {
    256
}

fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_missed_threshold() -> u32 {
    5
}

fn default_store_endpoint() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 5581))
}

fn default_store_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 5581))
}

fn default_store_directory() -> PathBuf {
    PathBuf::from("target/store")
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_report_interval() -> Duration {
    Duration::from_secs(20)
}

fn default_history_limit() -> usize {
    10
}

fn default_quality_endpoint() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 5580))
}

fn default_quality_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 5580))
}

fn default_window() -> usize {
    10
}

fn default_sensor_endpoints() -> Vec<SocketAddr> {
    vec![SocketAddr::from(([127, 0, 0, 1], 5555))]
}

fn default_sensor_queue() -> usize {
    64
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::Pretty
}

fn default_log_retention() -> usize {
    7
}

fn default_metrics_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9898))
}

/// Top-level configuration document shared by every envrelay service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub quality: QualityConfig,
    #[serde(default)]
    pub sensor: SensorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: PathBuf,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &str = "ENVRELAY_CONFIG";

    /// Load configuration from disk, respecting the `ENVRELAY_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = toml::from_str::<AppConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.relay.validate()?;
        self.heartbeat.validate()?;
        self.quality.validate()?;
        if self.store.history_limit == 0 {
            return Err(anyhow!("store.history_limit must be at least 1"));
        }
        if self.sensor.relay_endpoints.is_empty() {
            return Err(anyhow!("sensor.relay_endpoints must list at least one relay"));
        }
        Ok(())
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Which side of the primary/backup pair a relay node plays.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum RelayRole {
    #[default]
    Primary,
    Backup,
}

impl std::str::FromStr for RelayRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "primary" => Ok(RelayRole::Primary),
            "backup" => Ok(RelayRole::Backup),
            other => Err(format!("unknown relay role: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_relay_name")]
    pub name: String,
    #[serde(default)]
    pub role: RelayRole,
    #[serde(default = "default_ingest_listen")]
    pub ingest_listen: SocketAddr,
    /// Bounded ingest queue; sensor frames beyond this are dropped and counted.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            name: default_relay_name(),
            role: RelayRole::Primary,
            ingest_listen: default_ingest_listen(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl RelayConfig {
    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(anyhow!("relay.queue_capacity must be at least 1"));
        }
        if self.name.trim().is_empty() {
            return Err(anyhow!("relay.name must not be empty"));
        }
        Ok(())
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    #[serde(default = "default_heartbeat_interval")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub interval_ms: Duration,
    /// Consecutive silent ticks before the backup takes over.
    #[serde(default = "default_missed_threshold")]
    pub missed_threshold: u32,
    /// Address the backup binds for incoming heartbeats.
    #[serde(default)]
    pub listen: Option<SocketAddr>,
    /// Address of the backup that the primary pushes heartbeats to.
    #[serde(default)]
    pub peer: Option<SocketAddr>,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval(),
            missed_threshold: default_missed_threshold(),
            listen: None,
            peer: None,
        }
    }
}

impl HeartbeatConfig {
    pub fn validate(&self) -> Result<()> {
        if self.missed_threshold == 0 {
            return Err(anyhow!("heartbeat.missed_threshold must be at least 1"));
        }
        if self.interval_ms.is_zero() {
            return Err(anyhow!("heartbeat.interval_ms must be positive"));
        }
        Ok(())
    }

    /// Role specific checks, applied when a relay node starts.
    pub fn validate_for(&self, role: RelayRole) -> Result<()> {
        self.validate()?;
        match role {
            RelayRole::Backup if self.listen.is_none() => Err(anyhow!(
                "backup relays require heartbeat.listen to receive heartbeats"
            )),
            RelayRole::Primary if self.peer.is_none() => Err(anyhow!(
                "primary relays require heartbeat.peer to publish heartbeats"
            )),
            _ => Ok(()),
        }
    }

    /// Silence after which the backup promotes itself.
    pub fn detection_latency(&self) -> Duration {
        self.interval_ms.saturating_mul(self.missed_threshold)
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Address relays connect to.
    #[serde(default = "default_store_endpoint")]
    pub endpoint: SocketAddr,
    /// Address the store service binds.
    #[serde(default = "default_store_listen")]
    pub listen: SocketAddr,
    #[serde(default = "default_store_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_request_timeout")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub request_timeout_ms: Duration,
    #[serde(default = "default_report_interval")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub report_interval_ms: Duration,
    /// Number of readings returned for a `request` message.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            endpoint: default_store_endpoint(),
            listen: default_store_listen(),
            directory: default_store_directory(),
            request_timeout_ms: default_request_timeout(),
            report_interval_ms: default_report_interval(),
            history_limit: default_history_limit(),
        }
    }
}

/// Inclusive acceptance band and averaging window for one sensor type.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThresholdConfig {
    pub min: f64,
    pub max: f64,
    #[serde(default = "default_window")]
    pub window: usize,
}

impl ThresholdConfig {
    pub const fn new(min: f64, max: f64, window: usize) -> Self {
        Self { min, max, window }
    }

    pub fn contains(&self, value: f64) -> bool {
        self.min <= value && value <= self.max
    }

    fn validate(&self, sensor: &str) -> Result<()> {
        if self.min.is_nan() || self.max.is_nan() || self.min > self.max {
            return Err(anyhow!(
                "quality.{} min ({}) must not exceed max ({})",
                sensor,
                self.min,
                self.max
            ));
        }
        if self.window == 0 {
            return Err(anyhow!("quality.{}.window must be at least 1", sensor));
        }
        Ok(())
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityConfig {
    #[serde(default = "default_quality_endpoint")]
    pub endpoint: SocketAddr,
    #[serde(default = "default_quality_listen")]
    pub listen: SocketAddr,
    #[serde(default = "default_request_timeout")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub request_timeout_ms: Duration,
    #[serde(default = "QualityConfig::default_temperature")]
    pub temperature: ThresholdConfig,
    #[serde(default = "QualityConfig::default_humidity")]
    pub humidity: ThresholdConfig,
}

impl QualityConfig {
    fn default_temperature() -> ThresholdConfig {
        ThresholdConfig::new(11.0, 29.4, default_window())
    }

    fn default_humidity() -> ThresholdConfig {
        ThresholdConfig::new(70.0, 100.0, default_window())
    }

    pub fn validate(&self) -> Result<()> {
        self.temperature.validate("temperature")?;
        self.humidity.validate("humidity")?;
        Ok(())
    }
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            endpoint: default_quality_endpoint(),
            listen: default_quality_listen(),
            request_timeout_ms: default_request_timeout(),
            temperature: Self::default_temperature(),
            humidity: Self::default_humidity(),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorConfig {
    /// Relays in preference order; the first one accepting a connection wins.
    #[serde(default = "default_sensor_endpoints")]
    pub relay_endpoints: Vec<SocketAddr>,
    #[serde(default = "default_sensor_queue")]
    pub queue_capacity: usize,
    #[serde(default = "default_request_timeout")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub connect_timeout_ms: Duration,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            relay_endpoints: default_sensor_endpoints(),
            queue_capacity: default_sensor_queue(),
            connect_timeout_ms: default_request_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
    /// Daily files kept per service; older ones are pruned on rotation.
    #[serde(default = "default_log_retention")]
    pub retain_days: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
            retain_days: default_log_retention(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: default_metrics_listen(),
        }
    }
}
