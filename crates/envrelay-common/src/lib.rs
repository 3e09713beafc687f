//! ---
//! relay_section: "01-core-functionality"
//! relay_subsection: "module"
//! relay_type: "source"
//! relay_scope: "code"
//! relay_description: "Shared primitives and utilities for the relay runtime."
//! relay_version: "v0.1.0"
//! relay_owner: "tbd"
//! ---
//! Shared primitives for the envrelay workspace.
//! This crate exposes configuration loading, logging bootstrap, and the
//! small time helpers consumed by the relay, store, and simulator crates.

pub mod config;
pub mod logging;
pub mod time;

pub use config::{
    AppConfig, HeartbeatConfig, LoadedAppConfig, LoggingConfig, MetricsConfig, QualityConfig,
    RelayConfig, RelayRole, SensorConfig, StoreConfig, ThresholdConfig,
};
pub use logging::{init_tracing, service_log_dir, LogFormat};
