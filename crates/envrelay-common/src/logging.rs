//! ---
//! relay_section: "01-core-functionality"
//! relay_subsection: "module"
//! relay_type: "source"
//! relay_scope: "code"
//! relay_description: "Tracing bootstrap with per-service rolling log files."
//! relay_version: "v0.1.0"
//! relay_owner: "tbd"
//! ---
//! Every `envrelayd` subcommand is its own process, so each one logs under
//! `<logging.directory>/<service>/` and relays, stores and sensors sharing a
//! host never interleave in one file.
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggingConfig;

const LOG_ENV: &str = "ENVRELAY_LOG";
const DEFAULT_DIRECTIVE: &str = "info";
const FILE_SUFFIX: &str = "jsonl";

static GUARDS: OnceCell<(WorkerGuard, WorkerGuard)> = OnceCell::new();

/// Stdout log formats; the file layer is always JSON.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    StructuredJson,
    #[default]
    Pretty,
    /// One line per event, for fleets of simulated sensors.
    Compact,
}

/// Where a filter directive came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DirectiveSource {
    Envrelay,
    RustLog,
    Default,
}

fn resolve_directive(
    envrelay: Option<String>,
    rust_log: Option<String>,
) -> (String, DirectiveSource) {
    let non_empty = |value: Option<String>| value.filter(|v| !v.trim().is_empty());
    if let Some(directive) = non_empty(envrelay) {
        return (directive, DirectiveSource::Envrelay);
    }
    if let Some(directive) = non_empty(rust_log) {
        return (directive, DirectiveSource::RustLog);
    }
    (DEFAULT_DIRECTIVE.to_owned(), DirectiveSource::Default)
}

/// Directory holding one service's files.
pub fn service_log_dir(config: &LoggingConfig, service_name: &str) -> PathBuf {
    config.directory.join(service_name)
}

fn file_prefix(config: &LoggingConfig, service_name: &str) -> String {
    match &config.file_prefix {
        Some(prefix) => format!("{prefix}-{service_name}"),
        None => service_name.to_owned(),
    }
}

fn file_appender(config: &LoggingConfig, directory: &Path, service_name: &str) -> Result<RollingFileAppender> {
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(file_prefix(config, service_name))
        .filename_suffix(FILE_SUFFIX)
        .max_log_files(config.retain_days.max(1))
        .build(directory)
        .with_context(|| format!("unable to open log files under {}", directory.display()))
}

/// Install the global subscriber for `service_name`.
///
/// The filter comes from `ENVRELAY_LOG`, then `RUST_LOG`, then `info`. An
/// invalid directive falls back to `info` with a warning once logging is up.
/// Calling this twice in one process keeps the first subscriber.
pub fn init_tracing(service_name: &str, config: &LoggingConfig) -> Result<()> {
    let directory = service_log_dir(config, service_name);
    std::fs::create_dir_all(&directory)
        .with_context(|| format!("unable to create log directory {}", directory.display()))?;

    let (file_writer, file_guard) =
        tracing_appender::non_blocking(file_appender(config, &directory, service_name)?);
    let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());
    if GUARDS.set((file_guard, stdout_guard)).is_err() {
        return Ok(());
    }

    let (directive, source) = resolve_directive(
        std::env::var(LOG_ENV).ok(),
        std::env::var("RUST_LOG").ok(),
    );
    let (filter, rejected) = match EnvFilter::try_new(&directive) {
        Ok(filter) => (filter, None),
        Err(err) => (EnvFilter::new(DEFAULT_DIRECTIVE), Some(err)),
    };

    let stdout_layer = match config.format {
        LogFormat::StructuredJson => fmt::layer()
            .with_target(false)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .json()
            .with_writer(stdout_writer)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .with_writer(stdout_writer)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_target(false)
            .with_writer(stdout_writer)
            .boxed(),
    };
    let file_layer = fmt::layer()
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .json()
        .with_current_span(false)
        .with_writer(file_writer)
        .boxed();

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
        .ok();

    if let Some(err) = rejected {
        warn!(env = LOG_ENV, %directive, error = %err, "invalid log directive; using default filter");
    }
    info!(
        service = %service_name,
        log_dir = %directory.display(),
        format = ?config.format,
        filter_source = ?source,
        "tracing initialised"
    );
    Ok(())
}
