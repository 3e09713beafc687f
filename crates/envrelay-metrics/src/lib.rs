//! ---
//! relay_section: "03-persistence-logging"
//! relay_subsection: "module"
//! relay_type: "source"
//! relay_scope: "code"
//! relay_description: "Metrics collection and export utilities."
//! relay_version: "v0.1.0"
//! relay_owner: "tbd"
//! ---
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::http::{header, HeaderValue, StatusCode};
use axum::routing::get;
use axum::{response::IntoResponse, Router};
use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Shared registry type used across services.
pub type SharedRegistry = Arc<Registry>;

/// Produce a new shared registry.
pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Spawn an HTTP server that exposes the registry at `/metrics`.
pub fn spawn_http_server(registry: SharedRegistry, addr: SocketAddr) -> Result<MetricsServer> {
    let app = Router::new().route(
        "/metrics",
        get({
            let registry = registry.clone();
            move || metrics_handler(registry.clone())
        }),
    );

    let std_listener = StdTcpListener::bind(addr)
        .with_context(|| format!("failed to bind metrics listener {}", addr))?;
    std_listener
        .set_nonblocking(true)
        .with_context(|| "failed to configure metrics listener as non-blocking")?;
    let addr = std_listener
        .local_addr()
        .with_context(|| "failed to resolve metrics listener address")?;
    let listener = TcpListener::from_std(std_listener)
        .with_context(|| "failed to convert std listener into tokio listener")?;

    info!(address = %addr, "metrics server starting");

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let service = app.into_make_service();
    let handle: JoinHandle<Result<()>> = tokio::spawn(async move {
        axum::serve(listener, service)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .context("metrics server encountered an error")?;
        Ok(())
    });

    Ok(MetricsServer {
        addr,
        shutdown: Some(shutdown_tx),
        task: handle,
    })
}

/// Prometheus scrape endpoint.
async fn metrics_handler(registry: SharedRegistry) -> impl IntoResponse {
    let families = registry.gather();
    let encoder = TextEncoder::new();
    match encoder.encode_to_string(&families) {
        Ok(body) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                HeaderValue::from_static(prometheus::TEXT_FORMAT),
            )],
            body,
        ),
        Err(err) => {
            error!(error = %err, "failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"))],
                String::from("metrics encoding error"),
            )
        }
    }
}

/// Handle to the running HTTP exporter.
#[derive(Debug)]
pub struct MetricsServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl MetricsServer {
    /// Return the bound address for convenience.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signal shutdown and await task completion.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err),
            Err(join_err) => Err(anyhow::Error::new(join_err)),
        }
    }
}

/// Metrics recorded by a relay node, whichever role it currently plays.
#[derive(Clone, Debug)]
pub struct RelayMetrics {
    registry: SharedRegistry,
    relay: String,
    messages_received: IntCounterVec,
    messages_forwarded: IntCounterVec,
    forward_failures: IntCounterVec,
    ingest_frames: IntGaugeVec,
    alerts_raised: IntCounterVec,
    relay_active: IntGaugeVec,
    role_transitions: IntCounterVec,
    forward_latency: Histogram,
}

impl RelayMetrics {
    pub fn new(registry: SharedRegistry, relay: impl Into<String>) -> Result<Self> {
        let messages_received = IntCounterVec::new(
            Opts::new(
                "envrelay_messages_received_total",
                "Messages taken off the ingest queue by message type",
            ),
            &["relay", "kind"],
        )?;
        registry.register(Box::new(messages_received.clone()))?;

        let messages_forwarded = IntCounterVec::new(
            Opts::new(
                "envrelay_messages_forwarded_total",
                "Messages acknowledged by a downstream tier",
            ),
            &["relay", "target"],
        )?;
        registry.register(Box::new(messages_forwarded.clone()))?;

        let forward_failures = IntCounterVec::new(
            Opts::new(
                "envrelay_forward_failures_total",
                "Forwards that timed out or failed at the transport level",
            ),
            &["relay", "target"],
        )?;
        registry.register(Box::new(forward_failures.clone()))?;

        let ingest_frames = IntGaugeVec::new(
            Opts::new(
                "envrelay_ingest_frames",
                "Ingest listener frame counts by outcome since the relay loop started",
            ),
            &["relay", "outcome"],
        )?;
        registry.register(Box::new(ingest_frames.clone()))?;

        let alerts_raised = IntCounterVec::new(
            Opts::new(
                "envrelay_alerts_raised_total",
                "Out-of-range alerts raised by the quality analyzer",
            ),
            &["relay", "sensor"],
        )?;
        registry.register(Box::new(alerts_raised.clone()))?;

        let relay_active = IntGaugeVec::new(
            Opts::new(
                "envrelay_relay_active",
                "Indicator (0/1) whether this node currently accepts sensor traffic",
            ),
            &["relay"],
        )?;
        registry.register(Box::new(relay_active.clone()))?;

        let role_transitions = IntCounterVec::new(
            Opts::new(
                "envrelay_role_transitions_total",
                "Backup promotions and demotions",
            ),
            &["relay", "transition"],
        )?;
        registry.register(Box::new(role_transitions.clone()))?;

        let buckets = prometheus::exponential_buckets(0.0005, 2.0, 16)
            .context("failed to construct histogram buckets")?;
        let forward_latency = Histogram::with_opts(
            HistogramOpts::new(
                "envrelay_forward_latency_seconds",
                "Round trip of a store forward including its acknowledgment",
            )
            .buckets(buckets),
        )?;
        registry.register(Box::new(forward_latency.clone()))?;

        Ok(Self {
            registry,
            relay: relay.into(),
            messages_received,
            messages_forwarded,
            forward_failures,
            ingest_frames,
            alerts_raised,
            relay_active,
            role_transitions,
            forward_latency,
        })
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn record_received(&self, kind: &str) {
        self.messages_received
            .with_label_values(&[self.relay.as_str(), kind])
            .inc();
    }

    pub fn record_forwarded(&self, target: &str, latency: Duration) {
        self.messages_forwarded
            .with_label_values(&[self.relay.as_str(), target])
            .inc();
        self.forward_latency.observe(latency.as_secs_f64());
    }

    pub fn record_failure(&self, target: &str) {
        self.forward_failures
            .with_label_values(&[self.relay.as_str(), target])
            .inc();
    }

    /// Mirror the ingest listener counters.
    pub fn set_ingest_frames(&self, received: u64, dropped: u64, malformed: u64) {
        for (outcome, value) in [
            ("received", received),
            ("dropped", dropped),
            ("malformed", malformed),
        ] {
            self.ingest_frames
                .with_label_values(&[self.relay.as_str(), outcome])
                .set(i64::try_from(value).unwrap_or(i64::MAX));
        }
    }

    pub fn record_alert(&self, sensor: &str) {
        self.alerts_raised
            .with_label_values(&[self.relay.as_str(), sensor])
            .inc();
    }

    pub fn set_active(&self, active: bool) {
        self.relay_active
            .with_label_values(&[self.relay.as_str()])
            .set(if active { 1 } else { 0 });
    }

    pub fn record_transition(&self, transition: &str) {
        self.role_transitions
            .with_label_values(&[self.relay.as_str(), transition])
            .inc();
    }
}

/// Metrics recorded by the central store service.
#[derive(Clone, Debug)]
pub struct StoreMetrics {
    registry: SharedRegistry,
    stored: IntCounterVec,
    store_failures: IntCounter,
    alerts_relayed: IntCounter,
    reports_sent: IntCounter,
}

impl StoreMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let stored = IntCounterVec::new(
            Opts::new(
                "envrelay_store_records_total",
                "Records persisted by collection",
            ),
            &["collection"],
        )?;
        registry.register(Box::new(stored.clone()))?;

        let store_failures = IntCounter::with_opts(Opts::new(
            "envrelay_store_failures_total",
            "Inserts or queries that failed in the backing store",
        ))?;
        registry.register(Box::new(store_failures.clone()))?;

        let alerts_relayed = IntCounter::with_opts(Opts::new(
            "envrelay_store_alerts_relayed_total",
            "Edge alerts relayed to the quality controller",
        ))?;
        registry.register(Box::new(alerts_relayed.clone()))?;

        let reports_sent = IntCounter::with_opts(Opts::new(
            "envrelay_store_reports_sent_total",
            "Periodic reports acknowledged by the quality controller",
        ))?;
        registry.register(Box::new(reports_sent.clone()))?;

        Ok(Self {
            registry,
            stored,
            store_failures,
            alerts_relayed,
            reports_sent,
        })
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn record_stored(&self, collection: &str) {
        self.stored.with_label_values(&[collection]).inc();
    }

    pub fn record_failure(&self) {
        self.store_failures.inc();
    }

    pub fn record_relayed_alert(&self) {
        self.alerts_relayed.inc();
    }

    pub fn record_report(&self) {
        self.reports_sent.inc();
    }
}

/// Metrics recorded by the quality controller.
#[derive(Clone, Debug)]
pub struct QualityMetrics {
    registry: SharedRegistry,
    alerts_received: IntCounterVec,
}

impl QualityMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let alerts_received = IntCounterVec::new(
            Opts::new(
                "envrelay_quality_alerts_total",
                "Alerts acknowledged by the quality controller by status and layer",
            ),
            &["status", "layer"],
        )?;
        registry.register(Box::new(alerts_received.clone()))?;
        Ok(Self {
            registry,
            alerts_received,
        })
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn record_alert(&self, status: &str, layer: &str) {
        self.alerts_received
            .with_label_values(&[status, layer])
            .inc();
    }
}

pub use prometheus;
