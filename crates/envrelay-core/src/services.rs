//! ---
//! relay_section: "01-core-functionality"
//! relay_subsection: "module"
//! relay_type: "source"
//! relay_scope: "code"
//! relay_description: "Store and quality controller service lifecycles."
//! relay_version: "v0.1.0"
//! relay_owner: "tbd"
//! ---
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use envrelay_common::AppConfig;
use envrelay_metrics::{QualityMetrics, SharedRegistry, StoreMetrics};
use envrelay_msg::{ReplyServer, RequestClient};
use envrelay_store::{CentralStore, JsonlStore, ReportTask, StoreService};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::info;

use crate::quality::QualityController;

/// Lifecycle handle of a request/reply service.
pub struct ServiceHandle {
    name: &'static str,
    server: ReplyServer,
    shutdown: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl ServiceHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    /// Stop background tasks, then close the listener and its connections.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown.send(());
        for task in self.tasks {
            task.await
                .with_context(|| format!("{} background task panicked", self.name))?;
        }
        self.server.shutdown().await;
        info!(service = self.name, "service stopped");
        Ok(())
    }
}

/// Open the JSON-lines store, optionally wipe it, and serve relay requests.
///
/// A reporting task pushes traffic totals to the quality controller on its
/// own connection, so reports never wait behind relayed alerts.
pub async fn start_store(
    config: &AppConfig,
    reset: bool,
    registry: Option<SharedRegistry>,
) -> Result<ServiceHandle> {
    let store = JsonlStore::open_with_tail(&config.store.directory, config.store.history_limit)
        .with_context(|| {
            format!("unable to open store at {}", config.store.directory.display())
        })?;
    if reset {
        store.drop_all().context("unable to reset store")?;
        info!(directory = %config.store.directory.display(), "store reset before serving");
    }
    let store: Arc<dyn CentralStore> = Arc::new(store);
    let metrics = registry.map(StoreMetrics::new).transpose()?;

    let alert_relay = RequestClient::new(config.quality.endpoint, config.quality.request_timeout_ms);
    let service = match &metrics {
        Some(metrics) => StoreService::with_metrics(
            Arc::clone(&store),
            Box::new(alert_relay),
            config.store.history_limit,
            metrics.clone(),
        ),
        None => StoreService::new(
            Arc::clone(&store),
            Box::new(alert_relay),
            config.store.history_limit,
        ),
    };
    let counters = service.counters();
    let server = ReplyServer::bind(config.store.listen, Arc::new(service))
        .await
        .with_context(|| format!("unable to bind store on {}", config.store.listen))?;

    let reporter_client =
        RequestClient::new(config.quality.endpoint, config.quality.request_timeout_ms);
    let mut reporter = ReportTask::new(
        store,
        counters,
        Box::new(reporter_client),
        config.store.report_interval_ms,
    );
    if let Some(metrics) = metrics {
        reporter = reporter.with_metrics(metrics);
    }
    let (shutdown, shutdown_rx) = broadcast::channel(4);
    let task = tokio::spawn(async move {
        let delivered = reporter.run(shutdown_rx).await;
        info!(reports = delivered, "report task stopped");
    });

    info!(listen = %server.local_addr(), quality = %config.quality.endpoint, "store serving");
    Ok(ServiceHandle {
        name: "store",
        server,
        shutdown,
        tasks: vec![task],
    })
}

/// Serve the quality controller endpoint.
pub async fn start_quality(
    config: &AppConfig,
    registry: Option<SharedRegistry>,
) -> Result<ServiceHandle> {
    let mut controller = QualityController::new();
    if let Some(registry) = registry {
        controller = controller.with_metrics(QualityMetrics::new(registry)?);
    }
    let server = ReplyServer::bind(config.quality.listen, Arc::new(controller))
        .await
        .with_context(|| format!("unable to bind quality controller on {}", config.quality.listen))?;
    info!(listen = %server.local_addr(), "quality controller serving");
    let (shutdown, _) = broadcast::channel(1);
    Ok(ServiceHandle {
        name: "quality",
        server,
        shutdown,
        tasks: Vec::new(),
    })
}
