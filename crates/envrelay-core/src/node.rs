//! ---
//! relay_section: "01-core-functionality"
//! relay_subsection: "module"
//! relay_type: "source"
//! relay_scope: "code"
//! relay_description: "Primary and backup relay lifecycle management."
//! relay_version: "v0.1.0"
//! relay_owner: "tbd"
//! ---
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use envrelay_common::{AppConfig, RelayRole};
use envrelay_metrics::{RelayMetrics, SharedRegistry};
use envrelay_msg::{IngestListener, RequestClient};
use envrelay_redundancy::{
    bind_heartbeat_listener, HeartbeatEmitter, HeartbeatMonitor, RelayActivation, RoleSnapshot,
};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::analyzer::QualityAnalyzer;
use crate::relay::{RelayRuntime, RelayStats};

/// A running relay loop together with the ingest listener feeding it.
pub struct ActiveRelay {
    listener: IngestListener,
    shutdown: broadcast::Sender<()>,
    task: JoinHandle<RelayStats>,
}

impl ActiveRelay {
    /// Bind the ingest listener and spawn the relay loop.
    ///
    /// Downstream clients connect lazily; only the bind can fail startup.
    pub async fn start(config: &AppConfig, metrics: Option<RelayMetrics>) -> Result<Self> {
        let (listener, queue) =
            IngestListener::bind(config.relay.ingest_listen, config.relay.queue_capacity)
                .await
                .with_context(|| {
                    format!("unable to bind ingest listener on {}", config.relay.ingest_listen)
                })?;
        let store =
            RequestClient::connect(config.store.endpoint, config.store.request_timeout_ms).await;
        let quality =
            RequestClient::connect(config.quality.endpoint, config.quality.request_timeout_ms)
                .await;

        let mut runtime = RelayRuntime::new(
            config.relay.name.clone(),
            Box::new(store),
            Box::new(quality),
            QualityAnalyzer::from_config(&config.quality),
        )
        .with_ingest_counters(listener.counters());
        if let Some(metrics) = metrics {
            runtime = runtime.with_metrics(metrics);
        }

        let (shutdown, shutdown_rx) = broadcast::channel(4);
        let task = tokio::spawn(runtime.run(queue, shutdown_rx));
        info!(relay = %config.relay.name, ingest = %listener.local_addr(), "relay accepting sensor traffic");
        Ok(Self {
            listener,
            shutdown,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    /// Stop the loop after its current message and release every socket.
    pub async fn stop(self) -> RelayStats {
        let _ = self.shutdown.send(());
        self.listener.shutdown().await;
        match self.task.await {
            Ok(stats) => stats,
            Err(err) => {
                error!(error = %err, "relay loop terminated abnormally");
                RelayStats::default()
            }
        }
    }
}

/// Starts the relay on promotion and tears it down on demotion.
pub struct BackupActivation {
    config: Arc<AppConfig>,
    metrics: Option<RelayMetrics>,
    active: Option<ActiveRelay>,
}

impl BackupActivation {
    pub fn new(config: Arc<AppConfig>, metrics: Option<RelayMetrics>) -> Self {
        Self {
            config,
            metrics,
            active: None,
        }
    }

    /// Ingest address while the backup relays traffic.
    pub fn relay_addr(&self) -> Option<SocketAddr> {
        self.active.as_ref().map(ActiveRelay::local_addr)
    }
}

#[async_trait]
impl RelayActivation for BackupActivation {
    async fn activate(&mut self) -> Result<()> {
        if self.active.is_some() {
            return Ok(());
        }
        let relay = ActiveRelay::start(&self.config, self.metrics.clone()).await?;
        self.active = Some(relay);
        if let Some(metrics) = &self.metrics {
            metrics.set_active(true);
            metrics.record_transition("promoted");
        }
        Ok(())
    }

    async fn deactivate(&mut self) {
        let Some(relay) = self.active.take() else {
            return;
        };
        let stats = relay.stop().await;
        info!(
            relay = %self.config.relay.name,
            processed = stats.processed,
            "backup relay stood down"
        );
        if let Some(metrics) = &self.metrics {
            metrics.set_active(false);
            metrics.record_transition("demoted");
        }
    }
}

/// Relay node in its configured role.
pub struct RelayNode {
    config: Arc<AppConfig>,
    metrics: Option<RelayMetrics>,
}

impl RelayNode {
    pub fn new(config: AppConfig, registry: Option<SharedRegistry>) -> Result<Self> {
        let metrics = match registry {
            Some(registry) => Some(RelayMetrics::new(registry, config.relay.name.clone())?),
            None => None,
        };
        Ok(Self {
            config: Arc::new(config),
            metrics,
        })
    }

    /// Start the tasks of the configured role and return a handle controlling them.
    pub async fn start(self) -> Result<NodeHandle> {
        self.config.heartbeat.validate_for(self.config.relay.role)?;
        let (shutdown, _) = broadcast::channel(16);
        match self.config.relay.role {
            RelayRole::Primary => self.start_primary(shutdown).await,
            RelayRole::Backup => self.start_backup(shutdown).await,
        }
    }

    async fn start_primary(self, shutdown: broadcast::Sender<()>) -> Result<NodeHandle> {
        let peer = self
            .config
            .heartbeat
            .peer
            .ok_or_else(|| anyhow!("primary relay requires heartbeat.peer"))?;
        let relay = ActiveRelay::start(&self.config, self.metrics.clone()).await?;
        let ingest_addr = relay.local_addr();
        if let Some(metrics) = &self.metrics {
            metrics.set_active(true);
        }

        let mut tasks = Vec::new();
        let mut relay_shutdown = shutdown.subscribe();
        let name = self.config.relay.name.clone();
        tasks.push(tokio::spawn(async move {
            let _ = relay_shutdown.recv().await;
            let stats = relay.stop().await;
            info!(
                relay = %name,
                processed = stats.processed,
                forwarded = stats.forwarded,
                failed = stats.failed,
                "primary relay stopped"
            );
        }));

        let emitter = HeartbeatEmitter::new(
            self.config.relay.name.clone(),
            peer,
            self.config.heartbeat.interval_ms,
        );
        let emitter_shutdown = shutdown.subscribe();
        tasks.push(tokio::spawn(async move {
            let sent = emitter.run(emitter_shutdown).await;
            info!(heartbeats = sent, "heartbeat emitter stopped");
        }));

        Ok(NodeHandle {
            role: RelayRole::Primary,
            shutdown,
            tasks,
            roles: None,
            ingest_addr: Some(ingest_addr),
            heartbeat_addr: None,
        })
    }

    async fn start_backup(self, shutdown: broadcast::Sender<()>) -> Result<NodeHandle> {
        let listen = self
            .config
            .heartbeat
            .listen
            .ok_or_else(|| anyhow!("backup relay requires heartbeat.listen"))?;
        let (listener, heartbeats) = bind_heartbeat_listener(listen)
            .await
            .with_context(|| format!("unable to bind heartbeat listener on {listen}"))?;
        let heartbeat_addr = listener.local_addr();
        if let Some(metrics) = &self.metrics {
            metrics.set_active(false);
        }

        let activation = BackupActivation::new(Arc::clone(&self.config), self.metrics.clone());
        let monitor = HeartbeatMonitor::new(
            self.config.relay.name.clone(),
            self.config.heartbeat.interval_ms,
            self.config.heartbeat.missed_threshold,
            activation,
        );
        let roles = monitor.subscribe();
        let monitor_shutdown = shutdown.subscribe();
        let task = tokio::spawn(async move {
            match monitor.run(heartbeats, monitor_shutdown).await {
                Ok(snapshot) => info!(state = %snapshot.state, "heartbeat monitor finished"),
                Err(err) => error!(error = %err, "heartbeat monitor failed"),
            }
            listener.shutdown().await;
        });

        Ok(NodeHandle {
            role: RelayRole::Backup,
            shutdown,
            tasks: vec![task],
            roles: Some(roles),
            ingest_addr: None,
            heartbeat_addr: Some(heartbeat_addr),
        })
    }
}

/// Lifecycle handle of a started relay node.
#[derive(Debug)]
pub struct NodeHandle {
    role: RelayRole,
    shutdown: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
    roles: Option<watch::Receiver<RoleSnapshot>>,
    ingest_addr: Option<SocketAddr>,
    heartbeat_addr: Option<SocketAddr>,
}

impl NodeHandle {
    pub fn role(&self) -> RelayRole {
        self.role
    }

    /// Ingest address of a primary; backups bind theirs only on promotion.
    pub fn ingest_addr(&self) -> Option<SocketAddr> {
        self.ingest_addr
    }

    pub fn heartbeat_addr(&self) -> Option<SocketAddr> {
        self.heartbeat_addr
    }

    /// Failover snapshots published by a backup's monitor.
    pub fn role_updates(&self) -> Option<watch::Receiver<RoleSnapshot>> {
        self.roles.clone()
    }

    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown.send(());
        for task in self.tasks {
            task.await.context("relay node task panicked")?;
        }
        Ok(())
    }
}
