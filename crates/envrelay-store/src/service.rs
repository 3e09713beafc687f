//! ---
//! relay_section: "03-persistence-logging"
//! relay_subsection: "module"
//! relay_type: "source"
//! relay_scope: "code"
//! relay_description: "Persistence abstractions and storage bindings."
//! relay_version: "v0.1.0"
//! relay_owner: "tbd"
//! ---
use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use envrelay_metrics::StoreMetrics;
use envrelay_msg::{
    Ack, Alert, Inbound, Layer, Message, QualityReport, Readings, ReadingsRequest, Reply,
    RequestChannel, RequestHandler,
};
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task;
use tracing::{debug, error, info, warn};

use crate::collection::{CentralStore, Collection};

/// Edge alerts waiting for the quality controller.
const EDGE_RELAY_QUEUE: usize = 64;

#[derive(Debug, Default, Clone, Copy)]
struct Totals {
    messages: u64,
    bytes: u64,
}

/// Message and byte totals accumulated by the store service.
///
/// Both totals change under one lock, so every read sees a consistent pair.
#[derive(Debug, Default)]
pub struct StoreCounters {
    totals: Mutex<Totals>,
}

impl StoreCounters {
    /// Count `weight` messages of `frame_bytes` each.
    pub fn record(&self, weight: u64, frame_bytes: usize) {
        let bytes = (frame_bytes as u64).saturating_mul(weight);
        let mut totals = self.totals.lock();
        totals.messages = totals.messages.saturating_add(weight);
        totals.bytes = totals.bytes.saturating_add(bytes);
    }

    /// Messages and bytes counted so far, read together.
    pub fn snapshot(&self) -> (u64, u64) {
        let totals = *self.totals.lock();
        (totals.messages, totals.bytes)
    }

    /// Messages counted so far.
    pub fn message_count(&self) -> u64 {
        self.snapshot().0
    }

    /// Bytes counted so far.
    pub fn byte_volume(&self) -> u64 {
        self.snapshot().1
    }

    /// Build a report from the current totals.
    pub fn report(&self, alerts_by_layer: BTreeMap<Layer, u64>) -> QualityReport {
        let (message_count, byte_volume) = self.snapshot();
        QualityReport {
            message_count,
            byte_volume,
            alerts_by_layer,
        }
    }
}

/// Request handler of the central store.
///
/// Files each message in its collection, answers reading queries, and relays
/// edge alerts to the quality controller. Fog alerts are only stored: the
/// relay that raised them already delivered them to the controller.
///
/// Edge alerts are acknowledged once stored and delivered by a background
/// worker, so a slow controller never delays the relay's acknowledgment.
pub struct StoreService {
    store: Arc<dyn CentralStore>,
    edge_alerts: mpsc::Sender<Alert>,
    history_limit: usize,
    counters: Arc<StoreCounters>,
    metrics: Option<StoreMetrics>,
}

impl StoreService {
    /// Create the service over a backend and a quality controller channel.
    ///
    /// Spawns the edge alert worker, so it must run inside a tokio runtime.
    pub fn new(
        store: Arc<dyn CentralStore>,
        quality: Box<dyn RequestChannel>,
        history_limit: usize,
    ) -> Self {
        Self::build(store, quality, history_limit, None)
    }

    /// Create the service recording store metrics into `metrics`.
    pub fn with_metrics(
        store: Arc<dyn CentralStore>,
        quality: Box<dyn RequestChannel>,
        history_limit: usize,
        metrics: StoreMetrics,
    ) -> Self {
        Self::build(store, quality, history_limit, Some(metrics))
    }

    fn build(
        store: Arc<dyn CentralStore>,
        quality: Box<dyn RequestChannel>,
        history_limit: usize,
        metrics: Option<StoreMetrics>,
    ) -> Self {
        let (edge_alerts, queue) = mpsc::channel(EDGE_RELAY_QUEUE);
        tokio::spawn(relay_edge_alerts(quality, queue, metrics.clone()));
        Self {
            store,
            edge_alerts,
            history_limit: history_limit.max(1),
            counters: Arc::new(StoreCounters::default()),
            metrics,
        }
    }

    /// Shared totals, read by the reporting task.
    pub fn counters(&self) -> Arc<StoreCounters> {
        Arc::clone(&self.counters)
    }

    async fn persist(&self, message: Message) -> Ack {
        let collection = match Collection::for_message(&message) {
            Ok(collection) => collection,
            Err(err) => {
                warn!(error = %err, "refusing to store message");
                return Ack::rejected();
            }
        };
        let store = Arc::clone(&self.store);
        let result = task::spawn_blocking(move || store.insert(collection, message)).await;
        match result {
            Ok(Ok(record)) => {
                info!(%collection, sequence = record.sequence, "message stored");
                if let Some(metrics) = &self.metrics {
                    metrics.record_stored(&collection.to_string());
                }
                Ack::received()
            }
            Ok(Err(err)) => {
                error!(%collection, error = %err, "failed to store message");
                self.record_failure();
                Ack::failed()
            }
            Err(err) => {
                error!(%collection, error = %err, "store insert task failed");
                self.record_failure();
                Ack::failed()
            }
        }
    }

    async fn readings(&self, request: ReadingsRequest) -> Readings {
        let collection = Collection::for_sensor(request.sensor_type);
        let store = Arc::clone(&self.store);
        let limit = self.history_limit;
        match task::spawn_blocking(move || store.query_last(collection, limit)).await {
            Ok(Ok(records)) => Readings { records },
            Ok(Err(err)) => {
                error!(%collection, error = %err, "failed to query readings");
                self.record_failure();
                Readings::default()
            }
            Err(err) => {
                error!(%collection, error = %err, "store query task failed");
                self.record_failure();
                Readings::default()
            }
        }
    }

    fn record_failure(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.record_failure();
        }
    }

    fn queue_edge_alert(&self, alert: Alert) {
        match self.edge_alerts.try_send(alert) {
            Ok(()) => debug!("edge alert queued for quality controller"),
            Err(TrySendError::Full(_)) => {
                warn!("edge alert queue full; alert not relayed");
            }
            Err(TrySendError::Closed(_)) => {
                error!("edge alert worker stopped; alert not relayed");
            }
        }
    }
}

/// Deliver queued edge alerts one at a time until the service is dropped.
async fn relay_edge_alerts(
    mut quality: Box<dyn RequestChannel>,
    mut queue: mpsc::Receiver<Alert>,
    metrics: Option<StoreMetrics>,
) {
    let endpoint = quality.endpoint();
    while let Some(alert) = queue.recv().await {
        match quality.expect_ack(&Message::Alert(alert)).await {
            Ok(ack) => {
                info!(%endpoint, status = %ack.status, "edge alert relayed to quality controller");
                if let Some(metrics) = &metrics {
                    metrics.record_relayed_alert();
                }
            }
            Err(err) => warn!(error = %err, "edge alert not acknowledged by quality controller"),
        }
    }
    debug!(%endpoint, "edge alert worker stopped");
}

#[async_trait]
impl RequestHandler for StoreService {
    async fn handle(&self, inbound: Inbound) -> Reply {
        let Inbound {
            message,
            frame_bytes,
            peer,
        } = inbound;
        match message {
            Message::Alert(alert) => {
                // Stored and relayed, so an alert weighs twice.
                self.counters.record(2, frame_bytes);
                info!(%peer, layer = %alert.layer, status = ?alert.status, "alert received");
                let relay = (alert.layer == Layer::Edge).then(|| alert.clone());
                let ack = self.persist(Message::Alert(alert)).await;
                if let Some(alert) = relay {
                    self.queue_edge_alert(alert);
                }
                Reply::Ack(ack)
            }
            Message::Request(request) => Reply::Readings(self.readings(request).await),
            Message::Heartbeat => {
                warn!(%peer, "heartbeat sent to the store; ignoring");
                Reply::Ack(Ack::ignored())
            }
            message @ (Message::Measurement(_) | Message::CommunicationTime(_)) => {
                self.counters.record(1, frame_bytes);
                Reply::Ack(self.persist(message).await)
            }
        }
    }
}
