//! ---
//! relay_section: "01-core-functionality"
//! relay_subsection: "module"
//! relay_type: "source"
//! relay_scope: "code"
//! relay_description: "Relay runtime and quality analysis tests."
//! relay_version: "v0.1.0"
//! relay_owner: "tbd"
//! ---
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use envrelay_common::QualityConfig;
use envrelay_core::{Assessment, Disposition, QualityAnalyzer, RelayRuntime};
use envrelay_msg::{
    Ack, ForwardError, Inbound, Layer, Measurement, Message, Readings, Reply, RequestChannel,
    RequestHandler, SensorType, SensorValue,
};
use envrelay_store::{CentralStore, Collection, MemoryStore, StoreService};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};

fn addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

/// Acknowledges everything and keeps what it was sent.
#[derive(Clone, Default)]
struct Recorder {
    sent: Arc<Mutex<Vec<Message>>>,
}

impl Recorder {
    fn alerts(&self) -> Vec<Message> {
        self.sent
            .lock()
            .iter()
            .filter(|message| matches!(message, Message::Alert(_)))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl RequestChannel for Recorder {
    fn endpoint(&self) -> SocketAddr {
        addr(5580)
    }

    async fn request(&mut self, message: &Message) -> Result<Reply, ForwardError> {
        self.sent.lock().push(message.clone());
        match message {
            Message::Request(_) => Ok(Reply::Readings(Readings::default())),
            _ => Ok(Reply::Ack(Ack::received())),
        }
    }
}

/// In-process channel to a real store service.
struct LocalStore {
    service: Arc<StoreService>,
}

#[async_trait]
impl RequestChannel for LocalStore {
    fn endpoint(&self) -> SocketAddr {
        addr(5581)
    }

    async fn request(&mut self, message: &Message) -> Result<Reply, ForwardError> {
        Ok(self
            .service
            .handle(Inbound {
                message: message.clone(),
                frame_bytes: 80,
                peer: addr(40000),
            })
            .await)
    }
}

/// Store that never answers.
struct Unreachable;

#[async_trait]
impl RequestChannel for Unreachable {
    fn endpoint(&self) -> SocketAddr {
        addr(5581)
    }

    async fn request(&mut self, _message: &Message) -> Result<Reply, ForwardError> {
        Err(ForwardError::Closed {
            endpoint: self.endpoint(),
        })
    }
}

struct Harness {
    runtime: RelayRuntime,
    store: Arc<MemoryStore>,
    quality: Recorder,
    edge_relay: Recorder,
}

fn harness() -> Harness {
    let store = Arc::new(MemoryStore::new());
    let edge_relay = Recorder::default();
    let service = StoreService::new(store.clone(), Box::new(edge_relay.clone()), 10);
    let quality = Recorder::default();
    let runtime = RelayRuntime::new(
        "fog-test",
        Box::new(LocalStore {
            service: Arc::new(service),
        }),
        Box::new(quality.clone()),
        QualityAnalyzer::from_config(&QualityConfig::default()),
    );
    Harness {
        runtime,
        store,
        quality,
        edge_relay,
    }
}

fn inbound(message: Message) -> Inbound {
    Inbound {
        message,
        frame_bytes: 80,
        peer: addr(41000),
    }
}

fn temperature(value: f64) -> Inbound {
    inbound(Message::from(Measurement::new(
        SensorType::Temperature,
        SensorValue::Numeric(value),
    )))
}

fn assessment(disposition: Disposition) -> Option<Assessment> {
    match disposition {
        Disposition::Forwarded { assessment } => assessment,
        other => panic!("expected a forwarded message, got {other:?}"),
    }
}

#[tokio::test]
async fn error_value_is_excluded_from_the_window_mean() {
    let mut h = harness();
    h.runtime.process(temperature(22.0)).await;
    let sentinel = h.runtime.process(temperature(-1.0)).await;
    assert_eq!(assessment(sentinel), None);
    let last = h.runtime.process(temperature(24.0)).await;

    assert_eq!(assessment(last), Some(Assessment::InRange { average: 23.0 }));
    assert_eq!(h.store.len(Collection::Errors), 1);
    assert_eq!(h.store.len(Collection::Temperature), 2);
    // Latency samples follow the two valid readings only.
    assert_eq!(h.store.len(Collection::CommunicationTimes), 2);
}

#[tokio::test]
async fn threshold_bounds_are_inclusive() {
    for value in [11.0, 29.4] {
        let mut h = harness();
        let outcome = h.runtime.process(temperature(value)).await;
        assert_eq!(
            assessment(outcome),
            Some(Assessment::InRange { average: value })
        );
        assert!(h.quality.alerts().is_empty());
        assert_eq!(h.store.len(Collection::Alerts), 0);
    }
}

#[tokio::test]
async fn breach_alerts_quality_controller_and_store_once() {
    let mut h = harness();
    let outcome = h.runtime.process(temperature(29.41)).await;
    assert_eq!(
        assessment(outcome),
        Some(Assessment::OutOfRange {
            average: 29.41,
            quality_acked: true,
            store_acked: true,
        })
    );

    let alerts = h.quality.alerts();
    assert_eq!(alerts.len(), 1);
    assert!(matches!(&alerts[0], Message::Alert(alert) if alert.layer == Layer::Fog));
    let stored = h.store.query_last(Collection::Alerts, 10).unwrap();
    assert_eq!(stored.len(), 1);
    // Fog alerts are not relayed a second time by the store.
    assert!(h.edge_relay.alerts().is_empty());
}

#[tokio::test]
async fn humidity_below_band_raises_alert() {
    let mut h = harness();
    let reading = inbound(Message::from(Measurement::new(
        SensorType::Humidity,
        SensorValue::Numeric(65.0),
    )));
    let outcome = h.runtime.process(reading).await;
    assert!(matches!(
        assessment(outcome),
        Some(Assessment::OutOfRange { .. })
    ));
    assert_eq!(h.quality.alerts().len(), 1);
}

#[tokio::test]
async fn empty_window_skips_analysis() {
    let analyzer = QualityAnalyzer::from_config(&QualityConfig::default());
    let mut store = Recorder::default();
    let mut quality = Recorder::default();
    let outcome = analyzer
        .analyze(SensorType::Humidity, &mut store, &mut quality)
        .await
        .unwrap();
    assert_eq!(outcome, Assessment::Skipped);
    assert!(quality.sent.lock().is_empty());
    assert_eq!(store.sent.lock().len(), 1);
}

#[tokio::test]
async fn single_smoke_reading_yields_exactly_one_alert() {
    let mut h = harness();
    let reading = Measurement::new(SensorType::Smoke, SensorValue::Flag(true));
    let alert = reading.smoke_alert().expect("positive smoke reading raises an alert");

    let forwarded = h.runtime.process(inbound(Message::from(reading))).await;
    assert_eq!(assessment(forwarded), None);
    h.runtime.process(inbound(Message::Alert(alert))).await;

    assert_eq!(h.store.len(Collection::Smoke), 1);
    assert_eq!(h.store.len(Collection::Alerts), 1);
    assert_eq!(h.store.len(Collection::CommunicationTimes), 0);
    tokio::time::timeout(std::time::Duration::from_secs(1), async {
        while h.edge_relay.alerts().is_empty() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("edge alert relayed by the store");
    assert_eq!(h.edge_relay.alerts().len(), 1);
    assert!(h.quality.sent.lock().is_empty());
}

#[test]
fn negative_smoke_reading_raises_nothing() {
    let reading = Measurement::new(SensorType::Smoke, SensorValue::Flag(false));
    assert!(reading.smoke_alert().is_none());
}

#[tokio::test]
async fn heartbeat_on_ingest_is_discarded() {
    let mut h = harness();
    let outcome = h.runtime.process(inbound(Message::Heartbeat)).await;
    assert_eq!(outcome, Disposition::Discarded);
    assert_eq!(h.store.len(Collection::Temperature), 0);
}

#[tokio::test]
async fn failed_forward_skips_analysis() {
    let quality = Recorder::default();
    let mut runtime = RelayRuntime::new(
        "fog-test",
        Box::new(Unreachable),
        Box::new(quality.clone()),
        QualityAnalyzer::from_config(&QualityConfig::default()),
    );
    let outcome = runtime.process(temperature(40.0)).await;
    assert_eq!(outcome, Disposition::ForwardFailed);
    assert!(quality.sent.lock().is_empty());
}

#[tokio::test]
async fn loop_drains_queue_until_senders_close() {
    let h = harness();
    let (tx, rx) = mpsc::channel(8);
    let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
    for value in [20.0, 21.0] {
        tx.send(temperature(value)).await.unwrap();
    }
    tx.send(inbound(Message::Heartbeat)).await.unwrap();
    drop(tx);

    let stats = h.runtime.run(rx, shutdown_rx).await;
    assert_eq!(stats.processed, 3);
    assert_eq!(stats.forwarded, 2);
    assert_eq!(stats.discarded, 1);
    assert_eq!(h.store.len(Collection::Temperature), 2);
}

#[tokio::test]
async fn loop_stops_on_shutdown() {
    let h = harness();
    let (_tx, rx) = mpsc::channel::<Inbound>(8);
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let task = tokio::spawn(h.runtime.run(rx, shutdown_rx));
    shutdown_tx.send(()).unwrap();
    let stats = task.await.unwrap();
    assert_eq!(stats.processed, 0);
}
