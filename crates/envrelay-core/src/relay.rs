//! ---
//! relay_section: "01-core-functionality"
//! relay_subsection: "module"
//! relay_type: "source"
//! relay_scope: "code"
//! relay_description: "Store-and-forward relay loop between sensors and the store."
//! relay_version: "v0.1.0"
//! relay_owner: "tbd"
//! ---
//! The relay loop is the single consumer of the ingest queue. Each message is
//! forwarded to the store first and analysed afterwards; the next message is
//! taken only once both steps are done.

use std::sync::Arc;
use std::time::Instant;

use envrelay_common::time::{duration_to_micros, elapsed_seconds, monotonic_now};
use envrelay_metrics::RelayMetrics;
use envrelay_msg::{
    Alert, CommunicationTime, ForwardError, Inbound, IngestCounters, Measurement, Message,
    ReadingsRequest, RequestChannel, SensorType,
};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::analyzer::{Assessment, QualityAnalyzer};

/// What happened to one message taken off the ingest queue.
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    /// The store acknowledged the message; `assessment` is set when a
    /// quality analysis ran afterwards.
    Forwarded { assessment: Option<Assessment> },
    /// The store did not acknowledge; the message is not retried.
    ForwardFailed,
    /// The message has no business on the ingest path.
    Discarded,
}

/// Totals reported when the relay loop stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub processed: u64,
    pub forwarded: u64,
    pub failed: u64,
    pub discarded: u64,
}

impl RelayStats {
    fn record(&mut self, disposition: &Disposition) {
        self.processed += 1;
        match disposition {
            Disposition::Forwarded { .. } => self.forwarded += 1,
            Disposition::ForwardFailed => self.failed += 1,
            Disposition::Discarded => self.discarded += 1,
        }
    }
}

/// Forwards sensor traffic to the store and runs quality analysis.
pub struct RelayRuntime {
    name: String,
    store: Box<dyn RequestChannel>,
    quality: Box<dyn RequestChannel>,
    analyzer: QualityAnalyzer,
    metrics: Option<RelayMetrics>,
    ingest: Option<Arc<IngestCounters>>,
}

impl RelayRuntime {
    pub fn new(
        name: impl Into<String>,
        store: Box<dyn RequestChannel>,
        quality: Box<dyn RequestChannel>,
        analyzer: QualityAnalyzer,
    ) -> Self {
        Self {
            name: name.into(),
            store,
            quality,
            analyzer,
            metrics: None,
            ingest: None,
        }
    }

    pub fn with_metrics(mut self, metrics: RelayMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Mirror the listener's frame counters into the ingest gauge after each message.
    pub fn with_ingest_counters(mut self, counters: Arc<IngestCounters>) -> Self {
        self.ingest = Some(counters);
        self
    }

    /// Consume the queue until it closes or shutdown is signalled.
    ///
    /// Shutdown is observed between messages only, so the message in flight
    /// completes or fails before the loop returns.
    pub async fn run(
        mut self,
        mut queue: mpsc::Receiver<Inbound>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> RelayStats {
        info!(
            relay = %self.name,
            store = %self.store.endpoint(),
            quality = %self.quality.endpoint(),
            "relay loop started"
        );
        let mut stats = RelayStats::default();
        loop {
            let inbound = tokio::select! {
                biased;
                _ = shutdown.recv() => break,
                next = queue.recv() => match next {
                    Some(inbound) => inbound,
                    None => break,
                },
            };
            let disposition = self.process(inbound).await;
            stats.record(&disposition);
            self.publish_ingest_stats();
        }
        info!(
            relay = %self.name,
            processed = stats.processed,
            forwarded = stats.forwarded,
            failed = stats.failed,
            "relay loop stopped"
        );
        stats
    }

    /// Relay one inbound message to completion.
    pub async fn process(&mut self, inbound: Inbound) -> Disposition {
        let Inbound { message, peer, .. } = inbound;
        debug!(relay = %self.name, %peer, kind = message.kind(), "message dequeued");
        if let Some(metrics) = &self.metrics {
            metrics.record_received(message.kind());
        }
        match message {
            Message::Measurement(measurement) => self.relay_measurement(measurement).await,
            Message::Alert(alert) => self.relay_alert(alert).await,
            Message::Request(request) => self.relay_request(request).await,
            other @ (Message::Heartbeat | Message::CommunicationTime(_)) => {
                warn!(relay = %self.name, %peer, kind = other.kind(), "unexpected message on ingest; dropping");
                Disposition::Discarded
            }
        }
    }

    async fn relay_measurement(&mut self, measurement: Measurement) -> Disposition {
        let sensor = measurement.sensor_type;
        let sensor_error = measurement.is_sensor_error();
        let started = monotonic_now();
        if !self.forward(&Message::Measurement(measurement)).await {
            return Disposition::ForwardFailed;
        }
        let round_trip = elapsed_seconds(started);

        if sensor_error {
            info!(relay = %self.name, sensor = %sensor, "sensor error reading excluded from analysis");
            return Disposition::Forwarded { assessment: None };
        }
        if !sensor.is_averaged() {
            return Disposition::Forwarded { assessment: None };
        }

        self.forward(&Message::CommunicationTime(CommunicationTime { time: round_trip }))
            .await;
        let assessment = self.analyze(sensor).await;
        Disposition::Forwarded { assessment }
    }

    async fn relay_alert(&mut self, alert: Alert) -> Disposition {
        info!(relay = %self.name, layer = %alert.layer, status = %alert.status, "relaying alert");
        if self.forward(&Message::Alert(alert)).await {
            Disposition::Forwarded { assessment: None }
        } else {
            Disposition::ForwardFailed
        }
    }

    async fn relay_request(&mut self, request: ReadingsRequest) -> Disposition {
        let started = monotonic_now();
        match self.store.readings(request).await {
            Ok(readings) => {
                self.record_forwarded(started);
                info!(
                    relay = %self.name,
                    sensor = %request.sensor_type,
                    records = readings.records.len(),
                    "readings retrieved"
                );
                Disposition::Forwarded { assessment: None }
            }
            Err(err) => {
                self.record_failure(&err);
                Disposition::ForwardFailed
            }
        }
    }

    async fn analyze(&mut self, sensor: SensorType) -> Option<Assessment> {
        let result = self
            .analyzer
            .analyze(sensor, self.store.as_mut(), self.quality.as_mut())
            .await;
        match result {
            Ok(assessment) => {
                if let (Assessment::OutOfRange { .. }, Some(metrics)) =
                    (&assessment, &self.metrics)
                {
                    metrics.record_alert(&sensor.to_string());
                }
                Some(assessment)
            }
            Err(err) => {
                warn!(relay = %self.name, sensor = %sensor, error = %err, "quality analysis skipped");
                None
            }
        }
    }

    /// Send `message` to the store; `true` once it is acknowledged.
    async fn forward(&mut self, message: &Message) -> bool {
        let started = monotonic_now();
        match self.store.expect_ack(message).await {
            Ok(ack) => {
                let latency_us = self.record_forwarded(started);
                if ack.is_received() {
                    debug!(relay = %self.name, kind = message.kind(), latency_us, "forwarded to store");
                } else {
                    warn!(relay = %self.name, kind = message.kind(), status = %ack.status, latency_us, "store did not accept message");
                }
                true
            }
            Err(err) => {
                self.record_failure(&err);
                false
            }
        }
    }

    fn record_forwarded(&self, started: Instant) -> u64 {
        let latency = started.elapsed();
        if let Some(metrics) = &self.metrics {
            metrics.record_forwarded("store", latency);
        }
        duration_to_micros(latency)
    }

    fn record_failure(&self, err: &ForwardError) {
        warn!(relay = %self.name, endpoint = %err.endpoint(), error = %err, "forward to store failed");
        if let Some(metrics) = &self.metrics {
            metrics.record_failure("store");
        }
    }

    fn publish_ingest_stats(&self) {
        if let (Some(metrics), Some(counters)) = (&self.metrics, &self.ingest) {
            let stats = counters.snapshot();
            metrics.set_ingest_frames(stats.received, stats.dropped, stats.malformed);
        }
    }
}
