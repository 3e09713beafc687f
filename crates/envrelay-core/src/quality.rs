//! ---
//! relay_section: "01-core-functionality"
//! relay_subsection: "module"
//! relay_type: "source"
//! relay_scope: "code"
//! relay_description: "Quality controller endpoint receiving alerts and reports."
//! relay_version: "v0.1.0"
//! relay_owner: "tbd"
//! ---
use async_trait::async_trait;
use envrelay_metrics::QualityMetrics;
use envrelay_msg::{Ack, AlertDetail, AlertStatus, Inbound, Message, Reply, RequestHandler};
use indexmap::IndexMap;
use parking_lot::Mutex;
use tracing::{info, warn};

/// Terminal consumer of alerts: logs each one and acknowledges it.
#[derive(Debug, Default)]
pub struct QualityController {
    by_status: Mutex<IndexMap<AlertStatus, u64>>,
    metrics: Option<QualityMetrics>,
}

impl QualityController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_metrics(mut self, metrics: QualityMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Alerts received so far, in order of first appearance of each status.
    pub fn counts(&self) -> IndexMap<AlertStatus, u64> {
        self.by_status.lock().clone()
    }

    /// Number of alerts received with `status`.
    pub fn count(&self, status: AlertStatus) -> u64 {
        self.by_status.lock().get(&status).copied().unwrap_or(0)
    }
}

#[async_trait]
impl RequestHandler for QualityController {
    async fn handle(&self, inbound: Inbound) -> Reply {
        let Message::Alert(alert) = inbound.message else {
            warn!(peer = %inbound.peer, kind = inbound.message.kind(), "quality controller only accepts alerts");
            return Reply::Ack(Ack::ignored());
        };

        *self.by_status.lock().entry(alert.status).or_insert(0) += 1;
        if let Some(metrics) = &self.metrics {
            metrics.record_alert(&alert.status.to_string(), &alert.layer.to_string());
        }

        match &alert.detail {
            AlertDetail::Report(report) => info!(
                peer = %inbound.peer,
                layer = %alert.layer,
                messages = report.message_count,
                bytes = report.byte_volume,
                alerts = ?report.alerts_by_layer,
                "traffic report received"
            ),
            AlertDetail::Average(average) => warn!(
                peer = %inbound.peer,
                layer = %alert.layer,
                sensor = ?alert.sensor_type,
                average,
                "average out of range"
            ),
            AlertDetail::Measurement(value) => warn!(
                peer = %inbound.peer,
                layer = %alert.layer,
                sensor = ?alert.sensor_type,
                value = ?value,
                status = %alert.status,
                "sensor alert"
            ),
        }
        Reply::Ack(Ack::received())
    }
}
