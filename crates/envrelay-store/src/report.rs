//! ---
//! relay_section: "03-persistence-logging"
//! relay_subsection: "module"
//! relay_type: "source"
//! relay_scope: "code"
//! relay_description: "Persistence abstractions and storage bindings."
//! relay_version: "v0.1.0"
//! relay_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use envrelay_metrics::StoreMetrics;
use envrelay_msg::{Alert, Layer, Message, QualityReport, RequestChannel};
use tokio::sync::broadcast;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{info, warn};

use crate::collection::CentralStore;
use crate::service::StoreCounters;
use crate::Result;

/// Periodically pushes traffic and alert totals to the quality controller.
pub struct ReportTask {
    store: Arc<dyn CentralStore>,
    counters: Arc<StoreCounters>,
    quality: Box<dyn RequestChannel>,
    interval: Duration,
    metrics: Option<StoreMetrics>,
}

impl ReportTask {
    /// Create a task reporting every `interval`.
    pub fn new(
        store: Arc<dyn CentralStore>,
        counters: Arc<StoreCounters>,
        quality: Box<dyn RequestChannel>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            counters,
            quality,
            interval,
            metrics: None,
        }
    }

    /// Record delivered reports into `metrics`.
    pub fn with_metrics(mut self, metrics: StoreMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Snapshot of the current totals.
    pub fn build_report(&self) -> Result<QualityReport> {
        let alerts_by_layer = self.store.aggregate_alert_counts_by_layer()?;
        Ok(self.counters.report(alerts_by_layer))
    }

    /// Send one report and wait for its acknowledgment.
    pub async fn send_report(&mut self) -> bool {
        let report = match self.build_report() {
            Ok(report) => report,
            Err(err) => {
                warn!(error = %err, "unable to aggregate alert counts");
                return false;
            }
        };
        let message = Message::Alert(Alert::report(report.clone(), Layer::Cloud));
        match self.quality.expect_ack(&message).await {
            Ok(ack) => {
                info!(
                    messages = report.message_count,
                    bytes = report.byte_volume,
                    alerts = ?report.alerts_by_layer,
                    status = %ack.status,
                    "report delivered"
                );
                if let Some(metrics) = &self.metrics {
                    metrics.record_report();
                }
                true
            }
            Err(err) => {
                warn!(error = %err, "report not acknowledged");
                false
            }
        }
    }

    /// Report on every tick until shutdown; returns the number delivered.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> u64 {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut delivered = 0u64;
        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => break,
                _ = ticker.tick() => {
                    if self.send_report().await {
                        delivered += 1;
                    }
                }
            }
        }
        delivered
    }
}
