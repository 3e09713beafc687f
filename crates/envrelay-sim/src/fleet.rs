//! ---
//! relay_section: "11-simulation-test-harness"
//! relay_subsection: "module"
//! relay_type: "source"
//! relay_scope: "code"
//! relay_description: "Simulated sensor workers pushing readings to relays."
//! relay_version: "v0.1.0"
//! relay_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use envrelay_msg::{Measurement, Message, PushQueue, PushSender, SensorType};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::profile::SensorProfile;

/// Readings produced by one worker or a whole fleet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FleetStats {
    pub readings: u64,
    pub alerts: u64,
    /// Messages refused by the outbound queue.
    pub dropped: u64,
}

impl FleetStats {
    fn merge(&mut self, other: FleetStats) {
        self.readings += other.readings;
        self.alerts += other.alerts;
        self.dropped += other.dropped;
    }
}

/// A single simulated sensor.
pub struct SensorWorker {
    id: String,
    sensor: SensorType,
    profile: SensorProfile,
    rng: StdRng,
}

impl SensorWorker {
    pub fn new(id: impl Into<String>, sensor: SensorType, profile: SensorProfile, seed: u64) -> Self {
        Self {
            id: id.into(),
            sensor,
            profile,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Take one reading, together with the alert a positive smoke reading raises.
    pub fn take_reading(&mut self) -> (Measurement, Option<Message>) {
        let value = self.profile.sample(&mut self.rng);
        let measurement = Measurement::new(self.sensor, value);
        let alert = measurement.smoke_alert().map(Message::Alert);
        (measurement, alert)
    }

    fn jitter(&mut self) -> Duration {
        let bound = self.profile.jitter();
        if bound.is_zero() {
            return Duration::ZERO;
        }
        bound.mul_f64(self.rng.gen::<f64>())
    }

    /// Sample until shutdown, offering every message to `queue`.
    pub async fn run(
        mut self,
        queue: Arc<PushQueue>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> FleetStats {
        info!(worker = %self.id, sensor = %self.sensor, "sensor started");
        let mut stats = FleetStats::default();
        loop {
            let jitter = self.jitter();
            tokio::select! {
                biased;
                _ = shutdown.recv() => break,
                _ = sleep(jitter) => {}
            }

            let (measurement, alert) = self.take_reading();
            info!(worker = %self.id, sensor = %self.sensor, value = ?measurement.value, "reading taken");
            stats.readings += 1;
            if !queue.offer(Message::Measurement(measurement)) {
                stats.dropped += 1;
            }
            if let Some(alert) = alert {
                warn!(worker = %self.id, "smoke detected; raising alert");
                stats.alerts += 1;
                if !queue.offer(alert) {
                    stats.dropped += 1;
                }
            }

            tokio::select! {
                biased;
                _ = shutdown.recv() => break,
                _ = sleep(self.profile.interval()) => {}
            }
        }
        info!(worker = %self.id, readings = stats.readings, "sensor stopped");
        stats
    }
}

/// `workers` simulated sensors of one type sharing an outbound queue.
#[derive(Debug, Clone)]
pub struct SensorFleet {
    sensor: SensorType,
    profiles: Vec<SensorProfile>,
    workers: usize,
    seed: Option<u64>,
}

impl SensorFleet {
    /// Worker `i` uses profile `i`, or the last profile when there are fewer.
    pub fn new(sensor: SensorType, profiles: Vec<SensorProfile>, workers: usize) -> Result<Self> {
        if profiles.is_empty() {
            bail!("at least one sensor profile is required");
        }
        if workers == 0 {
            bail!("at least one sensor worker is required");
        }
        Ok(Self {
            sensor,
            profiles,
            workers,
            seed: None,
        })
    }

    /// Make sampling reproducible.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    fn profile_for(&self, index: usize) -> &SensorProfile {
        let last = self.profiles.len() - 1;
        &self.profiles[index.min(last)]
    }

    /// Run every worker until shutdown, then flush the queue.
    pub async fn run(
        self,
        sender: PushSender,
        queue_capacity: usize,
        shutdown: broadcast::Receiver<()>,
    ) -> FleetStats {
        let queue = Arc::new(PushQueue::spawn(sender, queue_capacity));
        let base_seed = self.seed.unwrap_or_else(rand::random);
        let mut workers = JoinSet::new();
        for index in 0..self.workers {
            let worker = SensorWorker::new(
                format!("{}_{}", self.sensor, index + 1),
                self.sensor,
                self.profile_for(index).clone(),
                base_seed.wrapping_add(index as u64),
            );
            workers.spawn(worker.run(Arc::clone(&queue), shutdown.resubscribe()));
        }
        info!(sensor = %self.sensor, workers = self.workers, "sensor fleet started");

        let mut stats = FleetStats::default();
        while let Some(result) = workers.join_next().await {
            match result {
                Ok(worker_stats) => stats.merge(worker_stats),
                Err(err) => warn!(error = %err, "sensor worker ended abnormally"),
            }
        }
        match Arc::try_unwrap(queue) {
            Ok(queue) => queue.close().await,
            Err(_) => warn!("push queue still shared; pending messages discarded"),
        }
        info!(
            sensor = %self.sensor,
            readings = stats.readings,
            alerts = stats.alerts,
            dropped = stats.dropped,
            "sensor fleet stopped"
        );
        stats
    }
}
