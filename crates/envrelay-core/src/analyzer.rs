//! ---
//! relay_section: "01-core-functionality"
//! relay_subsection: "module"
//! relay_type: "source"
//! relay_scope: "code"
//! relay_description: "Rolling-window quality analysis for relayed readings."
//! relay_version: "v0.1.0"
//! relay_owner: "tbd"
//! ---
use envrelay_common::{QualityConfig, ThresholdConfig};
use envrelay_msg::{
    Alert, ForwardError, Layer, Message, ReadingsRequest, RequestChannel, SensorType,
    StoredRecord,
};
use tracing::{info, warn};

/// Result of analysing one sensor window.
#[derive(Debug, Clone, PartialEq)]
pub enum Assessment {
    /// No usable readings, or the sensor is not averaged.
    Skipped,
    InRange {
        average: f64,
    },
    /// An alert was raised; each flag tells whether its recipient acknowledged it.
    OutOfRange {
        average: f64,
        quality_acked: bool,
        store_acked: bool,
    },
}

/// Mean of the usable values in `records`, newest first, limited to `window`.
///
/// Sentinel and non-numeric readings are dropped before averaging; an empty
/// remainder yields `None`.
pub fn window_mean(records: &[StoredRecord], window: usize) -> Option<f64> {
    let values: Vec<f64> = records
        .iter()
        .take(window)
        .filter_map(|record| record.value())
        .filter_map(|value| value.usable_number())
        .collect();
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Averages the recent window of a sensor and raises fog alerts on breaches.
#[derive(Debug, Clone)]
pub struct QualityAnalyzer {
    temperature: ThresholdConfig,
    humidity: ThresholdConfig,
    layer: Layer,
}

impl QualityAnalyzer {
    pub fn new(temperature: ThresholdConfig, humidity: ThresholdConfig) -> Self {
        Self {
            temperature,
            humidity,
            layer: Layer::Fog,
        }
    }

    pub fn from_config(config: &QualityConfig) -> Self {
        Self::new(config.temperature, config.humidity)
    }

    /// Thresholds applied to `sensor`, or `None` for sensors that are not averaged.
    pub fn thresholds(&self, sensor: SensorType) -> Option<&ThresholdConfig> {
        match sensor {
            SensorType::Temperature => Some(&self.temperature),
            SensorType::Humidity => Some(&self.humidity),
            SensorType::Smoke => None,
        }
    }

    /// Query the store window of `sensor` and alert when its mean is out of range.
    ///
    /// Only the readings query can fail the analysis; alert delivery failures
    /// are logged and reported in the returned [`Assessment`].
    pub async fn analyze(
        &self,
        sensor: SensorType,
        store: &mut dyn RequestChannel,
        quality: &mut dyn RequestChannel,
    ) -> Result<Assessment, ForwardError> {
        let Some(thresholds) = self.thresholds(sensor) else {
            return Ok(Assessment::Skipped);
        };
        let readings = store
            .readings(ReadingsRequest {
                sensor_type: sensor,
            })
            .await?;
        let Some(average) = window_mean(&readings.records, thresholds.window) else {
            info!(sensor = %sensor, "no usable readings; analysis skipped");
            return Ok(Assessment::Skipped);
        };

        if thresholds.contains(average) {
            info!(sensor = %sensor, average, "average within thresholds");
            return Ok(Assessment::InRange { average });
        }

        warn!(
            sensor = %sensor,
            average,
            min = thresholds.min,
            max = thresholds.max,
            "average out of range"
        );
        let alert = Message::Alert(Alert::out_of_range(sensor, average, self.layer));
        let quality_acked = deliver(quality, &alert, "quality controller").await;
        let store_acked = deliver(store, &alert, "store").await;
        Ok(Assessment::OutOfRange {
            average,
            quality_acked,
            store_acked,
        })
    }
}

async fn deliver(channel: &mut dyn RequestChannel, alert: &Message, target: &str) -> bool {
    match channel.expect_ack(alert).await {
        Ok(ack) => {
            info!(target, status = %ack.status, "alert acknowledged");
            ack.is_received()
        }
        Err(err) => {
            warn!(target, error = %err, "alert not acknowledged");
            false
        }
    }
}
