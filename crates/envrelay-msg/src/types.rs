//! ---
//! relay_section: "02-messaging-ipc-data-model"
//! relay_subsection: "module"
//! relay_type: "source"
//! relay_scope: "code"
//! relay_description: "Message schema helpers and protocol codecs."
//! relay_version: "v0.1.0"
//! relay_owner: "tbd"
//! ---
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Reading value that marks a malfunctioning temperature or humidity sensor.
pub const SENSOR_ERROR_SENTINEL: f64 = -1.0;

/// Route stamped on measurements leaving the edge tier.
pub const DEFAULT_ROUTE: &str = "Edge-Fog";

/// Fixed set of sensor kinds known to every tier.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[strum(ascii_case_insensitive)]
pub enum SensorType {
    /// Air temperature in degrees Celsius.
    Temperature,
    /// Relative humidity in percent.
    Humidity,
    /// Smoke detector; boolean or absent readings.
    Smoke,
}

impl SensorType {
    /// Whether readings of this kind are numeric and take part in rolling averages.
    pub fn is_averaged(&self) -> bool {
        !matches!(self, SensorType::Smoke)
    }
}

/// Value carried by a measurement.
///
/// Temperature and humidity report numbers (with [`SENSOR_ERROR_SENTINEL`] for
/// a failed read); smoke reports a flag or nothing at all.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum SensorValue {
    /// Numeric sample.
    Numeric(f64),
    /// Boolean detector state.
    Flag(bool),
    /// Sensor produced no value.
    #[default]
    Absent,
}

impl SensorValue {
    /// Numeric payload, if any.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            SensorValue::Numeric(value) => Some(*value),
            SensorValue::Flag(_) | SensorValue::Absent => None,
        }
    }

    /// True when the value is exactly the malfunction sentinel.
    pub fn is_sentinel(&self) -> bool {
        matches!(self, SensorValue::Numeric(value) if *value == SENSOR_ERROR_SENTINEL)
    }

    /// Numeric payload that may enter a rolling average.
    pub fn usable_number(&self) -> Option<f64> {
        self.as_number()
            .filter(|value| value.is_finite() && *value != SENSOR_ERROR_SENTINEL)
    }
}

/// One sensor observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    /// Kind of sensor that produced the reading.
    pub sensor_type: SensorType,
    /// Observed value.
    #[serde(default, alias = "measurement")]
    pub value: SensorValue,
    /// Time the sample was taken.
    #[serde(alias = "time", deserialize_with = "legacy_time::deserialize")]
    pub timestamp: DateTime<Utc>,
    /// Tier path the measurement has travelled.
    #[serde(default = "default_route")]
    pub route: String,
}

fn default_route() -> String {
    DEFAULT_ROUTE.to_owned()
}

/// Accepts RFC 3339 as well as the naive `YYYY-MM-DD HH:MM:SS` stamps older
/// producers send, read as UTC.
mod legacy_time {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{Deserialize, Deserializer};

    const LEGACY_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        if let Ok(parsed) = DateTime::parse_from_rfc3339(&raw) {
            return Ok(parsed.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(&raw, LEGACY_FORMAT)
            .map(|naive| naive.and_utc())
            .map_err(serde::de::Error::custom)
    }
}

impl Measurement {
    /// Construct a measurement stamped with the current time.
    pub fn new(sensor_type: SensorType, value: SensorValue) -> Self {
        Self {
            sensor_type,
            value,
            timestamp: Utc::now(),
            route: default_route(),
        }
    }

    /// Temperature/humidity reading carrying the malfunction sentinel.
    pub fn is_sensor_error(&self) -> bool {
        self.sensor_type.is_averaged() && self.value.is_sentinel()
    }

    /// Alert raised by the producer for a positive smoke reading.
    pub fn smoke_alert(&self) -> Option<Alert> {
        match (self.sensor_type, self.value) {
            (SensorType::Smoke, SensorValue::Flag(true)) => Some(Alert {
                sensor_type: Some(SensorType::Smoke),
                detail: AlertDetail::Measurement(self.value),
                status: AlertStatus::Triggered,
                layer: Layer::Edge,
                route: Some(self.route.clone()),
            }),
            _ => None,
        }
    }
}

/// Tier that raised an alert.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, strum::Display,
)]
pub enum Layer {
    /// Sensors and actuators.
    Edge,
    /// Relay nodes.
    Fog,
    /// Central store and quality controller.
    Cloud,
}

/// Why an alert was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    /// Rolling average left its acceptance band.
    OutOfRange,
    /// A detector fired (smoke).
    Triggered,
    /// Periodic aggregate report.
    Report,
}

/// Aggregate counters pushed to the quality controller on a fixed cadence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityReport {
    /// Messages seen by the reporting node.
    pub message_count: u64,
    /// Encoded size of those messages in bytes.
    pub byte_volume: u64,
    /// Alerts recorded in the store grouped by originating layer.
    #[serde(default)]
    pub alerts_by_layer: BTreeMap<Layer, u64>,
}

/// Payload that explains an alert; flattened into the alert object on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertDetail {
    /// Rolling average that breached a threshold.
    Average(f64),
    /// Raw reading that triggered the alert.
    Measurement(SensorValue),
    /// Aggregate counters.
    Report(QualityReport),
}

/// Anomaly, detector, or report notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    /// Sensor kind the alert refers to; absent for reports.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sensor_type: Option<SensorType>,
    /// Average, raw reading, or report.
    #[serde(flatten)]
    pub detail: AlertDetail,
    /// Alert classification.
    pub status: AlertStatus,
    /// Tier that raised the alert.
    pub layer: Layer,
    /// Tier path, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<String>,
}

impl Alert {
    /// Alert for a rolling average outside its band.
    pub fn out_of_range(sensor_type: SensorType, average: f64, layer: Layer) -> Self {
        Self {
            sensor_type: Some(sensor_type),
            detail: AlertDetail::Average(average),
            status: AlertStatus::OutOfRange,
            layer,
            route: None,
        }
    }

    /// Reporting message carrying aggregate counters.
    pub fn report(report: QualityReport, layer: Layer) -> Self {
        Self {
            sensor_type: None,
            detail: AlertDetail::Report(report),
            status: AlertStatus::Report,
            layer,
            route: None,
        }
    }
}

/// Round-trip latency sample of the last forward.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CommunicationTime {
    /// Elapsed wall time in seconds.
    pub time: f64,
}

/// Pull the most recent stored readings for one sensor kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadingsRequest {
    /// Sensor kind to query.
    pub sensor_type: SensorType,
}

/// Unit of wire communication between tiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "message_type", rename_all = "snake_case")]
pub enum Message {
    /// Sensor observation.
    Measurement(Measurement),
    /// Anomaly, detector, or report notification.
    Alert(Alert),
    /// Latency sample for the previous forward.
    CommunicationTime(CommunicationTime),
    /// Query for recent readings.
    Request(ReadingsRequest),
    /// Liveness pulse from the primary relay.
    Heartbeat,
}

impl Message {
    /// Discriminant as it appears on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Measurement(_) => "measurement",
            Message::Alert(_) => "alert",
            Message::CommunicationTime(_) => "communication_time",
            Message::Request(_) => "request",
            Message::Heartbeat => "heartbeat",
        }
    }

    /// Sensor kind the message concerns, when it has one.
    pub fn sensor_type(&self) -> Option<SensorType> {
        match self {
            Message::Measurement(measurement) => Some(measurement.sensor_type),
            Message::Alert(alert) => alert.sensor_type,
            Message::Request(request) => Some(request.sensor_type),
            Message::CommunicationTime(_) | Message::Heartbeat => None,
        }
    }
}

impl From<Measurement> for Message {
    fn from(value: Measurement) -> Self {
        Message::Measurement(value)
    }
}

impl From<Alert> for Message {
    fn from(value: Alert) -> Self {
        Message::Alert(value)
    }
}

/// A message as persisted by the central store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    /// Per-collection sequence number assigned on insert.
    pub sequence: u64,
    /// Time the store accepted the record.
    pub stored_at: DateTime<Utc>,
    /// Stored message.
    pub message: Message,
}

impl StoredRecord {
    /// Reading value when the record holds a measurement.
    pub fn value(&self) -> Option<SensorValue> {
        match &self.message {
            Message::Measurement(measurement) => Some(measurement.value),
            _ => None,
        }
    }
}

/// Acknowledgment frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    /// Free-form receiver status.
    pub status: String,
}

impl Ack {
    /// Positive acknowledgment.
    pub fn received() -> Self {
        Self {
            status: "received".to_owned(),
        }
    }

    /// Request understood but not acted upon.
    pub fn ignored() -> Self {
        Self {
            status: "ignored".to_owned(),
        }
    }

    /// Request could not be decoded or processed.
    pub fn rejected() -> Self {
        Self {
            status: "rejected".to_owned(),
        }
    }

    /// Request understood but the receiver could not complete it.
    pub fn failed() -> Self {
        Self {
            status: "failed".to_owned(),
        }
    }

    /// Whether the receiver accepted the request.
    pub fn is_received(&self) -> bool {
        self.status == "received"
    }
}

/// Answer to a [`ReadingsRequest`], most recent first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Readings {
    /// Stored records.
    #[serde(default)]
    pub records: Vec<StoredRecord>,
}

/// Exactly one reply frame is returned for every request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reply_type", rename_all = "snake_case")]
pub enum Reply {
    /// Acknowledgment.
    Ack(Ack),
    /// Query answer.
    Readings(Readings),
}

impl Reply {
    /// Discriminant as it appears on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Reply::Ack(_) => "ack",
            Reply::Readings(_) => "readings",
        }
    }
}
