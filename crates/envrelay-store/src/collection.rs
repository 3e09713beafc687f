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

use envrelay_msg::{Layer, Message, SensorType, StoredRecord};
use serde::{Deserialize, Serialize};

use crate::{Result, StoreError};

/// Named collections kept by the central store.
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
    strum::EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Collection {
    /// Valid temperature readings.
    Temperature,
    /// Valid humidity readings.
    Humidity,
    /// Every smoke reading.
    Smoke,
    /// Temperature/humidity readings carrying the malfunction sentinel.
    Errors,
    /// Alerts from any layer.
    Alerts,
    /// Relay round-trip latency samples.
    CommunicationTimes,
}

impl Collection {
    /// Collection holding valid readings of a sensor type.
    pub fn for_sensor(sensor_type: SensorType) -> Self {
        match sensor_type {
            SensorType::Temperature => Collection::Temperature,
            SensorType::Humidity => Collection::Humidity,
            SensorType::Smoke => Collection::Smoke,
        }
    }

    /// Collection a message is filed under.
    pub fn for_message(message: &Message) -> Result<Self> {
        match message {
            Message::Measurement(measurement) if measurement.is_sensor_error() => {
                Ok(Collection::Errors)
            }
            Message::Measurement(measurement) => Ok(Self::for_sensor(measurement.sensor_type)),
            Message::Alert(_) => Ok(Collection::Alerts),
            Message::CommunicationTime(_) => Ok(Collection::CommunicationTimes),
            Message::Request(_) | Message::Heartbeat => Err(StoreError::NotStorable(message.kind())),
        }
    }

    /// File name used by on-disk backends.
    pub fn file_name(&self) -> String {
        format!("{self}.jsonl")
    }
}

/// Persistence adapter behind the store service.
///
/// Implementations assign a per-collection sequence on insert and return
/// queries most recent first.
pub trait CentralStore: Send + Sync {
    /// Append a message to a collection.
    fn insert(&self, collection: Collection, message: Message) -> Result<StoredRecord>;

    /// Up to `n` records of a collection, most recent first.
    fn query_last(&self, collection: Collection, n: usize) -> Result<Vec<StoredRecord>>;

    /// Remove every collection.
    fn drop_all(&self) -> Result<()>;

    /// Number of stored alerts grouped by originating layer.
    fn aggregate_alert_counts_by_layer(&self) -> Result<BTreeMap<Layer, u64>>;
}

pub(crate) fn alert_layer(message: &Message) -> Option<Layer> {
    match message {
        Message::Alert(alert) => Some(alert.layer),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use envrelay_msg::{Alert, CommunicationTime, Measurement, ReadingsRequest, SensorValue};

    #[test]
    fn messages_map_to_collections() {
        let reading = Message::from(Measurement::new(
            SensorType::Humidity,
            SensorValue::Numeric(80.0),
        ));
        assert_eq!(Collection::for_message(&reading).ok(), Some(Collection::Humidity));

        let broken = Message::from(Measurement::new(
            SensorType::Temperature,
            SensorValue::Numeric(-1.0),
        ));
        assert_eq!(Collection::for_message(&broken).ok(), Some(Collection::Errors));

        let alert = Message::from(Alert::out_of_range(SensorType::Humidity, 40.0, Layer::Fog));
        assert_eq!(Collection::for_message(&alert).ok(), Some(Collection::Alerts));

        let latency = Message::CommunicationTime(CommunicationTime { time: 0.02 });
        assert_eq!(
            Collection::for_message(&latency).ok(),
            Some(Collection::CommunicationTimes)
        );
    }

    #[test]
    fn control_messages_are_not_storable() {
        assert!(Collection::for_message(&Message::Heartbeat).is_err());
        let request = Message::Request(ReadingsRequest {
            sensor_type: SensorType::Smoke,
        });
        assert!(matches!(
            Collection::for_message(&request),
            Err(StoreError::NotStorable("request"))
        ));
    }

    #[test]
    fn file_names_are_snake_case() {
        assert_eq!(
            Collection::CommunicationTimes.file_name(),
            "communication_times.jsonl"
        );
    }
}
