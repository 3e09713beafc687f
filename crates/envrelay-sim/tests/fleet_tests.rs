//! ---
//! relay_section: "11-simulation-test-harness"
//! relay_subsection: "module"
//! relay_type: "source"
//! relay_scope: "code"
//! relay_description: "Sensor fleet delivery tests."
//! relay_version: "v0.1.0"
//! relay_owner: "tbd"
//! ---
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use envrelay_msg::{AlertStatus, IngestListener, Layer, Message, PushSender, SensorType, SensorValue};
use envrelay_sim::{SensorFleet, SensorProfile, SensorWorker, SmokeProfile};
use tokio::sync::broadcast;
use tokio::time::timeout;

fn always_smoke() -> SensorProfile {
    SensorProfile::Smoke(SmokeProfile {
        probability_true: 1.0,
        probability_false: 0.0,
        interval_ms: Duration::from_millis(20),
        jitter_ms: Duration::from_millis(5),
    })
}

#[test]
fn positive_smoke_reading_raises_one_edge_alert() {
    let mut worker = SensorWorker::new("Smoke_1", SensorType::Smoke, always_smoke(), 3);
    let (measurement, alert) = worker.take_reading();
    assert_eq!(measurement.value, SensorValue::Flag(true));
    let Some(Message::Alert(alert)) = alert else {
        panic!("expected an alert");
    };
    assert_eq!(alert.layer, Layer::Edge);
    assert_eq!(alert.status, AlertStatus::Triggered);
}

#[test]
fn profiles_load_from_files() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("temperature.json");
    std::fs::write(
        &path,
        r#"{"probability_correct":0.8,"probability_out_of_range":0.15,"range_min":11.0,"range_max":29.4,"interval_ms":1000}"#,
    )?;
    let profile = SensorProfile::from_path(SensorType::Temperature, &path)?;
    assert_eq!(profile.interval(), Duration::from_secs(1));
    assert!(SensorProfile::from_path(SensorType::Temperature, Path::new("missing.json")).is_err());
    Ok(())
}

#[tokio::test]
async fn fleet_pushes_readings_and_alerts_to_relay() -> anyhow::Result<()> {
    let (listener, mut inbound) =
        IngestListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)), 64).await?;
    let sender = PushSender::new(vec![listener.local_addr()], Duration::from_secs(1));
    let fleet = SensorFleet::new(SensorType::Smoke, vec![always_smoke()], 2)?.with_seed(42);
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let task = tokio::spawn(fleet.run(sender, 32, shutdown_rx));

    let mut measurements = 0;
    let mut alerts = 0;
    while measurements < 4 || alerts < 4 {
        let next = timeout(Duration::from_secs(5), inbound.recv()).await?;
        match next.map(|frame| frame.message) {
            Some(Message::Measurement(_)) => measurements += 1,
            Some(Message::Alert(_)) => alerts += 1,
            other => panic!("unexpected frame {other:?}"),
        }
    }

    shutdown_tx.send(())?;
    let stats = task.await?;
    assert!(stats.readings >= 4);
    assert_eq!(stats.alerts, stats.readings);
    listener.shutdown().await;
    Ok(())
}

#[test]
fn fleet_requires_profiles_and_workers() {
    assert!(SensorFleet::new(SensorType::Humidity, Vec::new(), 1).is_err());
    assert!(SensorFleet::new(SensorType::Smoke, vec![always_smoke()], 0).is_err());
}
