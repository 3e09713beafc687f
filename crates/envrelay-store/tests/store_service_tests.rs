//! ---
//! relay_section: "03-persistence-logging"
//! relay_subsection: "module"
//! relay_type: "source"
//! relay_scope: "code"
//! relay_description: "Persistence abstractions and storage bindings."
//! relay_version: "v0.1.0"
//! relay_owner: "tbd"
//! ---
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use envrelay_msg::{
    Ack, AlertDetail, AlertStatus, Inbound, Layer, Measurement, Message, ReadingsRequest, Reply,
    ReplyServer, RequestChannel, RequestClient, RequestHandler, SensorType, SensorValue,
};
use envrelay_store::{CentralStore, Collection, JsonlStore, ReportTask, StoreService};
use tokio::sync::Mutex;

fn loopback() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 0))
}

#[derive(Default)]
struct AlertSink {
    alerts: Mutex<Vec<Message>>,
}

#[async_trait]
impl RequestHandler for AlertSink {
    async fn handle(&self, inbound: Inbound) -> Reply {
        self.alerts.lock().await.push(inbound.message);
        Reply::Ack(Ack::received())
    }
}

#[tokio::test]
async fn store_service_over_tcp_with_reports() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let sink = Arc::new(AlertSink::default());
    let quality = ReplyServer::bind(loopback(), sink.clone()).await?;
    let timeout = Duration::from_secs(2);

    let store: Arc<dyn CentralStore> = Arc::new(JsonlStore::open(dir.path().join("store"))?);
    let service = StoreService::new(
        store.clone(),
        Box::new(RequestClient::new(quality.local_addr(), timeout)),
        10,
    );
    let counters = service.counters();
    let server = ReplyServer::bind(loopback(), Arc::new(service)).await?;
    let mut relay = RequestClient::connect(server.local_addr(), timeout).await;

    for value in [22.0, -1.0, 24.0] {
        let ack = relay
            .expect_ack(&Message::from(Measurement::new(
                SensorType::Temperature,
                SensorValue::Numeric(value),
            )))
            .await?;
        assert!(ack.is_received());
    }
    let smoke = Measurement::new(SensorType::Smoke, SensorValue::Flag(true));
    relay.expect_ack(&Message::from(smoke.clone())).await?;
    let alert = smoke.smoke_alert().expect("alert");
    relay.expect_ack(&Message::Alert(alert)).await?;

    let readings = relay
        .readings(ReadingsRequest {
            sensor_type: SensorType::Temperature,
        })
        .await?;
    let values: Vec<_> = readings.records.iter().filter_map(|r| r.value()).collect();
    assert_eq!(
        values,
        vec![SensorValue::Numeric(24.0), SensorValue::Numeric(22.0)]
    );
    assert_eq!(store.query_last(Collection::Errors, 10)?.len(), 1);
    // Edge alerts reach the controller after the store has acknowledged them.
    tokio::time::timeout(Duration::from_secs(2), async {
        while sink.alerts.lock().await.is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await?;
    assert_eq!(sink.alerts.lock().await.len(), 1);

    let mut reporter = ReportTask::new(
        store.clone(),
        counters,
        Box::new(RequestClient::new(quality.local_addr(), timeout)),
        Duration::from_secs(20),
    );
    assert!(reporter.send_report().await);
    let received = sink.alerts.lock().await;
    let Some(Message::Alert(report)) = received.last() else {
        panic!("report not delivered");
    };
    assert_eq!(report.status, AlertStatus::Report);
    let AlertDetail::Report(totals) = &report.detail else {
        panic!("report payload missing");
    };
    // Four measurements plus one alert counted twice.
    assert_eq!(totals.message_count, 6);
    assert!(totals.byte_volume > 0);
    assert_eq!(totals.alerts_by_layer.get(&Layer::Edge), Some(&1));
    drop(received);

    server.shutdown().await;
    quality.shutdown().await;
    Ok(())
}
