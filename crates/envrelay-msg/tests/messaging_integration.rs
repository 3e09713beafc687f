//! ---
//! relay_section: "02-messaging-ipc-data-model"
//! relay_subsection: "module"
//! relay_type: "source"
//! relay_scope: "code"
//! relay_description: "Message schema helpers and protocol codecs."
//! relay_version: "v0.1.0"
//! relay_owner: "tbd"
//! ---
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use envrelay_msg::{
    Ack, ForwardError, Inbound, IngestListener, Measurement, Message, PushSender, Readings,
    ReadingsRequest, Reply, ReplyServer, RequestChannel, RequestClient, RequestHandler,
    SensorType, SensorValue,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

fn loopback() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 0))
}

fn reading(value: f64) -> Message {
    Message::from(Measurement::new(
        SensorType::Temperature,
        SensorValue::Numeric(value),
    ))
}

#[derive(Default)]
struct CountingHandler {
    handled: AtomicUsize,
}

#[async_trait]
impl RequestHandler for CountingHandler {
    async fn handle(&self, inbound: Inbound) -> Reply {
        self.handled.fetch_add(1, Ordering::SeqCst);
        match inbound.message {
            Message::Request(_) => Reply::Readings(Readings::default()),
            _ => Reply::Ack(Ack::received()),
        }
    }
}

#[tokio::test]
async fn request_reply_round_trip() -> anyhow::Result<()> {
    let handler = Arc::new(CountingHandler::default());
    let server = ReplyServer::bind(loopback(), handler.clone()).await?;
    let mut client = RequestClient::connect(server.local_addr(), Duration::from_secs(2)).await;
    assert!(client.is_connected());

    let ack = client.expect_ack(&reading(21.0)).await?;
    assert!(ack.is_received());
    let readings = client
        .readings(ReadingsRequest {
            sensor_type: SensorType::Temperature,
        })
        .await?;
    assert!(readings.records.is_empty());
    assert_eq!(handler.handled.load(Ordering::SeqCst), 2);

    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn malformed_request_gets_rejected_ack() -> anyhow::Result<()> {
    let handler = Arc::new(CountingHandler::default());
    let server = ReplyServer::bind(loopback(), handler.clone()).await?;

    let stream = TcpStream::connect(server.local_addr()).await?;
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    write.write_all(b"{\"message_type\":\"bogus\"}\n").await?;
    let line = lines.next_line().await?.expect("reply line");
    let reply: Reply = serde_json::from_str(&line)?;
    assert_eq!(reply, Reply::Ack(Ack::rejected()));
    assert_eq!(handler.handled.load(Ordering::SeqCst), 0);

    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn silent_server_times_out_and_next_request_reconnects() -> anyhow::Result<()> {
    let listener = TcpListener::bind(loopback()).await?;
    let addr = listener.local_addr()?;
    // Accepted streams are returned, not dropped, so both stay open and silent.
    let accepted = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
            if held.len() == 2 {
                break;
            }
        }
        held
    });

    let mut client = RequestClient::new(addr, Duration::from_millis(100));
    let first = client.request(&reading(20.0)).await.unwrap_err();
    assert!(matches!(first, ForwardError::Timeout { .. }));
    assert!(!client.is_connected());

    let second = client.request(&reading(20.0)).await.unwrap_err();
    assert!(matches!(second, ForwardError::Timeout { .. }));
    let held = accepted.await?;
    assert_eq!(held.len(), 2);
    drop(held);
    Ok(())
}

#[tokio::test]
async fn unreachable_downstream_is_a_connect_error() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let mut client = RequestClient::connect(addr, Duration::from_millis(200)).await;
    assert!(!client.is_connected());
    let err = client.request(&reading(20.0)).await.unwrap_err();
    assert!(matches!(err, ForwardError::Connect { .. }));
    assert_eq!(err.endpoint(), addr);
}

#[tokio::test]
async fn ingest_drops_when_queue_is_full() -> anyhow::Result<()> {
    let (listener, mut rx) = IngestListener::bind(loopback(), 2).await?;
    let mut producer = TcpStream::connect(listener.local_addr()).await?;
    for value in 0..5 {
        let mut frame = serde_json::to_vec(&reading(f64::from(value)))?;
        frame.push(b'\n');
        producer.write_all(&frame).await?;
    }
    producer.write_all(b"garbage\n").await?;
    producer.flush().await?;

    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let stats = listener.stats();
            if stats.received == 5 && stats.malformed == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await?;

    let stats = listener.stats();
    assert_eq!(stats.dropped, 3);
    let first = rx.recv().await.expect("queued");
    match &first.message {
        Message::Measurement(measurement) => {
            assert_eq!(measurement.value, SensorValue::Numeric(0.0))
        }
        other => panic!("unexpected message {other:?}"),
    }
    assert!(first.frame_bytes > 0);
    assert!(rx.recv().await.is_some());

    listener.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn ingest_shutdown_releases_port() -> anyhow::Result<()> {
    let (listener, _rx) = IngestListener::bind(loopback(), 4).await?;
    let addr = listener.local_addr();
    listener.shutdown().await;
    let (rebound, _rx) = IngestListener::bind(addr, 4).await?;
    assert_eq!(rebound.local_addr(), addr);
    rebound.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn push_sender_falls_through_to_next_endpoint() -> anyhow::Result<()> {
    let dead = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
        listener.local_addr()?
    };
    let (listener, mut rx) = IngestListener::bind(loopback(), 8).await?;

    let mut sender = PushSender::new(
        vec![dead, listener.local_addr()],
        Duration::from_millis(500),
    );
    let endpoint = sender.send(&Message::Heartbeat).await?;
    assert_eq!(endpoint, listener.local_addr());
    assert_eq!(sender.connected_endpoint(), Some(listener.local_addr()));

    let inbound = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await?
        .expect("heartbeat delivered");
    assert_eq!(inbound.message, Message::Heartbeat);

    listener.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn push_sender_reports_unreachable_endpoints() {
    let dead = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        listener.local_addr().expect("addr")
    };
    let mut sender = PushSender::new(vec![dead], Duration::from_millis(200));
    let err = sender.send(&Message::Heartbeat).await.unwrap_err();
    assert!(err.to_string().contains(&dead.to_string()));
}
