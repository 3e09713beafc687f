//! ---
//! relay_section: "07-resilience-fault-tolerance"
//! relay_subsection: "module"
//! relay_type: "source"
//! relay_scope: "code"
//! relay_description: "Redundancy planning and failover coordinators."
//! relay_version: "v0.1.0"
//! relay_owner: "tbd"
//! ---
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use envrelay_msg::{Inbound, Message};
use envrelay_redundancy::{
    bind_heartbeat_listener, FailoverState, HeartbeatEmitter, HeartbeatMonitor, RelayActivation,
};
use tokio::sync::{broadcast, mpsc};

const PERIOD: Duration = Duration::from_millis(100);
const THRESHOLD: u32 = 3;

#[derive(Clone, Default)]
struct CountingActivation {
    activations: Arc<AtomicUsize>,
    deactivations: Arc<AtomicUsize>,
    fail_next: Arc<AtomicBool>,
}

#[async_trait]
impl RelayActivation for CountingActivation {
    async fn activate(&mut self) -> anyhow::Result<()> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            anyhow::bail!("ingest port busy");
        }
        self.activations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn deactivate(&mut self) {
        self.deactivations.fetch_add(1, Ordering::SeqCst);
    }
}

fn heartbeat() -> Inbound {
    Inbound {
        message: Message::Heartbeat,
        frame_bytes: 0,
        peer: SocketAddr::from(([127, 0, 0, 1], 9)),
    }
}

#[tokio::test(start_paused = true)]
async fn promotion_happens_exactly_threshold_periods_after_silence() {
    let activation = CountingActivation::default();
    let monitor = HeartbeatMonitor::new("fog-backup", PERIOD, THRESHOLD, activation.clone());
    let role = monitor.subscribe();
    let (tx, rx) = mpsc::channel(8);
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

    tx.send(heartbeat()).await.expect("queue heartbeat");
    let task = tokio::spawn(monitor.run(rx, shutdown_rx));

    tokio::time::sleep(PERIOD * THRESHOLD - Duration::from_millis(10)).await;
    assert_eq!(role.borrow().state, FailoverState::BackupStandby);
    assert_eq!(activation.activations.load(Ordering::SeqCst), 0);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(role.borrow().state, FailoverState::BackupActive);
    assert!(role.borrow().last_promotion.is_some());

    // Further silence does not start a second relay.
    tokio::time::sleep(PERIOD * 10).await;
    assert_eq!(activation.activations.load(Ordering::SeqCst), 1);

    shutdown_tx.send(()).expect("shutdown");
    let final_role = task.await.expect("join").expect("monitor result");
    assert_eq!(final_role.state, FailoverState::BackupActive);
    assert_eq!(activation.deactivations.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn resumed_heartbeat_demotes_within_one_tick() {
    let activation = CountingActivation::default();
    let monitor = HeartbeatMonitor::new("fog-backup", PERIOD, THRESHOLD, activation.clone());
    let role = monitor.subscribe();
    let (tx, rx) = mpsc::channel(8);
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let task = tokio::spawn(monitor.run(rx, shutdown_rx));

    tokio::time::sleep(PERIOD * THRESHOLD + Duration::from_millis(10)).await;
    assert_eq!(role.borrow().state, FailoverState::BackupActive);

    tx.send(heartbeat()).await.expect("queue heartbeat");
    tokio::time::sleep(Duration::from_millis(1)).await;
    let snapshot = *role.borrow();
    assert_eq!(snapshot.state, FailoverState::BackupStandby);
    assert_eq!(snapshot.consecutive_missed, THRESHOLD);
    assert_eq!(activation.deactivations.load(Ordering::SeqCst), 1);

    shutdown_tx.send(()).expect("shutdown");
    let final_role = task.await.expect("join").expect("monitor result");
    assert_eq!(final_role.state, FailoverState::BackupStandby);
    assert_eq!(activation.deactivations.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn steady_heartbeats_keep_backup_dormant() {
    let activation = CountingActivation::default();
    let monitor = HeartbeatMonitor::new("fog-backup", PERIOD, THRESHOLD, activation.clone());
    let role = monitor.subscribe();
    let (tx, rx) = mpsc::channel(8);
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let task = tokio::spawn(monitor.run(rx, shutdown_rx));

    for _ in 0..20 {
        tokio::time::sleep(PERIOD / 2).await;
        tx.send(heartbeat()).await.expect("queue heartbeat");
    }
    assert_eq!(role.borrow().state, FailoverState::BackupStandby);
    assert_eq!(activation.activations.load(Ordering::SeqCst), 0);

    drop(shutdown_tx);
    task.await.expect("join").expect("monitor result");
}

#[tokio::test(start_paused = true)]
async fn failed_activation_is_retried_on_next_silent_tick() {
    let activation = CountingActivation::default();
    activation.fail_next.store(true, Ordering::SeqCst);
    let monitor = HeartbeatMonitor::new("fog-backup", PERIOD, 1, activation.clone());
    let role = monitor.subscribe();
    let (_tx, rx) = mpsc::channel::<Inbound>(8);
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let task = tokio::spawn(monitor.run(rx, shutdown_rx));

    tokio::time::sleep(PERIOD + Duration::from_millis(10)).await;
    assert_eq!(role.borrow().state, FailoverState::BackupStandby);
    tokio::time::sleep(PERIOD).await;
    assert_eq!(role.borrow().state, FailoverState::BackupActive);
    assert_eq!(activation.activations.load(Ordering::SeqCst), 1);

    shutdown_tx.send(()).expect("shutdown");
    task.await.expect("join").expect("monitor result");
}

#[tokio::test]
async fn emitter_reaches_monitor_over_tcp() {
    let (listener, mut rx) = bind_heartbeat_listener(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .expect("bind");
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let emitter = HeartbeatEmitter::new("fog-primary", listener.local_addr(), Duration::from_millis(20));
    let task = tokio::spawn(emitter.run(shutdown_rx));

    for _ in 0..3 {
        let inbound = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("heartbeat in time")
            .expect("channel open");
        assert_eq!(inbound.message, Message::Heartbeat);
    }

    shutdown_tx.send(()).expect("shutdown");
    let sent = task.await.expect("join");
    assert!(sent >= 3);
    listener.shutdown().await;
}
