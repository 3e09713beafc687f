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
use std::time::Duration;

use async_trait::async_trait;
use envrelay_msg::{Inbound, IngestListener, Message};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, warn};

use crate::state::{FailoverMonitor, FailoverState, RoleSnapshot, Transition};
use crate::RedundancyError;

const HEARTBEAT_QUEUE: usize = 16;

/// Bind the one-way listener a backup receives heartbeats on.
pub async fn bind_heartbeat_listener(
    addr: SocketAddr,
) -> Result<(IngestListener, mpsc::Receiver<Inbound>), RedundancyError> {
    Ok(IngestListener::bind(addr, HEARTBEAT_QUEUE).await?)
}

/// Starts and stops the relay runtime of a backup node.
#[async_trait]
pub trait RelayActivation: Send {
    /// Start accepting and relaying sensor traffic.
    async fn activate(&mut self) -> anyhow::Result<()>;

    /// Stop relaying and release the listener and downstream connections.
    async fn deactivate(&mut self);
}

enum Tick {
    Heartbeat,
    Silent,
    Closed,
}

/// Task owning the failover state of a backup relay.
///
/// It is the only writer of the role; other tasks observe it through
/// [`HeartbeatMonitor::subscribe`].
pub struct HeartbeatMonitor<A> {
    relay: String,
    period: Duration,
    monitor: FailoverMonitor,
    activation: A,
    snapshot: watch::Sender<RoleSnapshot>,
}

impl<A: RelayActivation> HeartbeatMonitor<A> {
    pub fn new(relay: impl Into<String>, period: Duration, threshold: u32, activation: A) -> Self {
        let monitor = FailoverMonitor::backup(threshold);
        let (snapshot, _) = watch::channel(monitor.snapshot());
        Self {
            relay: relay.into(),
            period,
            monitor,
            activation,
            snapshot,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<RoleSnapshot> {
        self.snapshot.subscribe()
    }

    /// Run until shutdown, returning the final role snapshot.
    ///
    /// Each tick waits at most one period for a heartbeat. An active relay is
    /// torn down before returning.
    pub async fn run(
        mut self,
        mut heartbeats: mpsc::Receiver<Inbound>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<RoleSnapshot, RedundancyError> {
        info!(
            relay = %self.relay,
            period_ms = self.period.as_millis() as u64,
            threshold = self.monitor.threshold(),
            "heartbeat monitor started"
        );
        let outcome = loop {
            let tick = tokio::select! {
                biased;
                _ = shutdown.recv() => break Ok(()),
                tick = next_tick(&mut heartbeats, self.period) => tick,
            };
            let transition = match tick {
                Tick::Heartbeat => self.monitor.on_heartbeat(),
                Tick::Silent => self.monitor.on_timeout(),
                Tick::Closed => break Err(RedundancyError::ChannelClosed),
            };
            match transition {
                Some(Transition::Promoted) => {
                    if let Err(err) = self.activation.activate().await {
                        error!(relay = %self.relay, error = %format!("{err:#}"), "relay start failed after promotion");
                        self.monitor.rollback_promotion();
                    }
                }
                Some(Transition::Demoted) => self.activation.deactivate().await,
                None => {}
            }
            self.snapshot.send_replace(self.monitor.snapshot());
        };

        if self.monitor.state() == FailoverState::BackupActive {
            self.activation.deactivate().await;
        }
        info!(relay = %self.relay, state = %self.monitor.state(), "heartbeat monitor stopped");
        outcome.map(|()| self.monitor.snapshot())
    }
}

async fn next_tick(heartbeats: &mut mpsc::Receiver<Inbound>, period: Duration) -> Tick {
    let deadline = Instant::now() + period;
    loop {
        match timeout_at(deadline, heartbeats.recv()).await {
            Ok(Some(Inbound {
                message: Message::Heartbeat,
                peer,
                ..
            })) => {
                debug!(%peer, "heartbeat received");
                return Tick::Heartbeat;
            }
            Ok(Some(other)) => {
                warn!(peer = %other.peer, kind = other.message.kind(), "ignoring non-heartbeat on heartbeat channel");
            }
            Ok(None) => return Tick::Closed,
            Err(_) => return Tick::Silent,
        }
    }
}
