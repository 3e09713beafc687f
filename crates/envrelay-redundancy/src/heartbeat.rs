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

use envrelay_msg::{Message, PushSender};
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Periodic one-way heartbeat from the primary relay to its backup.
pub struct HeartbeatEmitter {
    relay: String,
    peer: SocketAddr,
    interval: Duration,
    sender: PushSender,
}

impl HeartbeatEmitter {
    pub fn new(relay: impl Into<String>, peer: SocketAddr, interval: Duration) -> Self {
        Self {
            relay: relay.into(),
            peer,
            interval,
            sender: PushSender::new(vec![peer], interval),
        }
    }

    /// Emit until shutdown; returns the number of heartbeats written.
    ///
    /// Delivery is best effort: an unreachable backup is logged once per
    /// outage and retried on the next tick.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> u64 {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sent = 0_u64;
        let mut peer_reachable = true;
        info!(relay = %self.relay, peer = %self.peer, interval_ms = self.interval.as_millis() as u64, "heartbeat emitter started");
        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => break,
                _ = ticker.tick() => {
                    match self.sender.send(&Message::Heartbeat).await {
                        Ok(_) => {
                            sent += 1;
                            if !peer_reachable {
                                info!(relay = %self.relay, peer = %self.peer, "backup reachable again");
                                peer_reachable = true;
                            }
                        }
                        Err(err) if peer_reachable => {
                            warn!(relay = %self.relay, peer = %self.peer, error = %err, "heartbeat not delivered");
                            peer_reachable = false;
                        }
                        Err(err) => debug!(peer = %self.peer, error = %err, "heartbeat not delivered"),
                    }
                }
            }
        }
        info!(relay = %self.relay, sent, "heartbeat emitter stopped");
        sent
    }
}
