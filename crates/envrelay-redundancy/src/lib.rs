//! ---
//! relay_section: "07-resilience-fault-tolerance"
//! relay_subsection: "module"
//! relay_type: "source"
//! relay_scope: "code"
//! relay_description: "Redundancy planning and failover coordinators."
//! relay_version: "v0.1.0"
//! relay_owner: "tbd"
//! ---
//! Primary/backup redundancy for relay nodes.
//!
//! The primary pushes heartbeats; the backup counts silent periods and
//! promotes itself once the countdown reaches zero, demoting again as soon as
//! heartbeats resume.

mod heartbeat;
mod monitor;
mod state;

pub use heartbeat::HeartbeatEmitter;
pub use monitor::{bind_heartbeat_listener, HeartbeatMonitor, RelayActivation};
pub use state::{FailoverMonitor, FailoverState, RoleSnapshot, Transition};

/// Errors raised by the redundancy tasks.
#[derive(Debug, thiserror::Error)]
pub enum RedundancyError {
    #[error("unable to bind heartbeat listener: {0}")]
    Bind(#[from] envrelay_msg::MessagingError),
    #[error("heartbeat channel closed unexpectedly")]
    ChannelClosed,
}
