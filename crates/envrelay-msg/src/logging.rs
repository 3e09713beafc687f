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

use tracing::debug;

use crate::types::{Message, Reply};

/// Direction of the message movement, used for consistent logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageDirection {
    /// Message sent out via a transport.
    Outbound,
    /// Message received from a transport.
    Inbound,
}

/// Emit a structured log entry for message activity.
pub fn log_message(direction: MessageDirection, peer: SocketAddr, message: &Message) {
    debug!(
        %peer,
        kind = message.kind(),
        sensor_type = ?message.sensor_type(),
        direction = ?direction,
        "messaging activity"
    );
}

/// Emit a structured log entry for a reply frame.
pub fn log_reply(direction: MessageDirection, peer: SocketAddr, reply: &Reply) {
    debug!(
        %peer,
        kind = reply.kind(),
        direction = ?direction,
        "reply activity"
    );
}
