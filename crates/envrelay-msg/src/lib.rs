//! ---
//! relay_section: "02-messaging-ipc-data-model"
//! relay_subsection: "module"
//! relay_type: "source"
//! relay_scope: "code"
//! relay_description: "Message schema helpers and protocol codecs."
//! relay_version: "v0.1.0"
//! relay_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Wire messages and transports shared by sensors, relays, the central
//! store, and the quality controller.

pub mod codec;
pub mod logging;
pub mod transport;
pub mod types;

/// Shared result type for messaging operations.
pub type Result<T> = std::result::Result<T, MessagingError>;

/// Errors raised while encoding, decoding, or moving frames.
#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    /// Wrapper for IO errors encountered on a socket.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Wrapper for JSON serialization or deserialization problems.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    /// A single frame exceeded the codec limit.
    #[error("frame exceeds {limit} bytes")]
    FrameTooLarge {
        /// Configured maximum frame size.
        limit: usize,
    },
    /// None of the configured endpoints accepted a connection.
    #[error("no reachable endpoint among {0}")]
    Unreachable(String),
    /// A write did not complete within the configured budget.
    #[error("write timed out")]
    WriteTimeout,
}

pub use codec::{decode_frame, encode_frame, write_frame, FrameReader, MAX_FRAME_BYTES};
pub use logging::{log_message, log_reply, MessageDirection};
pub use transport::{
    ForwardError, Inbound, IngestCounters, IngestListener, IngestStats, PushQueue, PushSender,
    ReplyServer, RequestChannel, RequestClient, RequestHandler,
};
pub use types::{
    Ack, Alert, AlertDetail, AlertStatus, CommunicationTime, Layer, Measurement, Message,
    QualityReport, Readings, ReadingsRequest, Reply, SensorType, SensorValue, StoredRecord,
    DEFAULT_ROUTE, SENSOR_ERROR_SENTINEL,
};
