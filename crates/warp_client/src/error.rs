//! Client error types.

use warp_protocol::ProtocolError;

/// Errors surfaced by the link layer.
///
/// Network faults never show up here: they drive reconnection and reach
/// subscribers as `host_did_fail` / `host_did_disconnect` notifications.
/// What is left is caller-actionable.
#[derive(Debug, thiserror::Error)]
pub enum WarpError {
    /// A command was pushed while disconnected and the send buffer is full.
    #[error("Send buffer overflow for {host} (capacity {capacity})")]
    BufferOverflow { host: String, capacity: usize },

    /// The host URI could not be parsed.
    #[error("Invalid host URI: {0}")]
    InvalidHostUri(#[from] url::ParseError),

    /// A node or lane URI was rejected.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A transport-level failure, reported to views via `host_did_fail`.
    #[error("Transport error: {0}")]
    Transport(String),

    /// No downlink is open for the given `(host, node, lane)`.
    #[error("Unknown downlink: {0}")]
    UnknownDownlink(String),

    /// The client task has shut down.
    #[error("Client closed")]
    ClientClosed,

    /// JSON serialization / deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The global tracing subscriber could not be installed.
    #[error("Logging error: {0}")]
    Logging(String),
}
