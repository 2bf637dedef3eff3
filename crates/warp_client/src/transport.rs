//! Transport contract: the only seam through which a host touches the
//! network.
//!
//! A [`Connector`] dials a host URI and hands back a [`Transport`] (the
//! write side). Everything the remote end does (open, text frames, errors,
//! close) comes back separately as [`TransportEvent`]s, tagged with the
//! [`ConnectionId`] of the transport they belong to, through
//! [`DownlinkContext::on_transport_event`](crate::DownlinkContext::on_transport_event).

use std::fmt;

use url::Url;

/// Identifies one transport instance. A host that reconnects gets a new id,
/// so late events from a released transport can be told apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub(crate) u64);

impl ConnectionId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// A lifecycle event from the transport layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The connection is open and may carry frames.
    Opened,
    /// A text frame arrived.
    Message(String),
    /// The connection failed. A [`Closed`](TransportEvent::Closed) follows.
    Error(String),
    /// The connection is gone.
    Closed,
}

/// Write side of one connection.
pub trait Transport: Send {
    /// Queue a text frame. Failures surface later as
    /// [`TransportEvent::Error`].
    fn send(&mut self, text: &str);

    /// Start closing. A [`TransportEvent::Closed`] follows.
    fn close(&mut self);
}

/// Opens transports to hosts.
pub trait Connector: Send {
    /// Begin connecting to `uri`. Events for the new connection must carry `id`.
    fn connect(&mut self, uri: &Url, id: ConnectionId) -> Box<dyn Transport>;
}

/// Connection state of a host as the link layer sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No transport.
    Disconnected,
    /// Transport created, waiting for `Opened`.
    Connecting,
    /// Frames flow.
    Connected,
    /// `close()` was called, waiting for `Closed`.
    Closing,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
