//! In-process transport for tests.
//!
//! [`MemoryConnector`] hands out transports that record every frame sent
//! through them. The remote side is scripted: callers queue `Opened`,
//! `Message`, `Error` and `Closed` events and [`pump`](MemoryConnector::pump)
//! them into a [`DownlinkContext`].

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;
use url::Url;
use warp_protocol::{Envelope, JsonCodec, WireCodec};

use crate::context::DownlinkContext;
use crate::transport::{ConnectionId, Connector, Transport, TransportEvent};

/// One transport handed out by a [`MemoryConnector`].
#[derive(Debug, Clone)]
pub struct MemoryConnection {
    pub host: Url,
    pub id: ConnectionId,
    pub sent: Vec<String>,
    pub closed: bool,
}

#[derive(Debug, Default)]
struct MemoryState {
    connections: Vec<MemoryConnection>,
    events: VecDeque<(Url, ConnectionId, TransportEvent)>,
}

impl MemoryState {
    fn latest(&self, host: &Url) -> Option<&MemoryConnection> {
        self.connections
            .iter()
            .rev()
            .find(|conn| &conn.host == host && !conn.closed)
    }

    fn connection_mut(&mut self, id: ConnectionId) -> Option<&mut MemoryConnection> {
        self.connections.iter_mut().find(|conn| conn.id == id)
    }
}

/// A scriptable [`Connector`]. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemoryConnector {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of transports handed out.
    pub fn connection_count(&self) -> usize {
        self.state.lock().connections.len()
    }

    /// Snapshot of every transport handed out, oldest first.
    pub fn connections(&self) -> Vec<MemoryConnection> {
        self.state.lock().connections.clone()
    }

    /// Id of the newest open transport to `host`.
    pub fn current(&self, host: &Url) -> Option<ConnectionId> {
        self.state.lock().latest(host).map(|conn| conn.id)
    }

    fn enqueue(&self, host: &Url, event: TransportEvent) {
        let mut state = self.state.lock();
        match state.latest(host).map(|conn| conn.id) {
            Some(id) => state.events.push_back((host.clone(), id, event)),
            None => warn!("No open memory connection to {host}"),
        }
    }

    /// The remote end accepts the newest connection.
    pub fn accept(&self, host: &Url) {
        self.enqueue(host, TransportEvent::Opened);
    }

    /// The remote end sends an envelope.
    pub fn deliver(&self, host: &Url, envelope: &Envelope) {
        self.deliver_text(host, &JsonCodec.serialize(envelope));
    }

    /// The remote end sends raw text.
    pub fn deliver_text(&self, host: &Url, text: &str) {
        self.enqueue(host, TransportEvent::Message(text.to_owned()));
    }

    /// The connection fails.
    pub fn fail(&self, host: &Url, message: &str) {
        self.enqueue(host, TransportEvent::Error(message.to_owned()));
    }

    /// The remote end closes the connection.
    pub fn drop_connection(&self, host: &Url) {
        let mut state = self.state.lock();
        let Some(id) = state.latest(host).map(|conn| conn.id) else {
            warn!("No open memory connection to {host}");
            return;
        };
        if let Some(conn) = state.connection_mut(id) {
            conn.closed = true;
        }
        state.events.push_back((host.clone(), id, TransportEvent::Closed));
    }

    /// Drain queued events.
    pub fn take_events(&self) -> Vec<(Url, ConnectionId, TransportEvent)> {
        self.state.lock().events.drain(..).collect()
    }

    /// Feed queued events into `context` until none are left.
    pub fn pump(&self, context: &mut DownlinkContext) {
        loop {
            let events = self.take_events();
            if events.is_empty() {
                break;
            }
            for (host, id, event) in events {
                context.on_transport_event(&host, id, event);
            }
        }
    }

    /// Every frame sent to `host`, across connections.
    pub fn sent(&self, host: &Url) -> Vec<String> {
        self.state
            .lock()
            .connections
            .iter()
            .filter(|conn| &conn.host == host)
            .flat_map(|conn| conn.sent.iter().cloned())
            .collect()
    }

    /// Every frame sent to `host`, parsed as JSON envelopes.
    pub fn sent_envelopes(&self, host: &Url) -> Vec<Envelope> {
        self.sent(host)
            .iter()
            .filter_map(|text| JsonCodec.parse(text))
            .collect()
    }

    /// Forget recorded frames.
    pub fn clear_sent(&self) {
        for conn in &mut self.state.lock().connections {
            conn.sent.clear();
        }
    }
}

impl Connector for MemoryConnector {
    fn connect(&mut self, uri: &Url, id: ConnectionId) -> Box<dyn Transport> {
        self.state.lock().connections.push(MemoryConnection {
            host: uri.clone(),
            id,
            sent: Vec::new(),
            closed: false,
        });
        Box::new(MemoryTransport {
            host: uri.clone(),
            id,
            state: Arc::clone(&self.state),
        })
    }
}

struct MemoryTransport {
    host: Url,
    id: ConnectionId,
    state: Arc<Mutex<MemoryState>>,
}

impl Transport for MemoryTransport {
    fn send(&mut self, text: &str) {
        if let Some(conn) = self.state.lock().connection_mut(self.id) {
            conn.sent.push(text.to_owned());
        }
    }

    fn close(&mut self) {
        let mut state = self.state.lock();
        let Some(conn) = state.connection_mut(self.id) else {
            return;
        };
        if conn.closed {
            return;
        }
        conn.closed = true;
        state
            .events
            .push_back((self.host.clone(), self.id, TransportEvent::Closed));
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
