//! Shared machinery every host and downlink model reaches through: the
//! connector, the codec, the timer wheel and the online flag.

use url::Url;
use warp_protocol::WireCodec;

use crate::scheduler::Scheduler;
use crate::transport::{ConnectionId, Connector, Transport};

/// Callback for inbound text the codec could not parse.
pub type UnknownEnvelopeHook = Box<dyn FnMut(&Url, &str) + Send>;

pub(crate) struct Reactor {
    connector: Box<dyn Connector>,
    pub(crate) codec: Box<dyn WireCodec>,
    pub(crate) scheduler: Scheduler,
    pub(crate) online: bool,
    next_connection: u64,
    unknown_envelope: Option<UnknownEnvelopeHook>,
}

impl Reactor {
    pub(crate) fn new(
        connector: Box<dyn Connector>,
        codec: Box<dyn WireCodec>,
        scheduler: Scheduler,
        online: bool,
    ) -> Self {
        Self {
            connector,
            codec,
            scheduler,
            online,
            next_connection: 0,
            unknown_envelope: None,
        }
    }

    /// Dial `uri` with a fresh connection id.
    pub(crate) fn connect(&mut self, uri: &Url) -> (ConnectionId, Box<dyn Transport>) {
        let id = ConnectionId(self.next_connection);
        self.next_connection += 1;
        (id, self.connector.connect(uri, id))
    }

    pub(crate) fn set_unknown_envelope_hook(&mut self, hook: UnknownEnvelopeHook) {
        self.unknown_envelope = Some(hook);
    }

    pub(crate) fn unknown_envelope(&mut self, host: &Url, text: &str) {
        if let Some(hook) = self.unknown_envelope.as_mut() {
            hook(host, text);
        }
    }
}
