#![allow(dead_code)]

use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::mpsc::UnboundedReceiver;
use url::Url;
use warp_client::warp_protocol::{Envelope, LinkEnvelope, LinkTag, Uri};
use warp_client::{
    ChannelView, ClientConfig, DownlinkContext, DownlinkEvent, DownlinkKey, LinkOptions,
    MemoryConnector, ViewId,
};

pub fn host() -> Url {
    Url::parse("warp://example.com").unwrap()
}

pub fn key() -> DownlinkKey {
    DownlinkKey::parse("warp://example.com", "/unit", "info").unwrap()
}

pub fn drain(rx: &mut UnboundedReceiver<DownlinkEvent>) -> Vec<DownlinkEvent> {
    std::iter::from_fn(|| rx.try_recv().ok()).collect()
}

/// A registry on a memory transport with a hand-driven clock.
pub struct Harness {
    pub context: DownlinkContext,
    pub connector: MemoryConnector,
    pub now: Instant,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(ClientConfig::default())
    }

    pub fn with_config(config: ClientConfig) -> Self {
        let connector = MemoryConnector::new();
        let now = Instant::now();
        let context = DownlinkContext::new(config, Box::new(connector.clone()), now);
        Self {
            context,
            connector,
            now,
        }
    }

    pub fn advance(&mut self, millis: u64) {
        self.now += Duration::from_millis(millis);
        self.context.advance(self.now);
        self.pump();
    }

    pub fn pump(&mut self) {
        self.connector.pump(&mut self.context);
    }

    /// Accept the pending connection to the test host.
    pub fn accept(&mut self) {
        self.connector.accept(&host());
        self.pump();
    }

    pub fn deliver(&mut self, envelope: impl Into<Envelope>) {
        self.connector.deliver(&host(), &envelope.into());
        self.pump();
    }

    /// Deliver a link response or event for the test downlink.
    pub fn respond(&mut self, tag: LinkTag) {
        self.deliver(link_envelope(tag));
    }

    pub fn event(&mut self, body: Value) {
        let key = key();
        self.deliver(LinkEnvelope::event(key.node, key.lane, body));
    }

    pub fn open_view(
        &mut self,
        keep_linked: bool,
        keep_synced: bool,
    ) -> (ViewId, UnboundedReceiver<DownlinkEvent>) {
        let (view, rx) = ChannelView::new(keep_linked, keep_synced);
        let id = self
            .context
            .open_downlink(&key(), LinkOptions::default(), Box::new(view));
        self.pump();
        (id, rx)
    }

    pub fn sent(&self) -> Vec<Envelope> {
        self.connector.sent_envelopes(&host())
    }

    /// How many link envelopes with `tag` went out.
    pub fn sent_count(&self, tag: LinkTag) -> usize {
        self.sent()
            .iter()
            .filter(|envelope| matches!(envelope, Envelope::Link(link) if link.tag() == tag))
            .count()
    }
}

pub fn link_envelope(tag: LinkTag) -> LinkEnvelope {
    let key = key();
    LinkEnvelope::new(tag, key.node, key.lane)
}

pub fn uri(text: &str) -> Uri {
    Uri::parse(text).unwrap()
}
