//! Local subscribers multiplexed onto a shared downlink.
//!
//! A [`DownlinkModel`](crate::downlink::DownlinkModel) owns one boxed
//! [`HostDownlink`] per attached subscriber and notifies it synchronously,
//! before the next protocol event is processed. Implementations must not
//! block; [`ChannelView`] forwards every notification into a channel.

use std::fmt;

use serde_json::Value;
use tokio::sync::mpsc;
use url::Url;
use warp_protocol::LinkEnvelope;

use crate::error::WarpError;

/// Identifies one attached view within the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ViewId(pub(crate) u64);

impl fmt::Display for ViewId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "view-{}", self.0)
    }
}

/// What the link layer exposes upward to a subscriber.
///
/// Every notification has a no-op default so implementations only pick the
/// ones they care about. `keep_linked` and `keep_synced` are polled by the
/// downlink model to decide whether to relink, sync, or let go on
/// disconnect.
#[allow(unused_variables)]
pub trait HostDownlink: Send {
    /// Whether the link should be re-established after a disconnect.
    fn keep_linked(&self) -> bool {
        true
    }

    /// Whether the link should replay state (`@sync`) rather than just link.
    fn keep_synced(&self) -> bool {
        false
    }

    /// The view was attached to a downlink on `host`.
    fn open_up(&mut self, host: &Url) {}

    /// The view was detached, or its downlink closed.
    fn close_up(&mut self) {}

    fn host_did_connect(&mut self, host: &Url) {}

    fn host_did_disconnect(&mut self, host: &Url) {}

    fn host_did_fail(&mut self, error: &WarpError, host: &Url) {}

    fn on_event_message(&mut self, message: &LinkEnvelope, host: &Url) {}

    /// A command was issued on this downlink (local echo) or received.
    fn on_command_message(&mut self, body: &Value) {}

    fn on_link_request(&mut self, request: &LinkEnvelope) {}

    fn on_linked_response(&mut self, response: &LinkEnvelope, host: &Url) {}

    fn on_sync_request(&mut self, request: &LinkEnvelope) {}

    fn on_synced_response(&mut self, response: &LinkEnvelope, host: &Url) {}

    fn on_unlink_request(&mut self, request: &LinkEnvelope, host: &Url) {}

    fn on_unlinked_response(&mut self, response: &LinkEnvelope, host: &Url) {}
}

/// A notification delivered by [`ChannelView`].
#[derive(Debug, Clone, PartialEq)]
pub enum DownlinkEvent {
    Opened,
    Closed,
    Connected,
    Disconnected,
    Failed(String),
    Event(Value),
    Command(Value),
    LinkRequested,
    Linked,
    SyncRequested,
    Synced,
    UnlinkRequested,
    Unlinked,
}

/// A view that turns every notification into a [`DownlinkEvent`] on an
/// unbounded channel.
#[derive(Debug)]
pub struct ChannelView {
    keep_linked: bool,
    keep_synced: bool,
    events: mpsc::UnboundedSender<DownlinkEvent>,
}

impl ChannelView {
    /// Create a view and the receiver its events arrive on.
    pub fn new(
        keep_linked: bool,
        keep_synced: bool,
    ) -> (Self, mpsc::UnboundedReceiver<DownlinkEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Self {
                keep_linked,
                keep_synced,
                events,
            },
            rx,
        )
    }

    fn emit(&self, event: DownlinkEvent) {
        // Receiver gone means the subscriber stopped listening.
        let _ = self.events.send(event);
    }
}

impl HostDownlink for ChannelView {
    fn keep_linked(&self) -> bool {
        self.keep_linked
    }

    fn keep_synced(&self) -> bool {
        self.keep_synced
    }

    fn open_up(&mut self, _host: &Url) {
        self.emit(DownlinkEvent::Opened);
    }

    fn close_up(&mut self) {
        self.emit(DownlinkEvent::Closed);
    }

    fn host_did_connect(&mut self, _host: &Url) {
        self.emit(DownlinkEvent::Connected);
    }

    fn host_did_disconnect(&mut self, _host: &Url) {
        self.emit(DownlinkEvent::Disconnected);
    }

    fn host_did_fail(&mut self, error: &WarpError, _host: &Url) {
        self.emit(DownlinkEvent::Failed(error.to_string()));
    }

    fn on_event_message(&mut self, message: &LinkEnvelope, _host: &Url) {
        self.emit(DownlinkEvent::Event(message.body().clone()));
    }

    fn on_command_message(&mut self, body: &Value) {
        self.emit(DownlinkEvent::Command(body.clone()));
    }

    fn on_link_request(&mut self, _request: &LinkEnvelope) {
        self.emit(DownlinkEvent::LinkRequested);
    }

    fn on_linked_response(&mut self, _response: &LinkEnvelope, _host: &Url) {
        self.emit(DownlinkEvent::Linked);
    }

    fn on_sync_request(&mut self, _request: &LinkEnvelope) {
        self.emit(DownlinkEvent::SyncRequested);
    }

    fn on_synced_response(&mut self, _response: &LinkEnvelope, _host: &Url) {
        self.emit(DownlinkEvent::Synced);
    }

    fn on_unlink_request(&mut self, _request: &LinkEnvelope, _host: &Url) {
        self.emit(DownlinkEvent::UnlinkRequested);
    }

    fn on_unlinked_response(&mut self, _response: &LinkEnvelope, _host: &Url) {
        self.emit(DownlinkEvent::Unlinked);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use serde_json::json;
    use warp_protocol::Uri;

    use super::*;

    #[test]
    fn test_channel_view_forwards_notifications() {
        let host = Url::parse("warp://example.com").unwrap();
        let (mut view, mut rx) = ChannelView::new(true, true);
        assert!(view.keep_linked());
        assert!(view.keep_synced());

        let event = LinkEnvelope::event(
            Uri::parse("/unit").unwrap(),
            Uri::parse("info").unwrap(),
            json!("hi"),
        );
        view.open_up(&host);
        view.on_event_message(&event, &host);
        view.host_did_fail(&WarpError::Transport("reset".into()), &host);
        view.close_up();

        assert_eq!(rx.try_recv().unwrap(), DownlinkEvent::Opened);
        assert_eq!(rx.try_recv().unwrap(), DownlinkEvent::Event(json!("hi")));
        assert_eq!(
            rx.try_recv().unwrap(),
            DownlinkEvent::Failed("Transport error: reset".into())
        );
        assert_eq!(rx.try_recv().unwrap(), DownlinkEvent::Closed);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_default_policy() {
        struct Quiet;
        impl HostDownlink for Quiet {}

        let quiet = Quiet;
        assert!(quiet.keep_linked());
        assert!(!quiet.keep_synced());
    }

    #[test]
    fn test_send_after_receiver_dropped_is_silent() {
        let (mut view, rx) = ChannelView::new(true, false);
        drop(rx);
        view.close_up();
    }
}
