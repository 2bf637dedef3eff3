//! Downlink model: one protocol link per `(host, node, lane)`, shared by
//! every local view subscribed to it.
//!
//! The model tracks the link's status bitmask, fans inbound messages out to
//! its views, and issues `@link` / `@sync` / `@unlink` requests through the
//! owning host's connection. It never owns the connection: the host passes
//! its [`HostLink`] into every call that needs to transmit.

use std::fmt;
use std::ops::BitOr;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, trace};
use url::Url;
use warp_protocol::{Envelope, LinkEnvelope, LinkTag, Uri};

use crate::error::WarpError;
use crate::host::HostLink;
use crate::reactor::Reactor;
use crate::scheduler::{TimerEvent, TimerId};
use crate::view::{HostDownlink, ViewId};

/// The `(node, lane)` half of a downlink's identity, unique within a host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkKey {
    pub node: Uri,
    pub lane: Uri,
}

impl LinkKey {
    pub fn new(node: Uri, lane: Uri) -> Self {
        Self { node, lane }
    }
}

impl fmt::Display for LinkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.node, self.lane)
    }
}

// ---------------------------------------------------------------------------
// Status bitmask
// ---------------------------------------------------------------------------

/// Protocol status of a downlink. `0` is idle/unlinked.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct LinkStatus(u8);

impl LinkStatus {
    pub const IDLE: LinkStatus = LinkStatus(0);
    pub const LINKING: LinkStatus = LinkStatus(1);
    pub const LINKED: LinkStatus = LinkStatus(2);
    pub const SYNCING: LinkStatus = LinkStatus(4);
    pub const SYNCED: LinkStatus = LinkStatus(8);
    pub const UNLINKING: LinkStatus = LinkStatus(16);

    /// Any bit that means a link is requested or open.
    const LIVE: LinkStatus = LinkStatus(1 | 2 | 4 | 8);

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn is_idle(self) -> bool {
        self.0 == 0
    }

    /// Whether every bit of `other` is set.
    pub fn contains(self, other: LinkStatus) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether any bit of `other` is set.
    pub fn intersects(self, other: LinkStatus) -> bool {
        self.0 & other.0 != 0
    }

    fn with(self, other: LinkStatus) -> LinkStatus {
        LinkStatus(self.0 | other.0)
    }

    fn without(self, other: LinkStatus) -> LinkStatus {
        LinkStatus(self.0 & !other.0)
    }
}

impl BitOr for LinkStatus {
    type Output = LinkStatus;

    fn bitor(self, rhs: Self) -> Self::Output {
        self.with(rhs)
    }
}

impl fmt::Debug for LinkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(LinkStatus, &str); 5] = [
            (LinkStatus::LINKING, "Linking"),
            (LinkStatus::LINKED, "Linked"),
            (LinkStatus::SYNCING, "Syncing"),
            (LinkStatus::SYNCED, "Synced"),
            (LinkStatus::UNLINKING, "Unlinking"),
        ];
        if self.is_idle() {
            return f.write_str("Idle");
        }
        let names: Vec<&str> = NAMES
            .iter()
            .filter(|(bit, _)| self.contains(*bit))
            .map(|(_, name)| *name)
            .collect();
        f.write_str(&names.join("|"))
    }
}

// ---------------------------------------------------------------------------
// Link options
// ---------------------------------------------------------------------------

/// Parameters stamped on every `@link` / `@sync` request of a downlink.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LinkOptions {
    pub prio: f64,
    pub rate: f64,
    pub body: Value,
}

/// What the owning host should do with a model after a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub(crate) enum ModelAction {
    Retain,
    Close,
}

// ---------------------------------------------------------------------------
// DownlinkModel
// ---------------------------------------------------------------------------

/// The shared link behind every view of one `(host, node, lane)`.
pub struct DownlinkModel {
    host: Url,
    key: LinkKey,
    options: LinkOptions,
    unlink_delay: Option<Duration>,
    status: LinkStatus,
    views: Vec<(ViewId, Box<dyn HostDownlink>)>,
    unlink_timer: Option<TimerId>,
}

impl DownlinkModel {
    pub(crate) fn new(
        host: Url,
        key: LinkKey,
        options: LinkOptions,
        unlink_delay: Option<Duration>,
    ) -> Self {
        Self {
            host,
            key,
            options,
            unlink_delay,
            status: LinkStatus::IDLE,
            views: Vec::new(),
            unlink_timer: None,
        }
    }

    pub fn host(&self) -> &Url {
        &self.host
    }

    pub fn key(&self) -> &LinkKey {
        &self.key
    }

    pub fn node(&self) -> &Uri {
        &self.key.node
    }

    pub fn lane(&self) -> &Uri {
        &self.key.lane
    }

    pub fn options(&self) -> &LinkOptions {
        &self.options
    }

    pub fn status(&self) -> LinkStatus {
        self.status
    }

    pub fn is_linked(&self) -> bool {
        self.status.contains(LinkStatus::LINKED)
    }

    pub fn is_synced(&self) -> bool {
        self.status.contains(LinkStatus::SYNCED)
    }

    pub fn view_count(&self) -> usize {
        self.views.len()
    }

    /// Whether an unlink is scheduled for after the last view detached.
    pub fn is_unlink_pending(&self) -> bool {
        self.unlink_timer.is_some()
    }

    /// Whether any view wants the link kept open.
    pub fn keep_linked(&self) -> bool {
        self.views.iter().any(|(_, view)| view.keep_linked())
    }

    /// Whether any view wants state replay.
    pub fn keep_synced(&self) -> bool {
        self.views.iter().any(|(_, view)| view.keep_synced())
    }

    fn request(&self, tag: LinkTag) -> LinkEnvelope {
        LinkEnvelope::new(tag, self.key.node.clone(), self.key.lane.clone())
            .with_prio(self.options.prio)
            .with_rate(self.options.rate)
            .with_body(self.options.body.clone())
    }

    // ── Protocol verbs ──────────────────────────────────────────────

    pub(crate) fn link(&mut self, link: &mut HostLink, reactor: &mut Reactor) {
        self.status = self
            .status
            .without(LinkStatus::UNLINKING)
            .with(LinkStatus::LINKING);
        let request = self.request(LinkTag::Link);
        debug!("Linking {} on {} ({:?})", self.key, self.host, self.status);
        for (_, view) in &mut self.views {
            view.on_link_request(&request);
        }
        link.transmit(&Envelope::Link(request), reactor);
    }

    pub(crate) fn sync(&mut self, link: &mut HostLink, reactor: &mut Reactor) {
        self.status = self
            .status
            .without(LinkStatus::UNLINKING)
            .with(LinkStatus::SYNCING);
        let request = self.request(LinkTag::Sync);
        debug!("Syncing {} on {} ({:?})", self.key, self.host, self.status);
        for (_, view) in &mut self.views {
            view.on_sync_request(&request);
        }
        link.transmit(&Envelope::Link(request), reactor);
    }

    /// Request teardown. A no-op unless a link is requested or open.
    pub(crate) fn unlink(&mut self, link: &mut HostLink, reactor: &mut Reactor) {
        if !self.status.intersects(LinkStatus::LIVE) {
            debug!("Ignoring unlink of {} on {}: not linked", self.key, self.host);
            return;
        }
        self.status = LinkStatus::UNLINKING;
        let request = LinkEnvelope::new(LinkTag::Unlink, self.key.node.clone(), self.key.lane.clone());
        debug!("Unlinking {} on {}", self.key, self.host);
        for (_, view) in &mut self.views {
            view.on_unlink_request(&request, &self.host);
        }
        link.transmit(&Envelope::Link(request), reactor);
    }

    /// Sync if any view wants state, otherwise link.
    fn relink(&mut self, link: &mut HostLink, reactor: &mut Reactor) {
        if self.keep_synced() {
            self.sync(link, reactor);
        } else {
            self.link(link, reactor);
        }
    }

    /// Send a command. Views observe it before it reaches the host, so the
    /// echo happens even when the send is buffered or overflows.
    pub(crate) fn command(
        &mut self,
        body: Value,
        link: &mut HostLink,
        reactor: &mut Reactor,
    ) -> Result<(), WarpError> {
        for (_, view) in &mut self.views {
            view.on_command_message(&body);
        }
        let message = LinkEnvelope::command(self.key.node.clone(), self.key.lane.clone(), body);
        link.push(Envelope::Link(message), reactor)
    }

    // ── View multiplexing ───────────────────────────────────────────

    pub(crate) fn add_view(
        &mut self,
        id: ViewId,
        mut view: Box<dyn HostDownlink>,
        link: &mut HostLink,
        reactor: &mut Reactor,
    ) {
        if let Some(timer) = self.unlink_timer.take() {
            reactor.scheduler.cancel(timer);
            debug!("Canceled pending unlink of {} on {}", self.key, self.host);
        }

        view.open_up(&self.host);
        let wants_sync = view.keep_synced();
        let connected = link.is_connected();
        if connected {
            view.host_did_connect(&self.host);
        }
        self.views.push((id, view));
        trace!("Attached {id} to {} ({} views)", self.key, self.views.len());

        if !connected {
            return;
        }
        if self.status.is_idle() {
            self.relink(link, reactor);
        } else if wants_sync
            && !self
                .status
                .intersects(LinkStatus::SYNCING | LinkStatus::SYNCED | LinkStatus::UNLINKING)
        {
            self.sync(link, reactor);
        }
    }

    pub(crate) fn remove_view(
        &mut self,
        id: ViewId,
        link: &mut HostLink,
        reactor: &mut Reactor,
    ) -> Option<ModelAction> {
        let index = self.views.iter().position(|(view_id, _)| *view_id == id)?;
        let (_, mut view) = self.views.remove(index);
        view.close_up();
        trace!("Detached {id} from {} ({} views)", self.key, self.views.len());

        if !self.views.is_empty() {
            return Some(ModelAction::Retain);
        }
        match self.unlink_delay {
            Some(delay) => {
                if let Some(timer) = self.unlink_timer.take() {
                    reactor.scheduler.cancel(timer);
                }
                let event = TimerEvent::Unlink {
                    host: self.host.clone(),
                    link: self.key.clone(),
                };
                self.unlink_timer = Some(reactor.scheduler.schedule(delay, event));
                Some(ModelAction::Retain)
            }
            None => Some(self.release(link, reactor)),
        }
    }

    pub(crate) fn on_unlink_timer(
        &mut self,
        timer: TimerId,
        link: &mut HostLink,
        reactor: &mut Reactor,
    ) -> ModelAction {
        if self.unlink_timer != Some(timer) {
            return ModelAction::Retain;
        }
        self.unlink_timer = None;
        self.release(link, reactor)
    }

    /// Let go of the link once no views remain.
    fn release(&mut self, link: &mut HostLink, reactor: &mut Reactor) -> ModelAction {
        if !self.views.is_empty() || self.status.contains(LinkStatus::UNLINKING) {
            ModelAction::Retain
        } else if link.is_connected() && self.status.intersects(LinkStatus::LIVE) {
            self.unlink(link, reactor);
            ModelAction::Retain
        } else {
            ModelAction::Close
        }
    }

    // ── Inbound ─────────────────────────────────────────────────────

    pub(crate) fn on_envelope(
        &mut self,
        envelope: &LinkEnvelope,
        link: &mut HostLink,
        reactor: &mut Reactor,
    ) -> ModelAction {
        match envelope.tag() {
            LinkTag::Event => {
                for (_, view) in &mut self.views {
                    view.on_event_message(envelope, &self.host);
                }
            }
            LinkTag::Command => {
                for (_, view) in &mut self.views {
                    view.on_command_message(envelope.body());
                }
            }
            LinkTag::Linked => {
                self.status = self
                    .status
                    .without(LinkStatus::LINKING)
                    .with(LinkStatus::LINKED);
                debug!("Linked {} on {}", self.key, self.host);
                for (_, view) in &mut self.views {
                    view.on_linked_response(envelope, &self.host);
                }
            }
            LinkTag::Synced => {
                self.status = self
                    .status
                    .without(LinkStatus::SYNCING)
                    .with(LinkStatus::SYNCED);
                debug!("Synced {} on {}", self.key, self.host);
                for (_, view) in &mut self.views {
                    view.on_synced_response(envelope, &self.host);
                }
            }
            LinkTag::Unlinked => {
                self.status = self.status.without(LinkStatus::UNLINKING);
                debug!("Unlinked {} on {}", self.key, self.host);
                for (_, view) in &mut self.views {
                    view.on_unlinked_response(envelope, &self.host);
                }
                if self.views.is_empty() || !self.status.is_idle() {
                    return ModelAction::Close;
                }
                // A view attached while the unlink was in flight.
                debug!("Relinking {} on {} after unlink race", self.key, self.host);
                self.relink(link, reactor);
            }
            LinkTag::Link | LinkTag::Sync | LinkTag::Unlink => {
                debug!(
                    "Ignoring inbound @{} for {} on {}",
                    envelope.tag().as_str(),
                    self.key,
                    self.host
                );
            }
        }
        ModelAction::Retain
    }

    // ── Host lifecycle ──────────────────────────────────────────────

    pub(crate) fn host_did_connect(&mut self, link: &mut HostLink, reactor: &mut Reactor) {
        for (_, view) in &mut self.views {
            view.host_did_connect(&self.host);
        }
        if !self.views.is_empty() {
            self.relink(link, reactor);
        }
    }

    pub(crate) fn host_did_disconnect(&mut self) -> ModelAction {
        self.status = LinkStatus::IDLE;
        for (_, view) in &mut self.views {
            view.host_did_disconnect(&self.host);
        }
        if self.keep_linked() {
            ModelAction::Retain
        } else {
            ModelAction::Close
        }
    }

    pub(crate) fn host_did_fail(&mut self, error: &WarpError) {
        for (_, view) in &mut self.views {
            view.host_did_fail(error, &self.host);
        }
    }

    /// Close every view and cancel the pending unlink, leaving the status
    /// alone so an in-flight `@unlinked` still finds the model.
    pub(crate) fn detach_views(&mut self, reactor: &mut Reactor) {
        if let Some(timer) = self.unlink_timer.take() {
            reactor.scheduler.cancel(timer);
        }
        for (_, mut view) in self.views.drain(..) {
            view.close_up();
        }
    }

    /// Detach every view and cancel the pending unlink.
    pub(crate) fn close(&mut self, reactor: &mut Reactor) {
        self.detach_views(reactor);
        self.status = LinkStatus::IDLE;
        debug!("Closed downlink {} on {}", self.key, self.host);
    }
}

impl fmt::Debug for DownlinkModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownlinkModel")
            .field("host", &self.host.as_str())
            .field("key", &self.key)
            .field("status", &self.status)
            .field("views", &self.views.len())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_bits() {
        let status = LinkStatus::LINKING | LinkStatus::SYNCED;
        assert_eq!(status.bits(), 9);
        assert!(status.contains(LinkStatus::LINKING));
        assert!(!status.contains(LinkStatus::LINKED));
        assert!(status.intersects(LinkStatus::LINKED | LinkStatus::SYNCED));
        assert!(!status.is_idle());
        assert!(LinkStatus::default().is_idle());
    }

    #[test]
    fn test_status_without_and_with() {
        let status = (LinkStatus::LINKING | LinkStatus::SYNCING).without(LinkStatus::LINKING);
        assert_eq!(status, LinkStatus::SYNCING);
        assert_eq!(status.with(LinkStatus::LINKED).bits(), 6);
    }

    #[test]
    fn test_status_debug() {
        assert_eq!(format!("{:?}", LinkStatus::IDLE), "Idle");
        assert_eq!(
            format!("{:?}", LinkStatus::LINKED | LinkStatus::SYNCING),
            "Linked|Syncing"
        );
    }

    #[test]
    fn test_link_key_display() {
        let key = LinkKey::new(Uri::parse("/unit").unwrap(), Uri::parse("info").unwrap());
        assert_eq!(key.to_string(), "/unit#info");
    }
}
