//! One connection to a remote WARP endpoint and the downlinks
//! multiplexed onto it.
//!
//! A [`Host`] owns at most one transport at a time. It turns outbound
//! envelopes into text frames (or buffers commands while disconnected),
//! dispatches inbound envelopes to the matching [`DownlinkModel`], sends
//! credentials on connect, and runs the reconnect and idle timers.
//!
//! The connection half lives in [`HostLink`] so that a downlink model can
//! transmit through it while the host is iterating its models.

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use rand::Rng;
use serde_json::Value;
use tracing::{debug, info, trace, warn};
use url::Url;
use warp_protocol::{Envelope, HostEnvelope, HostTag, LinkEnvelope};

use crate::config::HostOptions;
use crate::downlink::{DownlinkModel, LinkKey, LinkOptions, LinkStatus, ModelAction};
use crate::error::WarpError;
use crate::reactor::Reactor;
use crate::scheduler::{TimerEvent, TimerId};
use crate::transport::{ConnectionId, ConnectionState, Transport, TransportEvent};
use crate::view::{HostDownlink, ViewId};

/// First reconnect delay, before doubling.
const INITIAL_RECONNECT_DELAY: Duration = Duration::from_millis(500);

// ---------------------------------------------------------------------------
// HostLink
// ---------------------------------------------------------------------------

struct Socket {
    id: ConnectionId,
    transport: Box<dyn Transport>,
    state: ConnectionState,
}

/// The connection half of a host: transport, send buffer, credentials and
/// timers.
pub(crate) struct HostLink {
    uri: Url,
    options: HostOptions,
    socket: Option<Socket>,
    credentials: Option<Value>,
    session: Option<Value>,
    send_buffer: VecDeque<Envelope>,
    reconnect_timer: Option<TimerId>,
    reconnect_delay: Duration,
    idle_timer: Option<TimerId>,
}

impl HostLink {
    fn new(uri: Url, options: HostOptions) -> Self {
        let credentials = options.credentials.clone();
        Self {
            uri,
            options,
            socket: None,
            credentials,
            session: None,
            send_buffer: VecDeque::new(),
            reconnect_timer: None,
            reconnect_delay: Duration::ZERO,
            idle_timer: None,
        }
    }

    fn state(&self) -> ConnectionState {
        self.socket
            .as_ref()
            .map_or(ConnectionState::Disconnected, |socket| socket.state)
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Dial the host unless a transport already exists.
    pub(crate) fn open(&mut self, reactor: &mut Reactor) {
        if self.socket.is_some() {
            return;
        }
        if let Some(timer) = self.reconnect_timer.take() {
            reactor.scheduler.cancel(timer);
        }
        let (id, transport) = reactor.connect(&self.uri);
        info!("Connecting to {} ({id})", self.uri);
        self.socket = Some(Socket {
            id,
            transport,
            state: ConnectionState::Connecting,
        });
    }

    /// Write one envelope to the wire. Dropped when not connected.
    pub(crate) fn transmit(&mut self, envelope: &Envelope, reactor: &mut Reactor) {
        match self.socket.as_mut() {
            Some(socket) if socket.state == ConnectionState::Connected => {
                let text = reactor.codec.serialize(envelope);
                trace!("-> {}: {text}", self.uri);
                socket.transport.send(&text);
            }
            _ => {
                debug!(
                    "Dropping @{} for {}: not connected",
                    envelope.tag_name(),
                    self.uri
                );
            }
        }
    }

    /// Send now, or buffer a command and start connecting.
    pub(crate) fn push(&mut self, envelope: Envelope, reactor: &mut Reactor) -> Result<(), WarpError> {
        if self.is_connected() {
            self.transmit(&envelope, reactor);
            return Ok(());
        }
        if !envelope.is_command() {
            debug!(
                "Dropping @{} for {}: not connected",
                envelope.tag_name(),
                self.uri
            );
            return Ok(());
        }
        if self.send_buffer.len() >= self.options.send_buffer_size {
            warn!(
                "Send buffer for {} is full ({} commands)",
                self.uri, self.options.send_buffer_size
            );
            return Err(WarpError::BufferOverflow {
                host: self.uri.to_string(),
                capacity: self.options.send_buffer_size,
            });
        }
        self.send_buffer.push_back(envelope);
        trace!("Buffered command for {} ({} queued)", self.uri, self.send_buffer.len());
        self.open(reactor);
        Ok(())
    }

    fn flush(&mut self, reactor: &mut Reactor) {
        while self.is_connected() {
            let Some(envelope) = self.send_buffer.pop_front() else {
                break;
            };
            self.transmit(&envelope, reactor);
        }
    }

    fn schedule_reconnect(&mut self, reactor: &mut Reactor) {
        if let Some(timer) = self.reconnect_timer.take() {
            reactor.scheduler.cancel(timer);
        }
        let max = self.options.max_reconnect_timeout;
        self.reconnect_delay = if self.reconnect_delay.is_zero() {
            INITIAL_RECONNECT_DELAY.min(max)
        } else {
            self.reconnect_delay.saturating_mul(2).min(max)
        };
        let jitter: f64 = rand::rng().random_range(0.5..=1.0);
        let delay = self.reconnect_delay.mul_f64(jitter);
        debug!("Reconnecting to {} in {delay:?}", self.uri);
        let event = TimerEvent::Reconnect {
            host: self.uri.clone(),
        };
        self.reconnect_timer = Some(reactor.scheduler.schedule(delay, event));
    }

    fn cancel_idle(&mut self, reactor: &mut Reactor) {
        if let Some(timer) = self.idle_timer.take() {
            reactor.scheduler.cancel(timer);
        }
    }

    fn cancel_timers(&mut self, reactor: &mut Reactor) {
        if let Some(timer) = self.reconnect_timer.take() {
            reactor.scheduler.cancel(timer);
        }
        self.cancel_idle(reactor);
    }
}

// ---------------------------------------------------------------------------
// Host
// ---------------------------------------------------------------------------

/// A remote endpoint and the downlinks open on it.
pub struct Host {
    link: HostLink,
    downlinks: BTreeMap<LinkKey, DownlinkModel>,
}

impl Host {
    pub(crate) fn new(uri: Url, options: HostOptions) -> Self {
        Self {
            link: HostLink::new(uri, options),
            downlinks: BTreeMap::new(),
        }
    }

    // ── Accessors ───────────────────────────────────────────────────

    pub fn uri(&self) -> &Url {
        &self.link.uri
    }

    pub fn options(&self) -> &HostOptions {
        &self.link.options
    }

    pub fn state(&self) -> ConnectionState {
        self.link.state()
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    /// The id of the current transport, if any.
    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.link.socket.as_ref().map(|socket| socket.id)
    }

    pub fn credentials(&self) -> Option<&Value> {
        self.link.credentials.as_ref()
    }

    /// Body of the last `@authed` response on the current connection.
    pub fn session(&self) -> Option<&Value> {
        self.link.session.as_ref()
    }

    /// Number of commands waiting for a connection.
    pub fn buffered(&self) -> usize {
        self.link.send_buffer.len()
    }

    pub fn is_reconnect_pending(&self) -> bool {
        self.link.reconnect_timer.is_some()
    }

    /// Backoff base of the last scheduled reconnect, before jitter.
    pub fn reconnect_delay(&self) -> Duration {
        self.link.reconnect_delay
    }

    pub fn is_idle_watch_pending(&self) -> bool {
        self.link.idle_timer.is_some()
    }

    pub fn downlink(&self, key: &LinkKey) -> Option<&DownlinkModel> {
        self.downlinks.get(key)
    }

    pub fn downlinks(&self) -> impl Iterator<Item = &DownlinkModel> {
        self.downlinks.values()
    }

    pub fn downlink_count(&self) -> usize {
        self.downlinks.len()
    }

    /// Whether something still needs this connection.
    pub fn wants_reconnect(&self) -> bool {
        self.link.options.keep_open
            || !self.link.send_buffer.is_empty()
            || self.downlinks.values().any(DownlinkModel::keep_linked)
    }

    /// Whether the connection may be closed for lack of use.
    pub fn is_idle(&self) -> bool {
        !self.link.options.keep_open
            && self.link.send_buffer.is_empty()
            && !self
                .downlinks
                .values()
                .any(|model| model.keep_linked() || model.keep_synced())
    }

    /// Whether the registry may drop this host.
    pub fn is_disposable(&self) -> bool {
        self.downlinks.is_empty()
            && self.link.socket.is_none()
            && self.link.reconnect_timer.is_none()
            && self.link.send_buffer.is_empty()
            && !self.link.options.keep_open
    }

    // ── Connection control ──────────────────────────────────────────

    pub(crate) fn open(&mut self, reactor: &mut Reactor) {
        self.link.open(reactor);
    }

    /// Close the transport. With no transport, run the disconnect handling
    /// right away.
    pub(crate) fn close(&mut self, reactor: &mut Reactor) {
        self.link.cancel_timers(reactor);
        match self.link.socket.as_mut() {
            Some(socket) => {
                if socket.state != ConnectionState::Closing {
                    info!("Closing connection to {} ({})", self.link.uri, socket.id);
                    socket.state = ConnectionState::Closing;
                    socket.transport.close();
                }
            }
            None => self.did_disconnect(reactor),
        }
    }

    /// Close every downlink and drop the transport without reconnecting.
    pub(crate) fn shutdown(&mut self, reactor: &mut Reactor) {
        self.link.cancel_timers(reactor);
        for (_, mut model) in std::mem::take(&mut self.downlinks) {
            model.close(reactor);
        }
        self.link.send_buffer.clear();
        if let Some(mut socket) = self.link.socket.take() {
            info!("Shutting down connection to {} ({})", self.link.uri, socket.id);
            socket.transport.close();
        }
        self.link.session = None;
    }

    pub(crate) fn push(&mut self, envelope: Envelope, reactor: &mut Reactor) -> Result<(), WarpError> {
        let result = self.link.push(envelope, reactor);
        self.watch_idle(reactor);
        result
    }

    pub(crate) fn authenticate(&mut self, credentials: Value, reactor: &mut Reactor) {
        self.link.credentials = Some(credentials.clone());
        if self.link.is_connected() {
            self.link
                .transmit(&HostEnvelope::auth(credentials).into(), reactor);
            self.watch_idle(reactor);
        }
    }

    pub(crate) fn deauthenticate(&mut self, reactor: &mut Reactor) {
        self.link.credentials = None;
        if self.link.is_connected() {
            self.link.transmit(&HostEnvelope::deauth().into(), reactor);
            self.watch_idle(reactor);
        }
    }

    /// Reopen if something wants the connection and none exists.
    pub(crate) fn reconnect_if_wanted(&mut self, reactor: &mut Reactor) {
        if self.link.socket.is_none() && self.wants_reconnect() {
            self.link.open(reactor);
        }
    }

    // ── Downlinks ───────────────────────────────────────────────────

    /// Attach a view, creating the model on first use. Returns whether a new
    /// model was created.
    pub(crate) fn open_downlink(
        &mut self,
        key: LinkKey,
        options: LinkOptions,
        id: ViewId,
        view: Box<dyn HostDownlink>,
        reactor: &mut Reactor,
    ) -> bool {
        let unlink_delay = self.link.options.unlink_delay;
        let mut created = false;
        let model = self.downlinks.entry(key.clone()).or_insert_with(|| {
            created = true;
            DownlinkModel::new(self.link.uri.clone(), key, options, unlink_delay)
        });
        model.add_view(id, view, &mut self.link, reactor);
        self.link.open(reactor);
        self.watch_idle(reactor);
        created
    }

    /// Detach a view. Returns `false` if the view was not attached.
    pub(crate) fn remove_view(&mut self, key: &LinkKey, id: ViewId, reactor: &mut Reactor) -> bool {
        let Some(model) = self.downlinks.get_mut(key) else {
            return false;
        };
        let Some(action) = model.remove_view(id, &mut self.link, reactor) else {
            return false;
        };
        if action == ModelAction::Close {
            self.close_model(key, reactor);
        }
        self.watch_idle(reactor);
        true
    }

    /// Drop a model without any wire traffic.
    pub(crate) fn close_downlink(&mut self, key: &LinkKey, reactor: &mut Reactor) -> bool {
        let found = self.close_model(key, reactor);
        self.watch_idle(reactor);
        found
    }

    /// Tear a model down. A live link sends `@unlink` and the model stays
    /// indexed, without views, until `@unlinked` retires it; anything else is
    /// dropped at once.
    pub(crate) fn unlink_downlink(&mut self, key: &LinkKey, reactor: &mut Reactor) -> bool {
        let Some(model) = self.downlinks.get_mut(key) else {
            return false;
        };
        if self.link.is_connected() {
            model.unlink(&mut self.link, reactor);
        }
        if model.status().contains(LinkStatus::UNLINKING) {
            model.detach_views(reactor);
        } else {
            self.close_model(key, reactor);
        }
        self.watch_idle(reactor);
        true
    }

    pub(crate) fn link(&mut self, key: &LinkKey, reactor: &mut Reactor) -> Result<(), WarpError> {
        let model = self
            .downlinks
            .get_mut(key)
            .ok_or_else(|| unknown(&self.link.uri, key))?;
        model.link(&mut self.link, reactor);
        Ok(())
    }

    pub(crate) fn sync(&mut self, key: &LinkKey, reactor: &mut Reactor) -> Result<(), WarpError> {
        let model = self
            .downlinks
            .get_mut(key)
            .ok_or_else(|| unknown(&self.link.uri, key))?;
        model.sync(&mut self.link, reactor);
        Ok(())
    }

    pub(crate) fn unlink(&mut self, key: &LinkKey, reactor: &mut Reactor) -> Result<(), WarpError> {
        let model = self
            .downlinks
            .get_mut(key)
            .ok_or_else(|| unknown(&self.link.uri, key))?;
        model.unlink(&mut self.link, reactor);
        Ok(())
    }

    /// Send a command, echoing it to the matching model's views first.
    pub(crate) fn command(
        &mut self,
        key: &LinkKey,
        body: Value,
        reactor: &mut Reactor,
    ) -> Result<(), WarpError> {
        let result = match self.downlinks.get_mut(key) {
            Some(model) => model.command(body, &mut self.link, reactor),
            None => {
                let message = LinkEnvelope::command(key.node.clone(), key.lane.clone(), body);
                self.link.push(message.into(), reactor)
            }
        };
        self.watch_idle(reactor);
        result
    }

    fn close_model(&mut self, key: &LinkKey, reactor: &mut Reactor) -> bool {
        match self.downlinks.remove(key) {
            Some(mut model) => {
                model.close(reactor);
                true
            }
            None => false,
        }
    }

    // ── Transport events ────────────────────────────────────────────

    pub(crate) fn on_transport_event(
        &mut self,
        id: ConnectionId,
        event: TransportEvent,
        reactor: &mut Reactor,
    ) {
        if self.connection_id() != Some(id) {
            debug!("Ignoring {event:?} from stale {id} on {}", self.link.uri);
            return;
        }
        match event {
            TransportEvent::Opened => self.did_connect(reactor),
            TransportEvent::Message(text) => self.did_receive(&text, reactor),
            TransportEvent::Error(message) => self.did_fail(message, reactor),
            TransportEvent::Closed => {
                self.link.socket = None;
                self.did_disconnect(reactor);
            }
        }
    }

    fn did_connect(&mut self, reactor: &mut Reactor) {
        match self.link.socket.as_mut() {
            Some(socket) if socket.state == ConnectionState::Connecting => {
                socket.state = ConnectionState::Connected;
                info!("Connected to {} ({})", self.link.uri, socket.id);
            }
            _ => {
                debug!("Ignoring open of {}: not connecting", self.link.uri);
                return;
            }
        }
        self.link.reconnect_delay = Duration::ZERO;

        if let Some(credentials) = self.link.credentials.clone() {
            self.link
                .transmit(&HostEnvelope::auth(credentials).into(), reactor);
        }
        for model in self.downlinks.values_mut() {
            model.host_did_connect(&mut self.link, reactor);
        }
        self.link.flush(reactor);
        self.watch_idle(reactor);
    }

    fn did_receive(&mut self, text: &str, reactor: &mut Reactor) {
        trace!("<- {}: {text}", self.link.uri);
        match reactor.codec.parse(text) {
            Some(Envelope::Host(envelope)) => self.on_host_envelope(envelope),
            Some(Envelope::Link(envelope)) => self.on_link_envelope(envelope, reactor),
            None => {
                warn!("Unknown envelope from {}: {text}", self.link.uri);
                reactor.unknown_envelope(&self.link.uri, text);
            }
        }
        self.watch_idle(reactor);
    }

    fn on_host_envelope(&mut self, envelope: HostEnvelope) {
        match envelope.tag() {
            HostTag::Authed => {
                debug!("Authenticated with {}", self.link.uri);
                self.link.session = Some(envelope.body().clone());
            }
            HostTag::Deauthed => {
                debug!("Deauthenticated from {}", self.link.uri);
                self.link.session = None;
            }
            HostTag::Auth | HostTag::Deauth => {
                debug!(
                    "Ignoring inbound @{} from {}",
                    envelope.tag().as_str(),
                    self.link.uri
                );
            }
        }
    }

    fn on_link_envelope(&mut self, envelope: LinkEnvelope, reactor: &mut Reactor) {
        let key = LinkKey::new(
            envelope.node().unresolve(&self.link.uri),
            envelope.lane().clone(),
        );
        let Some(model) = self.downlinks.get_mut(&key) else {
            debug!(
                "No downlink for @{} {key} on {}",
                envelope.tag().as_str(),
                self.link.uri
            );
            return;
        };
        if model.on_envelope(&envelope, &mut self.link, reactor) == ModelAction::Close {
            self.close_model(&key, reactor);
        }
    }

    fn did_fail(&mut self, message: String, reactor: &mut Reactor) {
        let error = WarpError::Transport(message);
        warn!("Connection to {} failed: {error}", self.link.uri);
        if reactor.online {
            if let Some(socket) = self.link.socket.as_mut() {
                if socket.state != ConnectionState::Closing {
                    socket.state = ConnectionState::Closing;
                    socket.transport.close();
                }
            }
            for model in self.downlinks.values_mut() {
                model.host_did_fail(&error);
            }
        } else {
            if let Some(mut socket) = self.link.socket.take() {
                socket.transport.close();
            }
            self.did_disconnect(reactor);
        }
    }

    fn did_disconnect(&mut self, reactor: &mut Reactor) {
        self.link.cancel_idle(reactor);
        self.link.session = None;
        info!("Disconnected from {}", self.link.uri);

        self.downlinks.retain(|_, model| match model.host_did_disconnect() {
            ModelAction::Retain => true,
            ModelAction::Close => {
                model.close(reactor);
                false
            }
        });

        if reactor.online && self.wants_reconnect() {
            self.link.schedule_reconnect(reactor);
        }
    }

    // ── Timers ──────────────────────────────────────────────────────

    pub(crate) fn on_timer(&mut self, id: TimerId, event: TimerEvent, reactor: &mut Reactor) {
        match event {
            TimerEvent::Reconnect { .. } => {
                if self.link.reconnect_timer != Some(id) {
                    return;
                }
                self.link.reconnect_timer = None;
                if reactor.online {
                    self.reconnect_if_wanted(reactor);
                } else {
                    debug!("Offline; not reconnecting to {}", self.link.uri);
                }
            }
            TimerEvent::Idle { .. } => {
                if self.link.idle_timer != Some(id) {
                    return;
                }
                self.link.idle_timer = None;
                if self.link.is_connected() && self.is_idle() {
                    info!("Closing idle connection to {}", self.link.uri);
                    self.close(reactor);
                }
            }
            TimerEvent::Unlink { link: key, .. } => {
                let Some(model) = self.downlinks.get_mut(&key) else {
                    return;
                };
                if model.on_unlink_timer(id, &mut self.link, reactor) == ModelAction::Close {
                    self.close_model(&key, reactor);
                }
                self.watch_idle(reactor);
            }
        }
    }

    /// Re-arm the idle timer if nothing needs the connection.
    fn watch_idle(&mut self, reactor: &mut Reactor) {
        self.link.cancel_idle(reactor);
        if self.link.is_connected() && self.is_idle() {
            let event = TimerEvent::Idle {
                host: self.link.uri.clone(),
            };
            self.link.idle_timer = Some(
                reactor
                    .scheduler
                    .schedule(self.link.options.idle_timeout, event),
            );
        }
    }
}

fn unknown(host: &Url, key: &LinkKey) -> WarpError {
    WarpError::UnknownDownlink(format!("{host} {key}"))
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("uri", &self.link.uri.as_str())
            .field("state", &self.state())
            .field("downlinks", &self.downlinks.len())
            .field("buffered", &self.link.send_buffer.len())
            .finish_non_exhaustive()
    }
}
