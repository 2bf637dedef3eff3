//! Registry of the hosts a client talks to and every downlink open
//! on them.
//!
//! [`DownlinkContext`] is a synchronous state machine. It is driven by three
//! kinds of input: caller operations (open a downlink, send a command),
//! [`TransportEvent`]s reported by the connector, and the passage of time via
//! [`DownlinkContext::advance`]. Nothing in here blocks or spawns; the async
//! [`WarpClient`](crate::WarpClient) and the test suite both drive it by hand.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Instant;

use serde_json::Value;
use tracing::{debug, info};
use url::Url;
use warp_protocol::{Envelope, JsonCodec, Uri, WireCodec};

use crate::config::{ClientConfig, HostOptions};
use crate::downlink::{DownlinkModel, LinkKey, LinkOptions};
use crate::error::WarpError;
use crate::host::Host;
use crate::reactor::Reactor;
use crate::scheduler::Scheduler;
use crate::transport::{ConnectionId, Connector, TransportEvent};
use crate::view::{HostDownlink, ViewId};

/// Identity of a downlink: `(host, node, lane)`.
///
/// The node is stored unresolved against the host, so `warp://h/a` and `/a`
/// on host `warp://h` name the same downlink.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DownlinkKey {
    pub host: Url,
    pub node: Uri,
    pub lane: Uri,
}

impl DownlinkKey {
    pub fn new(host: Url, node: Uri, lane: Uri) -> Self {
        let node = node.unresolve(&host);
        Self { host, node, lane }
    }

    /// Parse the three parts of a downlink address.
    pub fn parse(host: &str, node: &str, lane: &str) -> Result<Self, WarpError> {
        let host = Url::parse(host)?;
        let node = Uri::parse(node)?;
        let lane = Uri::parse(lane)?;
        Ok(Self::new(host, node, lane))
    }

    pub(crate) fn link_key(&self) -> LinkKey {
        LinkKey::new(self.node.clone(), self.lane.clone())
    }
}

impl fmt::Display for DownlinkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}#{}", self.host, self.node, self.lane)
    }
}

/// Registry of hosts and their downlinks.
pub struct DownlinkContext {
    options: HostOptions,
    reactor: Reactor,
    hosts: BTreeMap<Url, Host>,
    next_view: u64,
}

impl DownlinkContext {
    /// Create a registry that dials through `connector` and speaks JSON.
    pub fn new(config: ClientConfig, connector: Box<dyn Connector>, now: Instant) -> Self {
        Self::with_codec(config, connector, Box::new(JsonCodec), now)
    }

    pub fn with_codec(
        config: ClientConfig,
        connector: Box<dyn Connector>,
        codec: Box<dyn WireCodec>,
        now: Instant,
    ) -> Self {
        Self {
            options: config.host,
            reactor: Reactor::new(connector, codec, Scheduler::new(now), config.online),
            hosts: BTreeMap::new(),
            next_view: 0,
        }
    }

    // ── Inspection ──────────────────────────────────────────────────

    pub fn host(&self, uri: &Url) -> Option<&Host> {
        self.hosts.get(uri)
    }

    pub fn hosts(&self) -> impl Iterator<Item = &Host> {
        self.hosts.values()
    }

    pub fn downlink(&self, key: &DownlinkKey) -> Option<&DownlinkModel> {
        self.hosts.get(&key.host)?.downlink(&key.link_key())
    }

    /// Number of downlink models across all hosts.
    pub fn downlink_count(&self) -> usize {
        self.hosts.values().map(Host::downlink_count).sum()
    }

    pub fn is_online(&self) -> bool {
        self.reactor.online
    }

    /// The registry's clock.
    pub fn now(&self) -> Instant {
        self.reactor.scheduler.now()
    }

    /// When the next timer is due.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.reactor.scheduler.next_deadline()
    }

    /// Receive inbound text that does not parse as an envelope.
    pub fn set_unknown_envelope_hook<F>(&mut self, hook: F)
    where
        F: FnMut(&Url, &str) + Send + 'static,
    {
        self.reactor.set_unknown_envelope_hook(Box::new(hook));
    }

    // ── Downlinks ───────────────────────────────────────────────────

    /// Attach `view` to the downlink for `key`, creating the downlink (and
    /// the host) on first use.
    pub fn open_downlink(
        &mut self,
        key: &DownlinkKey,
        options: LinkOptions,
        view: Box<dyn HostDownlink>,
    ) -> ViewId {
        let id = ViewId(self.next_view);
        self.next_view += 1;

        let host = host_entry(&mut self.hosts, &self.options, &key.host);
        if host.open_downlink(key.link_key(), options, id, view, &mut self.reactor) {
            debug!("Opened downlink {key}");
        }
        self.reap();
        id
    }

    /// Detach one view. Returns `false` if it was not attached.
    pub fn remove_downlink(&mut self, key: &DownlinkKey, view: ViewId) -> bool {
        let removed = match self.hosts.get_mut(&key.host) {
            Some(host) => host.remove_view(&key.link_key(), view, &mut self.reactor),
            None => false,
        };
        self.reap();
        removed
    }

    /// Drop a downlink and all its views without telling the host.
    pub fn close_downlink(&mut self, key: &DownlinkKey) -> bool {
        let closed = match self.hosts.get_mut(&key.host) {
            Some(host) => host.close_downlink(&key.link_key(), &mut self.reactor),
            None => false,
        };
        self.reap();
        closed
    }

    /// Close all views of a downlink and unlink it on the host. A live link
    /// stays registered until the host answers `@unlinked`.
    pub fn unlink_downlink(&mut self, key: &DownlinkKey) -> bool {
        let unlinked = match self.hosts.get_mut(&key.host) {
            Some(host) => host.unlink_downlink(&key.link_key(), &mut self.reactor),
            None => false,
        };
        self.reap();
        unlinked
    }

    pub fn link(&mut self, key: &DownlinkKey) -> Result<(), WarpError> {
        self.hosts
            .get_mut(&key.host)
            .ok_or_else(|| WarpError::UnknownDownlink(key.to_string()))?
            .link(&key.link_key(), &mut self.reactor)
    }

    pub fn sync(&mut self, key: &DownlinkKey) -> Result<(), WarpError> {
        self.hosts
            .get_mut(&key.host)
            .ok_or_else(|| WarpError::UnknownDownlink(key.to_string()))?
            .sync(&key.link_key(), &mut self.reactor)
    }

    pub fn unlink(&mut self, key: &DownlinkKey) -> Result<(), WarpError> {
        self.hosts
            .get_mut(&key.host)
            .ok_or_else(|| WarpError::UnknownDownlink(key.to_string()))?
            .unlink(&key.link_key(), &mut self.reactor)
    }

    /// Send a command to a lane. Views of an open downlink on that lane see
    /// it first. Fails only on send buffer overflow.
    pub fn command(&mut self, key: &DownlinkKey, body: Value) -> Result<(), WarpError> {
        let host = host_entry(&mut self.hosts, &self.options, &key.host);
        let result = host.command(&key.link_key(), body, &mut self.reactor);
        self.reap();
        result
    }

    // ── Hosts ───────────────────────────────────────────────────────

    /// Send a raw envelope to a host.
    pub fn push(&mut self, host: &Url, envelope: Envelope) -> Result<(), WarpError> {
        let result = host_entry(&mut self.hosts, &self.options, host)
            .push(envelope, &mut self.reactor);
        self.reap();
        result
    }

    /// Connect to a host without opening a downlink.
    pub fn open_host(&mut self, uri: &Url) {
        host_entry(&mut self.hosts, &self.options, uri).open(&mut self.reactor);
        self.reap();
    }

    /// Close a host's connection. Downlinks that want to stay linked bring
    /// it back through the reconnect policy.
    pub fn disconnect(&mut self, uri: &Url) -> bool {
        let found = match self.hosts.get_mut(uri) {
            Some(host) => {
                host.close(&mut self.reactor);
                true
            }
            None => false,
        };
        self.reap();
        found
    }

    /// Close every downlink on a host and drop it from the registry.
    pub fn close_host(&mut self, uri: &Url) -> bool {
        match self.hosts.remove(uri) {
            Some(mut host) => {
                host.shutdown(&mut self.reactor);
                info!("Closed host {uri}");
                true
            }
            None => false,
        }
    }

    /// Close every host.
    pub fn close(&mut self) {
        for (uri, mut host) in std::mem::take(&mut self.hosts) {
            host.shutdown(&mut self.reactor);
            debug!("Closed host {uri}");
        }
    }

    /// Store credentials for a host and send them, connecting if needed.
    pub fn authenticate(&mut self, uri: &Url, credentials: Value) {
        let host = host_entry(&mut self.hosts, &self.options, uri);
        host.authenticate(credentials, &mut self.reactor);
        host.open(&mut self.reactor);
        self.reap();
    }

    pub fn deauthenticate(&mut self, uri: &Url) {
        if let Some(host) = self.hosts.get_mut(uri) {
            host.deauthenticate(&mut self.reactor);
        }
        self.reap();
    }

    /// Flip the process-level online flag. Going online reopens every host
    /// that still needs its connection.
    pub fn set_online(&mut self, online: bool) {
        if self.reactor.online == online {
            return;
        }
        self.reactor.online = online;
        info!("Network is {}", if online { "online" } else { "offline" });
        if online {
            for host in self.hosts.values_mut() {
                host.reconnect_if_wanted(&mut self.reactor);
            }
        }
        self.reap();
    }

    // ── Drivers ─────────────────────────────────────────────────────

    /// Feed a lifecycle event from the connector.
    pub fn on_transport_event(&mut self, host: &Url, id: ConnectionId, event: TransportEvent) {
        match self.hosts.get_mut(host) {
            Some(host) => host.on_transport_event(id, event, &mut self.reactor),
            None => debug!("Ignoring {event:?} from {id}: no host {host}"),
        }
        self.reap();
    }

    /// Move the clock to `now`, firing every timer due by then.
    pub fn advance(&mut self, now: Instant) {
        while let Some((id, event)) = self.reactor.scheduler.pop_due(now) {
            if let Some(host) = self.hosts.get_mut(event.host()) {
                host.on_timer(id, event, &mut self.reactor);
            }
        }
        self.reap();
    }

    // ── Internals ───────────────────────────────────────────────────

    fn reap(&mut self) {
        self.hosts.retain(|uri, host| {
            let keep = !host.is_disposable();
            if !keep {
                debug!("Dropped host {uri}");
            }
            keep
        });
    }
}

fn host_entry<'a>(
    hosts: &'a mut BTreeMap<Url, Host>,
    options: &HostOptions,
    uri: &Url,
) -> &'a mut Host {
    hosts.entry(uri.clone()).or_insert_with(|| {
        debug!("Created host {uri}");
        Host::new(uri.clone(), options.clone())
    })
}

impl fmt::Debug for DownlinkContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownlinkContext")
            .field("hosts", &self.hosts)
            .field("online", &self.reactor.online)
            .field("timers", &self.reactor.scheduler.len())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
