//! Async client that runs a [`DownlinkContext`] inside one tokio task.
//!
//! Every input to the link layer is serialized through a single
//! `tokio::select!` loop: commands from [`WarpClient`] and [`Downlink`]
//! handles, transport events from the [`WsConnector`] tasks, and timer
//! deadlines. Handles talk to the loop over an unbounded mpsc channel and
//! get answers back on oneshot channels.

use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};
use url::Url;

use crate::config::ClientConfig;
use crate::context::{DownlinkContext, DownlinkKey};
use crate::downlink::LinkOptions;
use crate::error::WarpError;
use crate::view::{ChannelView, DownlinkEvent, HostDownlink, ViewId};
use crate::ws::{WsConnector, WsEvent};

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Parameters for [`WarpClient::open_downlink`].
#[derive(Debug, Clone)]
pub struct DownlinkRequest {
    key: DownlinkKey,
    keep_linked: bool,
    keep_synced: bool,
    options: LinkOptions,
}

impl DownlinkRequest {
    pub fn new(host: &str, node: &str, lane: &str) -> Result<Self, WarpError> {
        Ok(Self::from_key(DownlinkKey::parse(host, node, lane)?))
    }

    /// A linked, unsynced request with default priority, rate and body.
    pub fn from_key(key: DownlinkKey) -> Self {
        Self {
            key,
            keep_linked: true,
            keep_synced: false,
            options: LinkOptions::default(),
        }
    }

    pub fn keep_linked(mut self, keep_linked: bool) -> Self {
        self.keep_linked = keep_linked;
        self
    }

    pub fn keep_synced(mut self, keep_synced: bool) -> Self {
        self.keep_synced = keep_synced;
        self
    }

    pub fn prio(mut self, prio: f64) -> Self {
        self.options.prio = prio;
        self
    }

    pub fn rate(mut self, rate: f64) -> Self {
        self.options.rate = rate;
        self
    }

    pub fn body(mut self, body: Value) -> Self {
        self.options.body = body;
        self
    }

    pub fn key(&self) -> &DownlinkKey {
        &self.key
    }
}

enum ClientCommand {
    OpenDownlink {
        key: DownlinkKey,
        options: LinkOptions,
        view: Box<dyn HostDownlink>,
        reply: oneshot::Sender<ViewId>,
    },
    RemoveView {
        key: DownlinkKey,
        view: ViewId,
    },
    Command {
        key: DownlinkKey,
        body: Value,
        reply: oneshot::Sender<Result<(), WarpError>>,
    },
    Authenticate {
        host: Url,
        credentials: Value,
    },
    Deauthenticate {
        host: Url,
    },
    SetOnline(bool),
    CloseHost {
        host: Url,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

// ---------------------------------------------------------------------------
// WarpClient
// ---------------------------------------------------------------------------

/// Handle to the client task. Clones share the task.
#[derive(Debug, Clone)]
pub struct WarpClient {
    commands: mpsc::UnboundedSender<ClientCommand>,
}

impl WarpClient {
    /// Spawn a client that connects over WebSocket. Must be called inside a
    /// tokio runtime.
    pub fn new(config: ClientConfig) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let connector =
            WsConnector::new(event_tx).with_connect_timeout(config.host.max_reconnect_timeout);
        let context = DownlinkContext::new(config, Box::new(connector), Instant::now());
        Self::spawn(context, event_rx)
    }

    /// Spawn a client around an existing registry whose connector reports on
    /// `events`.
    pub fn spawn(context: DownlinkContext, events: mpsc::UnboundedReceiver<WsEvent>) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        tokio::spawn(run(context, command_rx, events));
        Self { commands }
    }

    fn send(&self, command: ClientCommand) -> Result<(), WarpError> {
        self.commands
            .send(command)
            .map_err(|_| WarpError::ClientClosed)
    }

    /// Subscribe to a lane.
    pub async fn open_downlink(&self, request: DownlinkRequest) -> Result<Downlink, WarpError> {
        let (view, events) = ChannelView::new(request.keep_linked, request.keep_synced);
        let (reply, rx) = oneshot::channel();
        self.send(ClientCommand::OpenDownlink {
            key: request.key.clone(),
            options: request.options,
            view: Box::new(view),
            reply,
        })?;
        let view = rx.await.map_err(|_| WarpError::ClientClosed)?;
        Ok(Downlink {
            key: request.key,
            view,
            events,
            commands: self.commands.clone(),
            detached: false,
        })
    }

    /// Send a command to a lane, with or without an open downlink.
    pub async fn command(&self, key: &DownlinkKey, body: Value) -> Result<(), WarpError> {
        send_command(&self.commands, key.clone(), body).await
    }

    pub fn authenticate(&self, host: &Url, credentials: Value) -> Result<(), WarpError> {
        self.send(ClientCommand::Authenticate {
            host: host.clone(),
            credentials,
        })
    }

    pub fn deauthenticate(&self, host: &Url) -> Result<(), WarpError> {
        self.send(ClientCommand::Deauthenticate { host: host.clone() })
    }

    pub fn set_online(&self, online: bool) -> Result<(), WarpError> {
        self.send(ClientCommand::SetOnline(online))
    }

    /// Close every downlink on `host` and disconnect.
    pub fn close_host(&self, host: &Url) -> Result<(), WarpError> {
        self.send(ClientCommand::CloseHost { host: host.clone() })
    }

    /// Close every host and stop the client task.
    pub async fn shutdown(&self) -> Result<(), WarpError> {
        let (reply, rx) = oneshot::channel();
        self.send(ClientCommand::Shutdown { reply })?;
        rx.await.map_err(|_| WarpError::ClientClosed)
    }
}

async fn send_command(
    commands: &mpsc::UnboundedSender<ClientCommand>,
    key: DownlinkKey,
    body: Value,
) -> Result<(), WarpError> {
    let (reply, rx) = oneshot::channel();
    commands
        .send(ClientCommand::Command { key, body, reply })
        .map_err(|_| WarpError::ClientClosed)?;
    rx.await.map_err(|_| WarpError::ClientClosed)?
}

// ---------------------------------------------------------------------------
// Downlink handle
// ---------------------------------------------------------------------------

/// One subscription opened through [`WarpClient::open_downlink`]. Dropping
/// it detaches the view.
#[derive(Debug)]
pub struct Downlink {
    key: DownlinkKey,
    view: ViewId,
    events: mpsc::UnboundedReceiver<DownlinkEvent>,
    commands: mpsc::UnboundedSender<ClientCommand>,
    detached: bool,
}

impl Downlink {
    pub fn key(&self) -> &DownlinkKey {
        &self.key
    }

    pub fn view_id(&self) -> ViewId {
        self.view
    }

    /// Next notification. `None` once the view is closed and drained.
    pub async fn recv(&mut self) -> Option<DownlinkEvent> {
        self.events.recv().await
    }

    pub fn try_recv(&mut self) -> Option<DownlinkEvent> {
        self.events.try_recv().ok()
    }

    /// Send a command on this downlink's lane.
    pub async fn command(&self, body: Value) -> Result<(), WarpError> {
        send_command(&self.commands, self.key.clone(), body).await
    }

    /// Detach the view.
    pub fn close(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        if self.detached {
            return;
        }
        self.detached = true;
        let _ = self.commands.send(ClientCommand::RemoveView {
            key: self.key.clone(),
            view: self.view,
        });
    }
}

impl Drop for Downlink {
    fn drop(&mut self) {
        self.detach();
    }
}

impl std::fmt::Debug for ClientCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ClientCommand::OpenDownlink { .. } => "OpenDownlink",
            ClientCommand::RemoveView { .. } => "RemoveView",
            ClientCommand::Command { .. } => "Command",
            ClientCommand::Authenticate { .. } => "Authenticate",
            ClientCommand::Deauthenticate { .. } => "Deauthenticate",
            ClientCommand::SetOnline(_) => "SetOnline",
            ClientCommand::CloseHost { .. } => "CloseHost",
            ClientCommand::Shutdown { .. } => "Shutdown",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// Event loop
// ---------------------------------------------------------------------------

async fn run(
    mut context: DownlinkContext,
    mut commands: mpsc::UnboundedReceiver<ClientCommand>,
    mut events: mpsc::UnboundedReceiver<WsEvent>,
) {
    info!("WARP client started");
    loop {
        let deadline = context.next_deadline();
        let wake = deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

        tokio::select! {
            command = commands.recv() => {
                context.advance(Instant::now());
                match command {
                    Some(ClientCommand::Shutdown { reply }) => {
                        context.close();
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => handle(&mut context, command),
                    None => {
                        debug!("All client handles dropped");
                        context.close();
                        break;
                    }
                }
            }
            Some((host, id, event)) = events.recv() => {
                context.advance(Instant::now());
                context.on_transport_event(&host, id, event);
            }
            _ = tokio::time::sleep_until(wake.into()), if deadline.is_some() => {
                context.advance(Instant::now());
            }
        }
    }
    info!("WARP client stopped");
}

fn handle(context: &mut DownlinkContext, command: ClientCommand) {
    debug!("Client command: {command:?}");
    match command {
        ClientCommand::OpenDownlink {
            key,
            options,
            view,
            reply,
        } => {
            let id = context.open_downlink(&key, options, view);
            let _ = reply.send(id);
        }
        ClientCommand::RemoveView { key, view } => {
            context.remove_downlink(&key, view);
        }
        ClientCommand::Command { key, body, reply } => {
            let _ = reply.send(context.command(&key, body));
        }
        ClientCommand::Authenticate { host, credentials } => {
            context.authenticate(&host, credentials);
        }
        ClientCommand::Deauthenticate { host } => context.deauthenticate(&host),
        ClientCommand::SetOnline(online) => context.set_online(online),
        ClientCommand::CloseHost { host } => {
            context.close_host(&host);
        }
        ClientCommand::Shutdown { .. } => {}
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_request_builder() {
        let request = DownlinkRequest::new("warp://example.com", "/unit", "info")
            .unwrap()
            .keep_synced(true)
            .prio(2.0)
            .rate(0.5)
            .body(json!({"q": 1}));

        assert!(request.keep_linked);
        assert!(request.keep_synced);
        assert_eq!(request.options.prio, 2.0);
        assert_eq!(request.options.rate, 0.5);
        assert_eq!(request.options.body, json!({"q": 1}));
        assert_eq!(request.key().lane.as_str(), "info");
    }

    #[test]
    fn test_request_rejects_bad_host() {
        assert!(DownlinkRequest::new("::", "/unit", "info").is_err());
    }

    #[tokio::test]
    async fn test_calls_after_shutdown_fail() {
        let client = WarpClient::new(ClientConfig::default());
        client.shutdown().await.unwrap();

        let request = DownlinkRequest::new("warp://127.0.0.1:1", "/unit", "info").unwrap();
        assert!(matches!(
            client.open_downlink(request).await,
            Err(WarpError::ClientClosed)
        ));
    }
}
