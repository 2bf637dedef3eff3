//! WebSocket transport built on tokio-tungstenite.
//!
//! Each [`WsConnector::connect`] spawns one task that owns the socket. The
//! task reports `Opened`, forwards text frames as `Message`, reports read
//! and dial failures as `Error`, and always finishes with exactly one
//! `Closed`. Outbound frames reach it through an unbounded channel so
//! [`Transport::send`] never blocks the link layer.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::WarpError;
use crate::transport::{ConnectionId, Connector, Transport, TransportEvent};

/// A transport event tagged with its host and connection.
pub type WsEvent = (Url, ConnectionId, TransportEvent);

/// Map a host URI onto the WebSocket URL to dial.
///
/// `warp` and `http` become `ws`; `warps` and `https` become `wss`.
pub fn to_ws_url(host: &Url) -> Result<String, WarpError> {
    let scheme = match host.scheme() {
        "warp" | "ws" | "http" => "ws",
        "warps" | "wss" | "https" => "wss",
        other => {
            return Err(WarpError::Transport(format!(
                "Unsupported scheme '{other}' in {host}"
            )));
        }
    };
    let rest = &host.as_str()[host.scheme().len()..];
    Ok(format!("{scheme}{rest}"))
}

/// Default bound on the TCP and WebSocket handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Dials hosts over WebSocket. Must be used inside a tokio runtime.
#[derive(Debug, Clone)]
pub struct WsConnector {
    events: mpsc::UnboundedSender<WsEvent>,
    connect_timeout: Duration,
}

impl WsConnector {
    /// Create a connector that reports every connection's events on `events`.
    pub fn new(events: mpsc::UnboundedSender<WsEvent>) -> Self {
        Self {
            events,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Give up on a dial that has not opened within `timeout`.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

impl Connector for WsConnector {
    fn connect(&mut self, uri: &Url, id: ConnectionId) -> Box<dyn Transport> {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_connection(
            uri.clone(),
            id,
            self.connect_timeout,
            outbound_rx,
            self.events.clone(),
        ));
        Box::new(WsTransport { outbound })
    }
}

enum Outbound {
    Text(String),
    Close,
}

struct WsTransport {
    outbound: mpsc::UnboundedSender<Outbound>,
}

impl Transport for WsTransport {
    fn send(&mut self, text: &str) {
        // A closed channel means the task already reported Closed.
        let _ = self.outbound.send(Outbound::Text(text.to_owned()));
    }

    fn close(&mut self) {
        let _ = self.outbound.send(Outbound::Close);
    }
}

async fn run_connection(
    host: Url,
    id: ConnectionId,
    connect_timeout: Duration,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    events: mpsc::UnboundedSender<WsEvent>,
) {
    let emit = |event: TransportEvent| {
        let _ = events.send((host.clone(), id, event));
    };

    let url = match to_ws_url(&host) {
        Ok(url) => url,
        Err(e) => {
            emit(TransportEvent::Error(e.to_string()));
            emit(TransportEvent::Closed);
            return;
        }
    };

    let dial = tokio::time::timeout(connect_timeout, connect_async(url.as_str()));
    tokio::pin!(dial);
    let ws_stream = loop {
        tokio::select! {
            result = &mut dial => {
                let message = match result {
                    Ok(Ok((ws_stream, _))) => break ws_stream,
                    Ok(Err(e)) => format!("Connect to {url} failed: {e}"),
                    Err(_) => format!("Connect to {url} timed out after {connect_timeout:?}"),
                };
                warn!("{message}");
                emit(TransportEvent::Error(message));
                emit(TransportEvent::Closed);
                return;
            }
            frame = outbound.recv() => match frame {
                Some(Outbound::Text(_)) => {
                    debug!("Dropping frame to {url}: still dialing ({id})");
                }
                Some(Outbound::Close) | None => {
                    debug!("Dial to {url} canceled ({id})");
                    emit(TransportEvent::Closed);
                    return;
                }
            },
        }
    };
    info!("WebSocket open to {url} ({id})");
    emit(TransportEvent::Opened);

    let (mut sink, mut stream) = ws_stream.split();
    loop {
        tokio::select! {
            frame = outbound.recv() => match frame {
                Some(Outbound::Text(text)) => {
                    if let Err(e) = sink.send(Message::Text(text.into())).await {
                        emit(TransportEvent::Error(format!("Send error: {e}")));
                        break;
                    }
                }
                Some(Outbound::Close) | None => {
                    debug!("Closing WebSocket to {url} ({id})");
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            },
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    emit(TransportEvent::Message(text.as_str().to_owned()));
                }
                Some(Ok(Message::Ping(data))) => {
                    let _ = sink.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(_))) | None => {
                    debug!("Remote {url} closed ({id})");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    emit(TransportEvent::Error(format!("Read error: {e}")));
                    break;
                }
            },
        }
    }

    emit(TransportEvent::Closed);
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn ws(uri: &str) -> String {
        to_ws_url(&Url::parse(uri).unwrap()).unwrap()
    }

    #[test]
    fn test_warp_schemes() {
        assert_eq!(ws("warp://example.com"), "ws://example.com");
        assert_eq!(ws("warps://example.com:9443/a"), "wss://example.com:9443/a");
    }

    #[test]
    fn test_http_schemes() {
        assert_eq!(ws("http://localhost:3000/"), "ws://localhost:3000/");
        assert_eq!(ws("https://example.com/"), "wss://example.com/");
        assert_eq!(ws("ws://127.0.0.1:9001"), "ws://127.0.0.1:9001/");
    }

    #[test]
    fn test_unsupported_scheme() {
        let err = to_ws_url(&Url::parse("ftp://example.com").unwrap()).unwrap_err();
        assert!(err.to_string().contains("ftp"));
    }

    #[tokio::test]
    async fn test_dial_failure_reports_error_then_closed() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut connector = WsConnector::new(tx);
        let host = Url::parse("warp://127.0.0.1:1").unwrap();
        let _transport = connector.connect(&host, ConnectionId(3));

        let (_, id, first) = rx.recv().await.unwrap();
        assert_eq!(id, ConnectionId(3));
        assert!(matches!(first, TransportEvent::Error(_)));
        let (_, _, second) = rx.recv().await.unwrap();
        assert_eq!(second, TransportEvent::Closed);
    }

    #[tokio::test]
    async fn test_silent_host_times_out() {
        // Accepts TCP into the backlog but never answers the handshake.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut connector =
            WsConnector::new(tx).with_connect_timeout(Duration::from_millis(100));
        let host = Url::parse(&format!("warp://127.0.0.1:{port}")).unwrap();
        let _transport = connector.connect(&host, ConnectionId(1));

        let (_, _, first) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let TransportEvent::Error(message) = first else {
            panic!("expected a dial error, got {first:?}");
        };
        assert!(message.contains("timed out"));
        let (_, _, second) = rx.recv().await.unwrap();
        assert_eq!(second, TransportEvent::Closed);
        drop(listener);
    }

    #[tokio::test]
    async fn test_close_while_dialing_reports_closed() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut connector = WsConnector::new(tx);
        let host = Url::parse(&format!("warp://127.0.0.1:{port}")).unwrap();
        let mut transport = connector.connect(&host, ConnectionId(2));
        transport.close();

        let (_, id, event) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(id, ConnectionId(2));
        assert_eq!(event, TransportEvent::Closed);
        drop(listener);
    }
}
