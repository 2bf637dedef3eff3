//! WARP client: the link layer between local subscribers and remote WARP
//! hosts.
//!
//! # Architecture
//!
//! - **Host**: one transport connection per remote endpoint, with command
//!   buffering, credentials, reconnect backoff and idle close.
//! - **DownlinkModel**: the link state machine for one `(host, node, lane)`,
//!   multiplexed across any number of local views.
//! - **DownlinkContext**: the registry of hosts and downlinks. Synchronous
//!   and driven by caller operations, transport events and explicit time.
//! - **WarpClient**: a tokio task that owns a context and connects over
//!   WebSocket (`tokio-tungstenite`).
//!
//! # Quick start
//!
//! ```rust,no_run
//! use warp_client::{ClientConfig, DownlinkEvent, DownlinkRequest, WarpClient};
//!
//! # async fn example() -> Result<(), warp_client::WarpError> {
//! let client = WarpClient::new(ClientConfig::default());
//! let request = DownlinkRequest::new("warp://localhost:9001", "/unit/house", "lights")?
//!     .keep_synced(true);
//! let mut downlink = client.open_downlink(request).await?;
//!
//! while let Some(event) = downlink.recv().await {
//!     if let DownlinkEvent::Event(body) = event {
//!         println!("lights: {body}");
//!     }
//! }
//! client.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod context;
pub mod downlink;
pub mod error;
pub mod host;
pub mod logging;
pub mod memory;
mod reactor;
pub mod scheduler;
pub mod transport;
pub mod view;
pub mod ws;

// ── Re-exports for convenience ──────────────────────────────────────────

pub use client::{Downlink, DownlinkRequest, WarpClient};
pub use config::{ClientConfig, HostOptions};
pub use context::{DownlinkContext, DownlinkKey};
pub use downlink::{DownlinkModel, LinkKey, LinkOptions, LinkStatus};
pub use error::WarpError;
pub use host::Host;
pub use memory::MemoryConnector;
pub use reactor::UnknownEnvelopeHook;
pub use scheduler::{Scheduler, TimerEvent, TimerId};
pub use transport::{ConnectionId, ConnectionState, Connector, Transport, TransportEvent};
pub use view::{ChannelView, DownlinkEvent, HostDownlink, ViewId};
pub use ws::WsConnector;
pub use warp_protocol;
