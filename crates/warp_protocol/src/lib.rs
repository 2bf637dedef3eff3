//! WARP protocol model: envelopes, node and lane URIs, and the wire codec seam.
//!
//! A WARP host exposes *lanes* on addressable *nodes*. Clients exchange
//! [`Envelope`]s with the host over a message-oriented transport:
//!
//! - **Host-addressed** envelopes (`@auth`, `@authed`, `@deauth`,
//!   `@deauthed`) carry only a body.
//! - **Link-addressed** envelopes (`@link`, `@linked`, `@sync`, `@synced`,
//!   `@unlink`, `@unlinked`, `@event`, `@command`) also carry the target
//!   node and lane plus a priority and rate.
//!
//! The textual encoding is pluggable through [`WireCodec`]; [`JsonCodec`] is
//! the default.
//!
//! ```rust
//! use warp_protocol::{Envelope, JsonCodec, LinkEnvelope, LinkTag, Uri, WireCodec};
//!
//! let node = Uri::parse("/unit/house").unwrap();
//! let lane = Uri::parse("lights").unwrap();
//! let request: Envelope = LinkEnvelope::new(LinkTag::Sync, node, lane).into();
//!
//! let codec = JsonCodec;
//! let text = codec.serialize(&request);
//! assert_eq!(codec.parse(&text), Some(request));
//! ```

pub mod codec;
pub mod envelope;
pub mod error;
pub mod uri;

// ── Re-exports for convenience ──────────────────────────────────────────

pub use codec::{JsonCodec, WireCodec};
pub use envelope::{Envelope, HostEnvelope, HostTag, LinkEnvelope, LinkTag};
pub use error::ProtocolError;
pub use uri::Uri;
