//! The closed set of WARP wire messages.
//!
//! Envelopes are immutable values. Derived copies (`with_node`, `with_body`,
//! ...) return new instances. Equality and hashing are structural over every
//! field, including the tag, so two envelopes with different tags are never
//! equal.

use std::hash::{Hash, Hasher};

use serde_json::{Map, Value};

use crate::uri::Uri;

/// Tags of envelopes addressed to the host as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HostTag {
    /// Client presents credentials.
    Auth,
    /// Host accepted the credentials; body is the session.
    Authed,
    /// Client drops its credentials.
    Deauth,
    /// Host acknowledged (or forced) deauthentication.
    Deauthed,
}

impl HostTag {
    /// All host-addressed tags.
    pub const ALL: [HostTag; 4] = [Self::Auth, Self::Authed, Self::Deauth, Self::Deauthed];

    /// The tag name used on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Authed => "authed",
            Self::Deauth => "deauth",
            Self::Deauthed => "deauthed",
        }
    }

    /// Look up a tag by its wire name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|tag| tag.as_str() == name)
    }
}

/// Tags of envelopes addressed to a `(node, lane)` link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LinkTag {
    // ── Requests (client → host) ────────────────────────────────────
    /// Open a link to a lane.
    Link,
    /// Open a link and replay the lane's current state.
    Sync,
    /// Tear down a link.
    Unlink,

    // ── Responses (host → client) ───────────────────────────────────
    /// The link is open.
    Linked,
    /// State replay has finished.
    Synced,
    /// The link is closed.
    Unlinked,

    // ── Messages ────────────────────────────────────────────────────
    /// Lane event from the host.
    Event,
    /// Command to the lane.
    Command,
}

impl LinkTag {
    /// All link-addressed tags.
    pub const ALL: [LinkTag; 8] = [
        Self::Link,
        Self::Sync,
        Self::Unlink,
        Self::Linked,
        Self::Synced,
        Self::Unlinked,
        Self::Event,
        Self::Command,
    ];

    /// The tag name used on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Link => "link",
            Self::Sync => "sync",
            Self::Unlink => "unlink",
            Self::Linked => "linked",
            Self::Synced => "synced",
            Self::Unlinked => "unlinked",
            Self::Event => "event",
            Self::Command => "command",
        }
    }

    /// Look up a tag by its wire name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|tag| tag.as_str() == name)
    }

    /// Whether this tag is a link request sent by a client.
    pub fn is_request(self) -> bool {
        matches!(self, Self::Link | Self::Sync | Self::Unlink)
    }

    /// Whether this tag is a link response sent by a host.
    pub fn is_response(self) -> bool {
        matches!(self, Self::Linked | Self::Synced | Self::Unlinked)
    }
}

// ---------------------------------------------------------------------------
// Host-addressed envelopes
// ---------------------------------------------------------------------------

/// An envelope addressed to the host: a tag and a body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEnvelope {
    tag: HostTag,
    body: Value,
}

impl HostEnvelope {
    /// Create a host-addressed envelope.
    pub fn new(tag: HostTag, body: Value) -> Self {
        Self { tag, body }
    }

    /// An `@auth` request carrying credentials.
    pub fn auth(credentials: Value) -> Self {
        Self::new(HostTag::Auth, credentials)
    }

    /// A `@deauth` request.
    pub fn deauth() -> Self {
        Self::new(HostTag::Deauth, Value::Null)
    }

    pub fn tag(&self) -> HostTag {
        self.tag
    }

    pub fn body(&self) -> &Value {
        &self.body
    }

    /// A copy of this envelope with a different body.
    pub fn with_body(&self, body: Value) -> Self {
        Self::new(self.tag, body)
    }
}

impl Hash for HostEnvelope {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.tag.hash(state);
        hash_body(&self.body, state);
    }
}

// ---------------------------------------------------------------------------
// Link-addressed envelopes
// ---------------------------------------------------------------------------

/// An envelope addressed to one lane of one node.
#[derive(Debug, Clone)]
pub struct LinkEnvelope {
    tag: LinkTag,
    node: Uri,
    lane: Uri,
    prio: f64,
    rate: f64,
    body: Value,
}

impl LinkEnvelope {
    /// Create a link-addressed envelope with default prio, rate and body.
    pub fn new(tag: LinkTag, node: Uri, lane: Uri) -> Self {
        Self {
            tag,
            node,
            lane,
            prio: 0.0,
            rate: 0.0,
            body: Value::Null,
        }
    }

    /// A `@command` message carrying `body`.
    pub fn command(node: Uri, lane: Uri, body: Value) -> Self {
        Self::new(LinkTag::Command, node, lane).with_body(body)
    }

    /// An `@event` message carrying `body`.
    pub fn event(node: Uri, lane: Uri, body: Value) -> Self {
        Self::new(LinkTag::Event, node, lane).with_body(body)
    }

    pub fn tag(&self) -> LinkTag {
        self.tag
    }

    pub fn node(&self) -> &Uri {
        &self.node
    }

    pub fn lane(&self) -> &Uri {
        &self.lane
    }

    pub fn prio(&self) -> f64 {
        self.prio
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn body(&self) -> &Value {
        &self.body
    }

    /// A copy of this envelope with a different tag.
    pub fn with_tag(&self, tag: LinkTag) -> Self {
        Self { tag, ..self.clone() }
    }

    /// A copy of this envelope addressed to a different node.
    pub fn with_node(&self, node: Uri) -> Self {
        Self { node, ..self.clone() }
    }

    /// A copy of this envelope addressed to a different lane.
    pub fn with_lane(&self, lane: Uri) -> Self {
        Self { lane, ..self.clone() }
    }

    /// A copy of this envelope with a different priority. Non-finite values
    /// become 0.
    pub fn with_prio(&self, prio: f64) -> Self {
        Self {
            prio: finite_or_zero(prio),
            ..self.clone()
        }
    }

    /// A copy of this envelope with a different rate. Non-finite values
    /// become 0.
    pub fn with_rate(&self, rate: f64) -> Self {
        Self {
            rate: finite_or_zero(rate),
            ..self.clone()
        }
    }

    /// A copy of this envelope with a different body.
    pub fn with_body(&self, body: Value) -> Self {
        Self { body, ..self.clone() }
    }
}

impl PartialEq for LinkEnvelope {
    fn eq(&self, other: &Self) -> bool {
        self.tag == other.tag
            && self.node == other.node
            && self.lane == other.lane
            && self.prio.to_bits() == other.prio.to_bits()
            && self.rate.to_bits() == other.rate.to_bits()
            && self.body == other.body
    }
}

impl Eq for LinkEnvelope {}

impl Hash for LinkEnvelope {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.tag.hash(state);
        self.node.hash(state);
        self.lane.hash(state);
        self.prio.to_bits().hash(state);
        self.rate.to_bits().hash(state);
        hash_body(&self.body, state);
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// One WARP wire message.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Envelope {
    Host(HostEnvelope),
    Link(LinkEnvelope),
}

impl Envelope {
    /// The wire name of this envelope's tag.
    pub fn tag_name(&self) -> &'static str {
        match self {
            Self::Host(envelope) => envelope.tag.as_str(),
            Self::Link(envelope) => envelope.tag.as_str(),
        }
    }

    pub fn body(&self) -> &Value {
        match self {
            Self::Host(envelope) => &envelope.body,
            Self::Link(envelope) => &envelope.body,
        }
    }

    /// Whether this is a `@command` message. Only commands are buffered
    /// while a host is disconnected.
    pub fn is_command(&self) -> bool {
        matches!(self, Self::Link(envelope) if envelope.tag == LinkTag::Command)
    }

    /// A copy of this envelope with a different body.
    pub fn with_body(&self, body: Value) -> Self {
        match self {
            Self::Host(envelope) => Self::Host(envelope.with_body(body)),
            Self::Link(envelope) => Self::Link(envelope.with_body(body)),
        }
    }

    /// Convert to the structural form: `{"@tag": {header}, "body": ...}`.
    ///
    /// Defaulted fields (prio 0, rate 0, absent body) are omitted.
    pub fn to_value(&self) -> Value {
        let mut header = Map::new();
        let (tag, body) = match self {
            Self::Host(envelope) => (envelope.tag.as_str(), &envelope.body),
            Self::Link(envelope) => {
                header.insert("node".into(), Value::String(envelope.node.as_str().into()));
                header.insert("lane".into(), Value::String(envelope.lane.as_str().into()));
                if envelope.prio != 0.0 {
                    header.insert("prio".into(), Value::from(envelope.prio));
                }
                if envelope.rate != 0.0 {
                    header.insert("rate".into(), Value::from(envelope.rate));
                }
                (envelope.tag.as_str(), &envelope.body)
            }
        };

        let mut object = Map::new();
        object.insert(format!("@{tag}"), Value::Object(header));
        if !body.is_null() {
            object.insert("body".into(), body.clone());
        }
        Value::Object(object)
    }

    /// Recover an envelope from its structural form.
    ///
    /// Returns `None` for unknown tags, a missing or malformed node/lane on
    /// a link-addressed tag, or any shape other than one `@tag` key plus an
    /// optional `body`.
    pub fn from_value(value: &Value) -> Option<Self> {
        let object = value.as_object()?;
        let mut tag_entry = None;
        for (key, field) in object {
            match key.strip_prefix('@') {
                Some(name) if tag_entry.is_none() => tag_entry = Some((name, field)),
                Some(_) => return None,
                None if key == "body" => {}
                None => return None,
            }
        }
        let (name, header) = tag_entry?;
        let body = object.get("body").cloned().unwrap_or(Value::Null);

        if let Some(tag) = HostTag::from_name(name) {
            if !(header.is_object() || header.is_null()) {
                return None;
            }
            return Some(Self::Host(HostEnvelope::new(tag, body)));
        }

        let tag = LinkTag::from_name(name)?;
        let header = header.as_object()?;
        let node = Uri::parse(header.get("node")?.as_str()?).ok()?;
        let lane = Uri::parse(header.get("lane")?.as_str()?).ok()?;
        let prio = optional_number(header.get("prio"))?;
        let rate = optional_number(header.get("rate"))?;

        Some(Self::Link(
            LinkEnvelope::new(tag, node, lane)
                .with_prio(prio)
                .with_rate(rate)
                .with_body(body),
        ))
    }
}

impl From<HostEnvelope> for Envelope {
    fn from(envelope: HostEnvelope) -> Self {
        Self::Host(envelope)
    }
}

impl From<LinkEnvelope> for Envelope {
    fn from(envelope: LinkEnvelope) -> Self {
        Self::Link(envelope)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Also folds `-0.0` into `0.0` so the omitted-default form round-trips.
fn finite_or_zero(value: f64) -> f64 {
    if value.is_finite() && value != 0.0 {
        value
    } else {
        0.0
    }
}

/// `None` means the field was present but not a number.
fn optional_number(field: Option<&Value>) -> Option<f64> {
    match field {
        None | Some(Value::Null) => Some(0.0),
        Some(value) => value.as_f64(),
    }
}

/// `serde_json::Value` has no `Hash`; its canonical text is hashed instead.
fn hash_body<H: Hasher>(body: &Value, state: &mut H) {
    body.to_string().hash(state);
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
