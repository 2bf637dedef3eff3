//! Node and lane URIs.
//!
//! WARP addresses a node by URI (`/unit/house` or `warp://host:9001/unit/house`)
//! and a lane by a usually-relative URI (`lights`). Relative and absolute
//! forms are both legal on the wire, so [`Uri`] keeps the original text and
//! only classifies it.

use std::fmt;
use std::str::FromStr;

use url::Url;

use crate::error::ProtocolError;

/// An absolute or relative URI naming a node or a lane.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Uri(String);

impl Uri {
    /// Parse a node or lane URI.
    ///
    /// Any non-empty text without whitespace or control characters is
    /// accepted. Whether the result is absolute is decided by
    /// [`is_absolute`](Uri::is_absolute).
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        if text.is_empty() || text.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(ProtocolError::InvalidUri(text.to_string()));
        }
        Ok(Self(text.to_string()))
    }

    /// The URI text exactly as given.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the URI carries a scheme.
    pub fn is_absolute(&self) -> bool {
        Url::parse(&self.0).is_ok()
    }

    /// Whether the URI is relative to some base.
    pub fn is_relative(&self) -> bool {
        !self.is_absolute()
    }

    /// Strip an absolute URI that points into `base`'s authority down to its
    /// path (and query). Anything else is returned unchanged.
    pub fn unresolve(&self, base: &Url) -> Uri {
        let Ok(absolute) = Url::parse(&self.0) else {
            return self.clone();
        };
        let same_authority = absolute.scheme() == base.scheme()
            && absolute.host_str() == base.host_str()
            && absolute.port_or_known_default() == base.port_or_known_default();
        if !same_authority {
            return self.clone();
        }

        let mut relative = absolute.path().to_string();
        if let Some(query) = absolute.query() {
            relative.push('?');
            relative.push_str(query);
        }
        if relative.is_empty() {
            relative.push('/');
        }
        Uri(relative)
    }

    /// Resolve this URI against `base`.
    pub fn resolve(&self, base: &Url) -> Result<Url, ProtocolError> {
        base.join(&self.0)
            .map_err(|_| ProtocolError::InvalidUri(self.0.clone()))
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Uri {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<&str> for Uri {
    type Error = ProtocolError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl AsRef<str> for Uri {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
