//! Protocol error types.

/// Errors raised while building protocol values.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// A node or lane URI was empty or contained whitespace/control characters.
    #[error("Invalid URI: {0:?}")]
    InvalidUri(String),
}
