//! The `serialize` / `parse` pair a host uses once per message.

use tracing::trace;

use crate::envelope::Envelope;

/// Converts envelopes to and from transport text.
///
/// Both directions are total: `serialize` always produces text, and `parse`
/// returns `None` for text that is not a recognizable envelope rather than
/// failing.
pub trait WireCodec: Send {
    /// Encode an envelope for transmission.
    fn serialize(&self, envelope: &Envelope) -> String;

    /// Decode received text. `None` means "unknown envelope".
    fn parse(&self, text: &str) -> Option<Envelope>;
}

/// JSON encoding of the structural envelope form
/// (see [`Envelope::to_value`]).
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl WireCodec for JsonCodec {
    fn serialize(&self, envelope: &Envelope) -> String {
        envelope.to_value().to_string()
    }

    fn parse(&self, text: &str) -> Option<Envelope> {
        match serde_json::from_str(text) {
            Ok(value) => Envelope::from_value(&value),
            Err(e) => {
                trace!("Unparsable envelope text: {e}");
                None
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
