use crate::messaging::domain::Envelope;
use crate::shared::error::{MessengerError, Result};

/// Converts envelopes to and from the wire representation.
///
/// Implementations must be deterministic for a given envelope and must
/// round-trip: `decode(encode(x)) == x`.
pub trait Codec: Send + Sync {
    fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>>;
    fn decode(&self, bytes: &[u8]) -> Result<Envelope>;
}

/// JSON wire format.
///
/// serde_json keeps object keys sorted, so encoding is deterministic for a
/// given envelope.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl JsonCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Codec for JsonCodec {
    fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>> {
        serde_json::to_vec(envelope).map_err(MessengerError::Codec)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Envelope> {
        serde_json::from_slice(bytes).map_err(MessengerError::Codec)
    }
}
