use std::sync::Arc;

use super::{AnyMessage, MessageRegistry};
use crate::utils::error::CodecError;

/// Hard cap on a received payload. Larger deliveries are dropped.
pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 2 * 1024 * 1024;

/// JSON codec driven by the registry.
///
/// Decoding never panics and never returns a value the caller did not ask
/// for: every failure comes back as a [`CodecError`] and the transports turn
/// it into a dropped delivery.
#[derive(Clone)]
pub struct MessageCodec {
    registry: Arc<MessageRegistry>,
    max_payload_size: usize,
}

impl MessageCodec {
    pub fn new(registry: Arc<MessageRegistry>) -> Self {
        Self {
            registry,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
        }
    }

    pub fn with_max_payload_size(mut self, max: usize) -> Self {
        self.max_payload_size = max;
        self
    }

    pub fn registry(&self) -> &Arc<MessageRegistry> {
        &self.registry
    }

    pub fn max_payload_size(&self) -> usize {
        self.max_payload_size
    }

    /// Fails only when `message` has no registered serializer. The size cap
    /// is enforced by receivers.
    pub fn encode(&self, message: &AnyMessage) -> Result<Vec<u8>, CodecError> {
        let bytes = self
            .registry
            .encode(message)
            .ok_or_else(|| CodecError::Unregistered(message.tag().to_string()))?
            .map_err(|source| CodecError::Serialize {
                tag: message.tag(),
                source,
            })?;
        Ok(bytes)
    }

    pub fn decode(&self, tag: &str, payload: &[u8]) -> Result<AnyMessage, CodecError> {
        if payload.is_empty() {
            return Err(CodecError::Empty);
        }
        self.check_size(payload.len())?;
        let tag = self
            .registry
            .resolve(tag)
            .ok_or_else(|| CodecError::UnknownType(tag.to_string()))?;
        self.registry
            .decode(tag, payload)
            .ok_or_else(|| CodecError::UnknownType(tag.to_string()))?
            .map_err(|source| CodecError::Malformed { tag, source })
    }

    fn check_size(&self, size: usize) -> Result<(), CodecError> {
        if size > self.max_payload_size {
            return Err(CodecError::TooLarge {
                size,
                max: self.max_payload_size,
            });
        }
        Ok(())
    }
}
