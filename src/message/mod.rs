//! Typed messages and the machinery that routes them by type.
//!
//! A message is any serde value with a stable tag. Producers hand typed
//! values to a messenger; internally they travel as [`AnyMessage`] so the
//! transports never need to know concrete types. The [`MessageRegistry`]
//! knows the declared hierarchy and turns tags back into values.

pub mod codec;
pub mod registry;

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;

pub use codec::{DEFAULT_MAX_PAYLOAD_SIZE, MessageCodec};
pub use registry::{MessageRegistry, MessageRegistryBuilder};

/// A value that can be published on the bus.
///
/// `TAG` is the wire name of the type and doubles as the broker destination,
/// so it must be stable across builds, e.g. `"tidings.security.BanMessage"`.
pub trait Message: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const TAG: &'static str;
}

/// A message with its concrete type erased.
#[derive(Clone)]
pub struct AnyMessage {
    tag: &'static str,
    value: Arc<dyn Any + Send + Sync>,
}

impl AnyMessage {
    pub fn new<M: Message>(message: M) -> Self {
        Self {
            tag: M::TAG,
            value: Arc::new(message),
        }
    }

    pub(crate) fn from_parts(tag: &'static str, value: Arc<dyn Any + Send + Sync>) -> Self {
        Self { tag, value }
    }

    /// Tag of the concrete type.
    pub fn tag(&self) -> &'static str {
        self.tag
    }

    /// Borrows the value if the concrete type is exactly `M`.
    pub fn downcast_ref<M: Message>(&self) -> Option<&M> {
        self.value.downcast_ref::<M>()
    }

    pub(crate) fn value(&self) -> &(dyn Any + Send + Sync) {
        &*self.value
    }
}

impl fmt::Debug for AnyMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnyMessage").field("tag", &self.tag).finish()
    }
}

#[cfg(test)]
mod tests;
