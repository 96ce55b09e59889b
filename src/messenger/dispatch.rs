//! Process-local fan-out shared by both transports.
//!
//! Listeners are grouped by the type they subscribed to. A delivery is
//! matched against the routable types of its concrete type, so a listener on
//! a supertype sees every subtype. The listener table is snapshotted before
//! any listener runs; a listener may subscribe or cancel from inside its own
//! callback without deadlocking.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::RwLock;
use tracing::error;

use super::{Delivery, ErasedListener, ListenerId, Unsubscribe};
use crate::message::MessageRegistry;

pub(crate) struct Dispatcher {
    registry: Arc<MessageRegistry>,
    listeners: RwLock<HashMap<&'static str, Vec<(ListenerId, ErasedListener)>>>,
    next_id: AtomicU64,
}

impl Dispatcher {
    pub(crate) fn new(registry: Arc<MessageRegistry>) -> Self {
        Self {
            registry,
            listeners: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn add(&self, tag: &'static str, listener: ErasedListener) -> ListenerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .write()
            .entry(tag)
            .or_default()
            .push((id, listener));
        id
    }

    /// Removes one listener and returns how many remain for `tag`.
    pub(crate) fn remove(&self, tag: &str, id: ListenerId) -> usize {
        let mut listeners = self.listeners.write();
        let Some(entries) = listeners.get_mut(tag) else {
            return 0;
        };
        entries.retain(|(existing, _)| *existing != id);
        let remaining = entries.len();
        if remaining == 0 {
            listeners.remove(tag);
        }
        remaining
    }

    pub(crate) fn listener_count(&self, tag: &str) -> usize {
        self.listeners.read().get(tag).map_or(0, Vec::len)
    }

    pub(crate) fn clear(&self) {
        self.listeners.write().clear();
    }

    /// Delivers to listeners of every routable type of the concrete type.
    pub(crate) async fn dispatch(&self, delivery: &Delivery) {
        let tag = delivery.message.tag();
        for &target in self.registry.routable_types(tag) {
            self.dispatch_to(target, delivery).await;
        }
    }

    /// Delivers to listeners registered on exactly `target`.
    pub(crate) async fn dispatch_to(&self, target: &'static str, delivery: &Delivery) {
        let snapshot: Vec<ErasedListener> = match self.listeners.read().get(target) {
            Some(entries) => entries.iter().map(|(_, listener)| listener.clone()).collect(),
            None => return,
        };

        for listener in snapshot {
            let outcome = AssertUnwindSafe(listener(delivery.clone()))
                .catch_unwind()
                .await;
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(err)) => error!(
                    topic = target,
                    concrete = delivery.message.tag(),
                    "Listener failed: {err:#}"
                ),
                Err(_) => error!(
                    topic = target,
                    concrete = delivery.message.tag(),
                    "Listener panicked"
                ),
            }
        }
    }
}

#[async_trait]
impl Unsubscribe for Dispatcher {
    async fn unsubscribe(&self, tag: &'static str, id: ListenerId) {
        self.remove(tag, id);
    }
}
