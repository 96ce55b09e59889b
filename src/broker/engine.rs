//! Broker engine
//!
//! This module contains the in-memory broker responsible for:
//! - binding consumers to destinations and unbinding them again
//! - copying each published message to every consumer of its destination
//! - cleaning up after connections that go away
//!
//! Concurrency and usage notes:
//! - The API is synchronous and meant to be held behind a lock (for example
//!   `Arc<Mutex<Broker>>`). Consumers receive messages over unbounded
//!   channels, so publishing never blocks on a slow consumer while the lock
//!   is held.
//! - Dropping a consumer's sender is how a consumer stream ends; `cancel`,
//!   `evict` and `cleanup_connection` all rely on that.

use std::collections::HashMap;

use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, trace, warn};

use super::destination::{ConsumerTag, Destination};
use super::message::{BrokerEvent, BrokerMessage};
use crate::utils::error::BrokerError;

pub type ConnectionId = String;

/// One consumer bound to one destination on behalf of one connection.
#[derive(Debug)]
pub struct Consumer {
    pub tag: ConsumerTag,
    pub connection: ConnectionId,
    pub destination: String,
    pub sender: UnboundedSender<BrokerEvent>,
}

#[derive(Debug, Default)]
pub struct Broker {
    pub destinations: HashMap<String, Destination>,
    pub consumers: HashMap<ConsumerTag, Consumer>,
    published: u64,
}

impl Broker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds a new consumer to `destination`, creating the destination on
    /// first use. Consumer tags must be unique across the broker.
    pub fn consume(
        &mut self,
        connection: &str,
        destination: &str,
        tag: ConsumerTag,
        sender: UnboundedSender<BrokerEvent>,
    ) -> Result<(), BrokerError> {
        if self.consumers.contains_key(&tag) {
            return Err(BrokerError::Rejected(format!(
                "consumer tag {tag} is already in use"
            )));
        }

        self.destinations
            .entry(destination.to_string())
            .or_insert_with(|| Destination::new(destination))
            .bind(tag.clone());

        debug!(%tag, destination, connection, "Consumer bound");
        self.consumers.insert(
            tag.clone(),
            Consumer {
                tag,
                connection: connection.to_string(),
                destination: destination.to_string(),
                sender,
            },
        );
        Ok(())
    }

    /// Removes a consumer at its owner's request. Returns whether it existed.
    pub fn cancel(&mut self, tag: &str) -> bool {
        match self.remove_consumer(tag) {
            Some(consumer) => {
                debug!(tag, destination = %consumer.destination, "Consumer cancelled");
                true
            }
            None => false,
        }
    }

    /// Removes a consumer on the broker's own initiative and tells it so.
    pub fn evict(&mut self, tag: &str) -> bool {
        match self.remove_consumer(tag) {
            Some(consumer) => {
                let _ = consumer.sender.send(BrokerEvent::Cancelled);
                warn!(tag, destination = %consumer.destination, "Consumer evicted");
                true
            }
            None => false,
        }
    }

    /// Copies `message` to every consumer of its destination and returns how
    /// many copies were handed over. Consumers whose stream is gone are
    /// unbound on the way.
    pub fn publish(&mut self, message: BrokerMessage) -> usize {
        self.published += 1;

        let Some(destination) = self.destinations.get(&message.destination) else {
            trace!(destination = %message.destination, "No consumers for destination");
            return 0;
        };

        let mut delivered = 0;
        let mut closed = Vec::new();
        for tag in &destination.consumers {
            match self.consumers.get(tag) {
                Some(consumer) => {
                    if consumer
                        .sender
                        .send(BrokerEvent::Delivery(message.clone()))
                        .is_ok()
                    {
                        delivered += 1;
                    } else {
                        closed.push(tag.clone());
                    }
                }
                None => closed.push(tag.clone()),
            }
        }

        for tag in closed {
            debug!(%tag, "Dropping consumer with a closed stream");
            self.remove_consumer(&tag);
        }

        delivered
    }

    /// Removes every consumer owned by `connection`. Returns how many.
    pub fn cleanup_connection(&mut self, connection: &str) -> usize {
        let tags: Vec<ConsumerTag> = self
            .consumers
            .values()
            .filter(|consumer| consumer.connection == connection)
            .map(|consumer| consumer.tag.clone())
            .collect();

        for tag in &tags {
            self.remove_consumer(tag);
        }

        debug!(connection, consumers = tags.len(), "Cleaned up connection");
        tags.len()
    }

    pub fn published(&self) -> u64 {
        self.published
    }

    fn remove_consumer(&mut self, tag: &str) -> Option<Consumer> {
        let consumer = self.consumers.remove(tag)?;
        if let Some(destination) = self.destinations.get_mut(&consumer.destination) {
            destination.unbind(tag);
            if destination.is_empty() {
                self.destinations.remove(&consumer.destination);
            }
        }
        Some(consumer)
    }
}
