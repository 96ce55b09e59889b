//! The `client` module is the messenger's view of a message broker.
//!
//! [`BrokerClient`] is the narrow set of broker primitives the broker
//! transport needs: publish to a destination, open a consumer on a
//! destination, cancel it, and close the connection. Two implementations
//! exist:
//!
//! - [`InMemoryBrokerClient`] drives a [`Broker`](crate::broker::Broker)
//!   living in the same process. Several clients sharing one broker behave
//!   like several processes sharing a real one.
//! - [`WebSocketBrokerClient`] talks to `tidings broker` over the network.

pub mod memory;
pub mod websocket;

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::broker::destination::ConsumerTag;
use crate::broker::{BrokerEvent, Headers};
use crate::utils::error::BrokerError;

pub use memory::InMemoryBrokerClient;
pub use websocket::WebSocketBrokerClient;

/// An open consumer: its broker-wide tag and the stream of its events.
///
/// The stream ends once the consumer is cancelled or the client closes.
#[derive(Debug)]
pub struct BrokerConsumer {
    pub tag: ConsumerTag,
    pub events: UnboundedReceiver<BrokerEvent>,
}

#[async_trait]
pub trait BrokerClient: Send + Sync + 'static {
    /// Hands one message to the broker. Success means the broker (or the
    /// connection to it) accepted the message, not that anyone consumed it.
    async fn publish(
        &self,
        destination: &str,
        headers: Headers,
        payload: Vec<u8>,
    ) -> Result<(), BrokerError>;

    async fn consume(&self, destination: &str) -> Result<BrokerConsumer, BrokerError>;

    async fn cancel(&self, tag: &str) -> Result<(), BrokerError>;

    async fn close(&self);
}

#[cfg(test)]
mod tests;
