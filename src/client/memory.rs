use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use super::{BrokerClient, BrokerConsumer};
use crate::broker::{Broker, BrokerEvent, BrokerMessage, Headers};
use crate::utils::error::BrokerError;

/// A broker client bound to a broker in the same process.
///
/// Each client counts as one connection: closing it removes every consumer
/// it opened, just as a dropped socket would.
#[derive(Debug, Clone)]
pub struct InMemoryBrokerClient {
    broker: Arc<Mutex<Broker>>,
    connection: String,
    closed: Arc<AtomicBool>,
}

impl InMemoryBrokerClient {
    pub fn new(broker: Arc<Mutex<Broker>>) -> Self {
        Self {
            broker,
            connection: format!("mem-{}", Uuid::new_v4().simple()),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn connection(&self) -> &str {
        &self.connection
    }

    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(BrokerError::Disconnected)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl BrokerClient for InMemoryBrokerClient {
    async fn publish(
        &self,
        destination: &str,
        headers: Headers,
        payload: Vec<u8>,
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.broker.lock().publish(BrokerMessage {
            destination: destination.to_string(),
            headers,
            payload,
            timestamp: chrono::Utc::now().timestamp_millis(),
        });
        Ok(())
    }

    async fn consume(&self, destination: &str) -> Result<BrokerConsumer, BrokerError> {
        self.ensure_open()?;
        let tag = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        self.broker
            .lock()
            .consume(&self.connection, destination, tag.clone(), tx)?;
        Ok(BrokerConsumer { tag, events: rx })
    }

    async fn cancel(&self, tag: &str) -> Result<(), BrokerError> {
        self.broker.lock().cancel(tag);
        Ok(())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut broker = self.broker.lock();
        for consumer in broker.consumers.values() {
            if consumer.connection == self.connection {
                let _ = consumer.sender.send(BrokerEvent::Shutdown {
                    initiated_by_application: true,
                });
            }
        }
        let removed = broker.cleanup_connection(&self.connection);
        debug!(connection = %self.connection, consumers = removed, "In-memory client closed");
    }
}
