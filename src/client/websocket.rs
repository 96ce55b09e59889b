//! Broker client speaking the WebSocket frame protocol of `tidings broker`.
//!
//! One socket per client. A writer task drains an unbounded channel into
//! the socket; a reader task routes incoming frames either to the consumer
//! they belong to or to the `consume` call waiting for its `consume_ok`.
//! When the socket drops, every open consumer observes a
//! [`BrokerEvent::Shutdown`] and its stream ends.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::spawn;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tracing::{debug, error, info, trace, warn};
use tungstenite::protocol::Message as WsMessage;
use uuid::Uuid;

use super::{BrokerClient, BrokerConsumer};
use crate::broker::destination::ConsumerTag;
use crate::broker::{BrokerEvent, BrokerMessage, Headers};
use crate::transport::message::{ClientFrame, ServerFrame};
use crate::utils::error::BrokerError;

/// How long `consume` waits for the broker to confirm a consumer.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct WebSocketBrokerClient {
    inner: Arc<Inner>,
}

struct Inner {
    url: String,
    outgoing: UnboundedSender<WsMessage>,
    consumers: Mutex<HashMap<ConsumerTag, UnboundedSender<BrokerEvent>>>,
    pending: Mutex<HashMap<ConsumerTag, oneshot::Sender<Result<(), String>>>>,
    connected: AtomicBool,
    closed: AtomicBool,
    request_timeout: Duration,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WebSocketBrokerClient {
    /// Connects to the broker at `url` and introduces itself as `name`.
    ///
    /// An unreachable broker is reported as [`BrokerError::Unreachable`];
    /// callers are expected to treat that as fatal.
    pub async fn connect(url: &str, name: &str) -> Result<Self, BrokerError> {
        Self::connect_with_timeout(url, name, DEFAULT_REQUEST_TIMEOUT).await
    }

    pub async fn connect_with_timeout(
        url: &str,
        name: &str,
        request_timeout: Duration,
    ) -> Result<Self, BrokerError> {
        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| BrokerError::Unreachable {
                url: url.to_string(),
                reason: e.to_string(),
            })?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (outgoing, mut rx) = mpsc::unbounded_channel::<WsMessage>();

        let inner = Arc::new(Inner {
            url: url.to_string(),
            outgoing,
            consumers: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            connected: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            request_timeout,
            tasks: Mutex::new(Vec::new()),
        });

        let writer = spawn(async move {
            while let Some(msg) = rx.recv().await {
                let closing = matches!(msg, WsMessage::Close(_));
                if let Err(e) = ws_sender.send(msg).await {
                    debug!("Failed to write frame to broker: {e}");
                    break;
                }
                if closing {
                    break;
                }
            }
            let _ = ws_sender.close().await;
        });

        let reader = {
            let inner = inner.clone();
            spawn(async move {
                while let Some(frame) = ws_receiver.next().await {
                    match frame {
                        Ok(WsMessage::Text(text)) => {
                            match serde_json::from_str::<ServerFrame>(text.as_str()) {
                                Ok(frame) => inner.route(frame),
                                Err(e) => warn!(url = %inner.url, "Invalid broker frame: {e}"),
                            }
                        }
                        Ok(WsMessage::Close(_)) => break,
                        Ok(_) => {}
                        Err(e) => {
                            warn!(url = %inner.url, "Broker connection failed: {e}");
                            break;
                        }
                    }
                }
                inner.shutdown();
            })
        };

        inner.tasks.lock().extend([writer, reader]);

        let client = Self { inner };
        client.send(&ClientFrame::Hello {
            client: name.to_string(),
        })?;
        info!(url, "Connected to broker");
        Ok(client)
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst) && !self.inner.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(BrokerError::Disconnected)
        }
    }

    fn send(&self, frame: &ClientFrame) -> Result<(), BrokerError> {
        let msg = frame.to_ws()?;
        self.inner
            .outgoing
            .send(msg)
            .map_err(|_| BrokerError::Disconnected)
    }

    fn forget(&self, tag: &str) {
        self.inner.consumers.lock().remove(tag);
        self.inner.pending.lock().remove(tag);
    }
}

impl Inner {
    fn route(&self, frame: ServerFrame) {
        match frame {
            ServerFrame::ConsumeOk { tag } => {
                if let Some(waiter) = self.pending.lock().remove(&tag) {
                    let _ = waiter.send(Ok(()));
                }
            }
            ServerFrame::CancelOk { tag } => {
                trace!(%tag, "Consumer cancel confirmed");
            }
            ServerFrame::Deliver {
                tag,
                destination,
                headers,
                payload,
                timestamp,
            } => {
                let consumers = self.consumers.lock();
                match consumers.get(&tag) {
                    Some(events) => {
                        let _ = events.send(BrokerEvent::Delivery(BrokerMessage {
                            destination,
                            headers,
                            payload,
                            timestamp,
                        }));
                    }
                    None => trace!(%tag, "Delivery for a consumer that is gone"),
                }
            }
            ServerFrame::Cancelled { tag } => {
                if let Some(events) = self.consumers.lock().remove(&tag) {
                    let _ = events.send(BrokerEvent::Cancelled);
                }
            }
            ServerFrame::Error { tag, message } => {
                let waiter = tag.as_ref().and_then(|tag| self.pending.lock().remove(tag));
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(Err(message));
                    }
                    None => warn!(tag = tag.as_deref(), "Broker reported an error: {message}"),
                }
            }
        }
    }

    /// Ends every consumer stream. Called once the socket is gone.
    fn shutdown(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let initiated_by_application = self.closed.load(Ordering::SeqCst);
        for (_, events) in self.consumers.lock().drain() {
            let _ = events.send(BrokerEvent::Shutdown {
                initiated_by_application,
            });
        }
        self.pending.lock().clear();
        if !initiated_by_application {
            error!(url = %self.url, "Lost connection to broker");
        }
    }
}

#[async_trait]
impl BrokerClient for WebSocketBrokerClient {
    async fn publish(
        &self,
        destination: &str,
        headers: Headers,
        payload: Vec<u8>,
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.send(&ClientFrame::Publish {
            destination: destination.to_string(),
            headers,
            payload,
        })
    }

    async fn consume(&self, destination: &str) -> Result<BrokerConsumer, BrokerError> {
        self.ensure_open()?;

        let tag = Uuid::new_v4().to_string();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (ok_tx, ok_rx) = oneshot::channel();
        // Registered before the request so no early delivery is lost.
        self.inner.consumers.lock().insert(tag.clone(), events_tx);
        self.inner.pending.lock().insert(tag.clone(), ok_tx);

        let request = ClientFrame::Consume {
            destination: destination.to_string(),
            tag: tag.clone(),
        };
        if let Err(e) = self.send(&request) {
            self.forget(&tag);
            return Err(e);
        }

        match tokio::time::timeout(self.inner.request_timeout, ok_rx).await {
            Ok(Ok(Ok(()))) => {
                debug!(%tag, destination, "Consumer opened");
                Ok(BrokerConsumer {
                    tag,
                    events: events_rx,
                })
            }
            Ok(Ok(Err(message))) => {
                self.forget(&tag);
                Err(BrokerError::Rejected(message))
            }
            Ok(Err(_)) => {
                self.forget(&tag);
                Err(BrokerError::Disconnected)
            }
            Err(_) => {
                self.forget(&tag);
                let _ = self.send(&ClientFrame::Cancel { tag });
                Err(BrokerError::Timeout(self.inner.request_timeout))
            }
        }
    }

    async fn cancel(&self, tag: &str) -> Result<(), BrokerError> {
        self.inner.consumers.lock().remove(tag);
        self.ensure_open()?;
        self.send(&ClientFrame::Cancel {
            tag: tag.to_string(),
        })
    }

    async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        for (_, events) in self.inner.consumers.lock().drain() {
            let _ = events.send(BrokerEvent::Shutdown {
                initiated_by_application: true,
            });
        }
        let _ = self.inner.outgoing.send(WsMessage::Close(None));

        let tasks: Vec<JoinHandle<()>> = self.inner.tasks.lock().drain(..).collect();
        let mut tasks = tasks.into_iter();
        if let Some(writer) = tasks.next() {
            let _ = tokio::time::timeout(Duration::from_secs(1), writer).await;
        }
        for task in tasks {
            task.abort();
        }
        info!(url = %self.inner.url, "Disconnected from broker");
    }
}
