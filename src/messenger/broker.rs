//! Messenger backed by a message broker.
//!
//! Publishing fans out at write time: one copy per routable type, each sent
//! to the destination named after that type. Subscribing opens one broker
//! consumer per subscribed type, shared by every listener of that type and
//! reference counted; the last cancellation tears the consumer down.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::{Mutex, mpsc::UnboundedReceiver, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use super::{
    Delivery, Dispatcher, ErasedListener, Identity, ListenerId, Messenger, RequestData,
    Subscription, Unsubscribe,
};
use crate::broker::destination::ConsumerTag;
use crate::broker::{BrokerEvent, BrokerMessage, Headers};
use crate::client::BrokerClient;
use crate::message::{AnyMessage, Message, MessageCodec, MessageRegistry};
use crate::utils::error::{BusError, CodecError};

pub const SENDER_HEADER: &str = "tidings-sender";
pub const TYPE_HEADER: &str = "tidings-type";
pub const REQUEST_ID_HEADER: &str = "tidings-request-id";
pub const REQUEST_REPLY_HEADER: &str = "tidings-request-reply";

pub struct BrokerMessenger<C: BrokerClient> {
    inner: Arc<Inner<C>>,
}

impl<C: BrokerClient> Clone for BrokerMessenger<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct Inner<C: BrokerClient> {
    client: C,
    identity: Identity,
    codec: MessageCodec,
    dispatcher: Dispatcher,
    consumers: Mutex<HashMap<&'static str, ConsumerEntry>>,
    closed: AtomicBool,
}

/// One broker consumer shared by every listener of a type.
struct ConsumerEntry {
    consumer_tag: ConsumerTag,
    refcount: usize,
    task: JoinHandle<()>,
}

impl ConsumerEntry {
    /// True when called from this consumer's own task, i.e. by one of its
    /// listeners.
    fn is_current_task(&self) -> bool {
        tokio::task::try_id() == Some(self.task.id())
    }
}

impl<C: BrokerClient> BrokerMessenger<C> {
    /// Wraps a connected client. The connection itself is established by the
    /// client, so a messenger only exists once the broker was reachable.
    pub fn new(client: C, identity: Identity, codec: MessageCodec) -> Self {
        let dispatcher = Dispatcher::new(codec.registry().clone());
        Self {
            inner: Arc::new(Inner {
                client,
                identity,
                codec,
                dispatcher,
                consumers: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.inner.identity
    }

    /// Number of listeners sharing the consumer for `tag`; 0 when there is
    /// no consumer.
    pub async fn consumer_refcount(&self, tag: &str) -> usize {
        self.inner
            .consumers
            .lock()
            .await
            .get(tag)
            .map_or(0, |entry| entry.refcount)
    }

    /// Publishes `message` as a request and waits up to `timeout` for a
    /// reply of type `R` carrying the same request id.
    ///
    /// Returns `None` when the publish fails or nobody answers in time.
    pub async fn request<M, R>(&self, message: M, timeout: Duration) -> Option<R>
    where
        M: Message,
        R: Message,
    {
        let request = RequestData::new();
        let (tx, rx) = oneshot::channel::<R>();
        let slot = Arc::new(parking_lot::Mutex::new(Some(tx)));

        let listener: ErasedListener = {
            let registry = self.registry().clone();
            Arc::new(move |delivery: Delivery| {
                let answered = delivery
                    .request
                    .is_some_and(|incoming| incoming.id == request.id && incoming.reply);
                if answered {
                    if let Some(response) = registry.upcast::<R>(&delivery.message) {
                        if let Some(tx) = slot.lock().take() {
                            let _ = tx.send(response);
                        }
                    }
                }
                async { anyhow::Ok(()) }.boxed()
            })
        };

        let subscription = match self.subscribe_any(R::TAG, listener).await {
            Ok(subscription) => subscription,
            Err(e) => {
                error!(topic = R::TAG, "Failed to listen for replies: {e}");
                return None;
            }
        };

        let published = self
            .inner
            .publish_with(AnyMessage::new(message), false, Some(request))
            .await;
        let response = if published {
            match tokio::time::timeout(timeout, rx).await {
                Ok(Ok(response)) => Some(response),
                _ => {
                    debug!(request = %request.id, concrete = M::TAG, "Request timed out");
                    None
                }
            }
        } else {
            None
        };

        subscription.cancel().await;
        response
    }

    /// Registers a function listener: every incoming request of type `M` is
    /// answered with whatever `function` returns. Plain messages and
    /// replies are ignored, as is a `None` result.
    pub async fn respond<M, R, F, Fut>(&self, function: F) -> Result<Subscription, BusError>
    where
        M: Message,
        R: Message,
        F: Fn(M) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<R>> + Send + 'static,
    {
        let inner: Weak<Inner<C>> = Arc::downgrade(&self.inner);
        let registry = self.registry().clone();
        let function = Arc::new(function);

        let listener: ErasedListener = Arc::new(move |delivery: Delivery| {
            let inner = inner.clone();
            let registry = registry.clone();
            let function = function.clone();
            async move {
                let Some(request) = delivery.request.filter(|request| !request.reply) else {
                    return Ok(());
                };
                let Some(message) = registry.upcast::<M>(&delivery.message) else {
                    anyhow::bail!("{} is not assignable to {}", delivery.message.tag(), M::TAG);
                };
                let Some(response) = (function.as_ref())(message).await else {
                    return Ok(());
                };
                let Some(inner) = inner.upgrade() else {
                    return Ok(());
                };
                if !inner
                    .publish_with(AnyMessage::new(response), false, Some(request.as_reply()))
                    .await
                {
                    anyhow::bail!("failed to publish reply to request {}", request.id);
                }
                Ok(())
            }
            .boxed()
        });

        self.subscribe_any(M::TAG, listener).await
    }
}

impl<C: BrokerClient> Inner<C> {
    async fn publish_with(
        &self,
        message: AnyMessage,
        local: bool,
        request: Option<RequestData>,
    ) -> bool {
        let concrete = message.tag();
        if self.closed.load(Ordering::SeqCst) {
            warn!(concrete, "Publish on a closed messenger");
            return false;
        }

        if local {
            let delivery = Delivery {
                message: message.clone(),
                request,
            };
            self.dispatcher.dispatch(&delivery).await;
        }

        let payload = match self.codec.encode(&message) {
            Ok(payload) => payload,
            Err(e) => {
                error!(concrete, "Failed to publish message: {e}");
                return false;
            }
        };

        let mut headers = Headers::new();
        headers.insert(SENDER_HEADER.to_string(), self.identity.to_string());
        headers.insert(TYPE_HEADER.to_string(), concrete.to_string());
        if let Some(request) = request {
            headers.insert(REQUEST_ID_HEADER.to_string(), request.id.to_string());
            headers.insert(REQUEST_REPLY_HEADER.to_string(), request.reply.to_string());
        }

        trace!(concrete, bytes = payload.len(), "Publishing message");
        for &destination in self.codec.registry().routable_types(concrete) {
            if let Err(e) = self
                .client
                .publish(destination, headers.clone(), payload.clone())
                .await
            {
                error!(concrete, destination, "Failed to publish message: {e}");
                return false;
            }
        }
        true
    }

    /// Applies the delivery filters in order, then hands the message to the
    /// listeners of `subscribed`.
    async fn handle_delivery(&self, subscribed: &'static str, message: BrokerMessage) {
        let Some(sender) = message.headers.get(SENDER_HEADER) else {
            warn!(
                topic = subscribed,
                destination = %message.destination,
                "Received message without sender header"
            );
            return;
        };
        if sender == self.identity.as_str() {
            return;
        }

        let size = message.payload.len();
        if size == 0 {
            warn!(topic = subscribed, %sender, "Received empty message");
            return;
        }
        if size > self.codec.max_payload_size() {
            warn!(topic = subscribed, %sender, size, "Received message that is too large");
            return;
        }

        let Some(type_name) = message.headers.get(TYPE_HEADER) else {
            warn!(topic = subscribed, %sender, "Received message without type header");
            return;
        };
        let registry = self.codec.registry();
        let Some(concrete) = registry.resolve(type_name) else {
            trace!(topic = subscribed, %sender, concrete = %type_name, "Received message of unknown type");
            return;
        };
        if !registry.is_subtype(concrete, subscribed) {
            warn!(topic = subscribed, %sender, concrete, "Received message of an unexpected type");
            return;
        }

        let decoded = match self.codec.decode(concrete, &message.payload) {
            Ok(decoded) => decoded,
            Err(e) => {
                error!(topic = subscribed, %sender, concrete, "Failed to parse message: {e}");
                return;
            }
        };

        trace!(topic = subscribed, %sender, concrete, "Received message");
        let delivery = Delivery {
            message: decoded,
            request: parse_request(&message.headers),
        };
        self.dispatcher.dispatch_to(subscribed, &delivery).await;
    }
}

fn parse_request(headers: &Headers) -> Option<RequestData> {
    let id = headers.get(REQUEST_ID_HEADER)?;
    match Uuid::parse_str(id) {
        Ok(id) => Some(RequestData {
            id,
            reply: headers
                .get(REQUEST_REPLY_HEADER)
                .is_some_and(|reply| reply == "true"),
        }),
        Err(e) => {
            warn!(request = %id, "Ignoring malformed request id: {e}");
            None
        }
    }
}

async fn consume_loop<C: BrokerClient>(
    inner: Arc<Inner<C>>,
    subscribed: &'static str,
    mut events: UnboundedReceiver<BrokerEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            BrokerEvent::Delivery(message) => inner.handle_delivery(subscribed, message).await,
            BrokerEvent::Cancelled => {
                error!(topic = subscribed, "Consumer has been unexpectedly cancelled");
            }
            BrokerEvent::Shutdown {
                initiated_by_application,
            } => {
                if !initiated_by_application {
                    error!(topic = subscribed, "Consumer has been shut down unexpectedly");
                }
            }
        }
    }
    trace!(topic = subscribed, "Consumer stream ended");
}

#[async_trait]
impl<C: BrokerClient> Unsubscribe for Inner<C> {
    async fn unsubscribe(&self, tag: &'static str, id: ListenerId) {
        let mut consumers = self.consumers.lock().await;
        self.dispatcher.remove(tag, id);

        let Some(entry) = consumers.get_mut(tag) else {
            return;
        };
        entry.refcount = entry.refcount.saturating_sub(1);
        if entry.refcount > 0 {
            return;
        }

        if let Some(entry) = consumers.remove(tag) {
            match self.client.cancel(&entry.consumer_tag).await {
                Ok(()) => debug!(topic = tag, "Consumer torn down"),
                Err(e) => {
                    error!(topic = tag, "Failed to cancel consumer: {e}");
                    if !entry.is_current_task() {
                        entry.task.abort();
                    }
                }
            }
        }
    }
}

#[async_trait]
impl<C: BrokerClient> Messenger for BrokerMessenger<C> {
    fn registry(&self) -> &Arc<MessageRegistry> {
        self.inner.codec.registry()
    }

    async fn publish_any(&self, message: AnyMessage, local: bool) -> bool {
        self.inner.publish_with(message, local, None).await
    }

    async fn subscribe_any(
        &self,
        tag: &'static str,
        listener: ErasedListener,
    ) -> Result<Subscription, BusError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        let tag = self
            .registry()
            .resolve(tag)
            .ok_or_else(|| CodecError::Unregistered(tag.to_string()))?;

        let mut consumers = self.inner.consumers.lock().await;
        match consumers.get_mut(tag) {
            Some(entry) => entry.refcount += 1,
            None => {
                let consumer = self.inner.client.consume(tag).await?;
                let task = tokio::spawn(consume_loop(self.inner.clone(), tag, consumer.events));
                debug!(topic = tag, consumer = %consumer.tag, "Consumer opened");
                consumers.insert(
                    tag,
                    ConsumerEntry {
                        consumer_tag: consumer.tag,
                        refcount: 1,
                        task,
                    },
                );
            }
        }
        let id = self.inner.dispatcher.add(tag, listener);
        drop(consumers);

        Ok(Subscription::new(tag, id, self.inner.clone()))
    }

    async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let entries: Vec<(&'static str, ConsumerEntry)> =
            self.inner.consumers.lock().await.drain().collect();
        for (tag, entry) in entries {
            let own = entry.is_current_task();
            if let Err(e) = self.inner.client.cancel(&entry.consumer_tag).await {
                warn!(topic = tag, "Failed to cancel consumer on close: {e}");
                if !own {
                    entry.task.abort();
                }
            }
            if own {
                // A listener of this consumer is closing us. Its stream ends
                // when the client closes below.
                debug!(topic = tag, "Close requested from a consumer task");
                continue;
            }
            let _ = entry.task.await;
        }

        self.inner.dispatcher.clear();
        self.inner.client.close().await;
        info!(identity = %self.inner.identity, "Broker messenger closed");
    }
}
