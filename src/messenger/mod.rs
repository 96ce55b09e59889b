//! The transport-agnostic publish/subscribe contract.
//!
//! Every component talks to the bus through [`Messenger`] (or its typed
//! companion [`MessengerExt`]) and never learns which transport is active:
//!
//! ```text
//!   producer ──publish──▶ Messenger ──┬─▶ BrokerMessenger  ──▶ broker destinations (one per routable type)
//!                            │        └─▶ PollingMessenger ──▶ relational event table
//!                            │
//!                            └─ local echo ─▶ Dispatcher ─▶ listeners of every routable type
//! ```
//!
//! Delivery is at-least-once and best effort. A process never re-delivers
//! its own publications from the transport; if it wants to observe them it
//! asks for a local echo, which runs on the publisher's task before
//! `publish` returns.

pub mod broker;
mod dispatch;
mod identity;
pub mod polling;

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use uuid::Uuid;

use crate::client::WebSocketBrokerClient;
use crate::config::{MessengerKind, Settings};
use crate::message::{AnyMessage, Message, MessageCodec, MessageRegistry};
use crate::persistence::SqliteEventTable;
use crate::utils::error::BusError;

pub use broker::BrokerMessenger;
pub(crate) use dispatch::Dispatcher;
pub use identity::Identity;
pub use polling::{PollReport, PollingMessenger, PollingOptions};

/// Correlation data carried by request/reply traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestData {
    pub id: Uuid,
    pub reply: bool,
}

impl RequestData {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            reply: false,
        }
    }

    pub fn as_reply(self) -> Self {
        Self {
            reply: true,
            ..self
        }
    }
}

impl Default for RequestData {
    fn default() -> Self {
        Self::new()
    }
}

/// One message on its way to local listeners.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message: AnyMessage,
    pub request: Option<RequestData>,
}

impl Delivery {
    pub fn new(message: AnyMessage) -> Self {
        Self {
            message,
            request: None,
        }
    }
}

/// Type-erased listener as stored by the dispatcher.
pub type ErasedListener = Arc<dyn Fn(Delivery) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Receives messages of type `M`, including every registered subtype of `M`.
///
/// Returning an error (or panicking) is logged and does not affect other
/// listeners.
#[async_trait]
pub trait Listener<M: Message>: Send + Sync + 'static {
    async fn on_message(&self, message: M) -> anyhow::Result<()>;
}

#[async_trait]
impl<M, F, Fut> Listener<M> for F
where
    M: Message,
    F: Fn(M) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn on_message(&self, message: M) -> anyhow::Result<()> {
        (self)(message).await
    }
}

/// Identifies one registered listener.
pub type ListenerId = u64;

/// Whatever owns a listener registration and can take it back.
#[async_trait]
pub(crate) trait Unsubscribe: Send + Sync {
    async fn unsubscribe(&self, tag: &'static str, id: ListenerId);
}

/// Handle to one listener registration.
///
/// Dropping the handle leaves the listener registered; call
/// [`Subscription::cancel`] to remove it. Cancelling does not interrupt a
/// delivery that is already running.
pub struct Subscription {
    tag: &'static str,
    id: ListenerId,
    owner: Arc<dyn Unsubscribe>,
}

impl Subscription {
    pub(crate) fn new(tag: &'static str, id: ListenerId, owner: Arc<dyn Unsubscribe>) -> Self {
        Self { tag, id, owner }
    }

    /// Tag of the subscribed type.
    pub fn tag(&self) -> &'static str {
        self.tag
    }

    pub async fn cancel(self) {
        self.owner.unsubscribe(self.tag, self.id).await;
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("tag", &self.tag)
            .field("id", &self.id)
            .finish()
    }
}

/// The transport interface both transports implement.
#[async_trait]
pub trait Messenger: Send + Sync + 'static {
    fn registry(&self) -> &Arc<MessageRegistry>;

    /// Hands `message` to the transport. With `local` set, listeners in this
    /// process run first, on the caller's task. Returns whether the despatch
    /// succeeded, not whether anyone received it.
    async fn publish_any(&self, message: AnyMessage, local: bool) -> bool;

    /// Registers `listener` for messages whose routable types include `tag`.
    async fn subscribe_any(
        &self,
        tag: &'static str,
        listener: ErasedListener,
    ) -> Result<Subscription, BusError>;

    /// Stops background work and releases transport resources.
    async fn close(&self);
}

/// Typed conveniences over [`Messenger`].
#[async_trait]
pub trait MessengerExt: Messenger {
    async fn publish<M: Message>(&self, message: M, local: bool) -> bool {
        self.publish_any(AnyMessage::new(message), local).await
    }

    async fn subscribe<M, L>(&self, listener: L) -> Result<Subscription, BusError>
    where
        M: Message,
        L: Listener<M>,
    {
        let erased = erase_listener::<M, L>(self.registry().clone(), listener);
        self.subscribe_any(M::TAG, erased).await
    }
}

impl<T: Messenger + ?Sized> MessengerExt for T {}

pub(crate) fn erase_listener<M, L>(registry: Arc<MessageRegistry>, listener: L) -> ErasedListener
where
    M: Message,
    L: Listener<M>,
{
    let listener = Arc::new(listener);
    Arc::new(move |delivery: Delivery| {
        let registry = registry.clone();
        let listener = listener.clone();
        async move {
            let Some(message) = registry.upcast::<M>(&delivery.message) else {
                anyhow::bail!("{} is not assignable to {}", delivery.message.tag(), M::TAG);
            };
            listener.on_message(message).await
        }
        .boxed()
    })
}

/// Opens the transport selected by `settings.messenger.kind`.
///
/// The broker transport fails fast when the broker is unreachable; the
/// polling transport fails when the table cannot be opened or migrated.
pub async fn open_messenger(
    settings: &Settings,
    registry: Arc<MessageRegistry>,
) -> Result<Arc<dyn Messenger>, BusError> {
    let identity = Identity::new(settings.server.name.clone())?;
    let codec =
        MessageCodec::new(registry).with_max_payload_size(settings.messenger.max_payload_bytes);

    match settings.messenger.kind {
        MessengerKind::Broker => {
            let client =
                WebSocketBrokerClient::connect(&settings.messenger.broker_url, identity.as_str())
                    .await?;
            let messenger = BrokerMessenger::new(client, identity, codec);
            Ok(Arc::new(messenger))
        }
        MessengerKind::Polling => {
            let polling = &settings.messenger.polling;
            let table = SqliteEventTable::open(&polling.database).await?;
            let messenger =
                PollingMessenger::open(table, identity, codec, PollingOptions::from(polling))
                    .await?;
            messenger.start().await;
            Ok(Arc::new(messenger))
        }
    }
}
