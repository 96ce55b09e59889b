//! Message types shared by the test suites.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, UnboundedReceiver};

use crate::message::{Message, MessageRegistry};
use crate::messenger::Listener;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BanMessage {
    pub target: String,
}

impl Message for BanMessage {
    const TAG: &'static str = "tidings.test.BanMessage";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PardonMessage {
    pub target: String,
}

impl Message for PardonMessage {
    const TAG: &'static str = "tidings.test.PardonMessage";
}

/// Supertype of bans and pardons.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Punishment {
    Ban(BanMessage),
    Pardon(PardonMessage),
}

impl Message for Punishment {
    const TAG: &'static str = "tidings.test.Punishment";
}

impl From<BanMessage> for Punishment {
    fn from(message: BanMessage) -> Self {
        Punishment::Ban(message)
    }
}

impl From<PardonMessage> for Punishment {
    fn from(message: PardonMessage) -> Self {
        Punishment::Pardon(message)
    }
}

/// Grandparent of bans, to exercise transitive routing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SecurityEvent {
    Punishment(Punishment),
}

impl Message for SecurityEvent {
    const TAG: &'static str = "tidings.test.SecurityEvent";
}

impl From<Punishment> for SecurityEvent {
    fn from(message: Punishment) -> Self {
        SecurityEvent::Punishment(message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapReload {
    pub maps: Vec<String>,
}

impl Message for MapReload {
    const TAG: &'static str = "tidings.test.MapReload";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Echo {
    pub content: String,
}

impl Message for Echo {
    const TAG: &'static str = "tidings.test.Echo";
}

pub fn registry() -> Arc<MessageRegistry> {
    let registry = MessageRegistry::builder()
        .register_subtype::<BanMessage, Punishment>()
        .register_subtype::<PardonMessage, Punishment>()
        .register_subtype::<Punishment, SecurityEvent>()
        .register::<MapReload>()
        .register::<Echo>()
        .build()
        .expect("fixture hierarchy is acyclic");
    Arc::new(registry)
}

pub fn ban(target: &str) -> BanMessage {
    BanMessage {
        target: target.to_string(),
    }
}

/// A listener that forwards every message into a channel.
pub fn collector<M: Message>() -> (impl Listener<M>, UnboundedReceiver<M>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let listener = move |message: M| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(message);
            anyhow::Ok(())
        }
    };
    (listener, rx)
}

/// Waits up to `ms` milliseconds for the next collected message.
pub async fn recv_within<M>(rx: &mut UnboundedReceiver<M>, ms: u64) -> Option<M> {
    tokio::time::timeout(Duration::from_millis(ms), rx.recv())
        .await
        .ok()
        .flatten()
}
