//! The in-process broker engine.
//!
//! The engine owns destinations and consumers and copies every published
//! message to each consumer bound to the destination. It keeps nothing:
//! a message published where nobody listens is gone. The WebSocket server
//! in `transport` and the `InMemoryBrokerClient` both drive it.

pub mod destination;
pub mod engine;
pub mod message;

pub use engine::Broker;
pub use message::{BrokerEvent, BrokerMessage, Headers};
