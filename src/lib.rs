//! # Tidings
//!
//! `tidings` is a typed message bus for server processes that need to
//! exchange events without knowing about each other. Producers publish
//! plain serde values; subscribers register for a type and also receive
//! every registered subtype of it.
//!
//! Two transports implement the same [`messenger::Messenger`] contract:
//!
//! - a broker transport, which publishes one copy per routable type to a
//!   broker destination and keeps one reference-counted consumer per
//!   subscribed type;
//! - a polling transport, which appends rows to a shared table and polls
//!   for rows written by other processes.
//!
//! ## Core Modules
//!
//! - `message`: message trait, type registry and codec.
//! - `messenger`: the transport contract and both transports.
//! - `broker`: the in-process broker engine.
//! - `client`: broker clients, in-process and over WebSocket.
//! - `transport`: the WebSocket broker server.
//! - `persistence`: the event table used by the polling transport.
//! - `config`: layered settings.
//! - `utils`: errors and logging.

pub mod broker;
pub mod client;
pub mod config;
pub mod message;
pub mod messenger;
pub mod persistence;
pub mod transport;
pub mod utils;

#[cfg(test)]
mod tests;
