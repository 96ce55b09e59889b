//! The `transport` module puts the broker engine on the network.
//!
//! It defines the JSON frame protocol spoken between broker clients and the
//! server, and implements the WebSocket server itself: accepting
//! connections, parsing frames, and turning them into broker operations.
//! `client::WebSocketBrokerClient` is the other end of the same protocol.

pub mod message;
pub mod websocket;
