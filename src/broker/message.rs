use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Transport metadata attached to a broker message.
pub type Headers = BTreeMap<String, String>;

/// A message as the broker sees it: an opaque body plus headers.
///
/// The broker never looks inside `payload`; routing is by `destination`
/// only, and `headers` travel untouched to every consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerMessage {
    pub destination: String,
    pub headers: Headers,
    pub payload: Vec<u8>,
    pub timestamp: i64,
}

/// What a consumer observes on its stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    Delivery(BrokerMessage),
    /// The broker cancelled the consumer on its own initiative.
    Cancelled,
    /// The connection carrying the consumer went away.
    Shutdown { initiated_by_application: bool },
}
