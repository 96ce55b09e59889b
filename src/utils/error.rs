//! Error types shared by every layer of `tidings`.
//!
//! Each collaborator gets its own enum so callers can tell a codec problem
//! from a broker outage; `BusError` wraps them for the bootstrap paths that
//! can fail in more than one way.

use thiserror::Error;

/// Failures converting between a typed message and its wire payload.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("message type `{0}` is not registered")]
    Unregistered(String),
    #[error("unknown message type `{0}`")]
    UnknownType(String),
    #[error("empty payload")]
    Empty,
    #[error("payload of {size} bytes exceeds the {max} byte limit")]
    TooLarge { size: usize, max: usize },
    #[error("failed to serialize `{tag}`: {source}")]
    Serialize {
        tag: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("malformed `{tag}` payload: {source}")]
    Malformed {
        tag: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl CodecError {
    /// Unknown types are routine (a peer runs a newer build); everything else
    /// points at a bug or corrupted data.
    pub fn is_unknown_type(&self) -> bool {
        matches!(self, CodecError::UnknownType(_))
    }
}

/// Problems declaring the message hierarchy at startup.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("message type `{0}` is its own ancestor")]
    Cycle(&'static str),
}

/// Failures talking to the message broker.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker at {url} is unreachable: {reason}")]
    Unreachable { url: String, reason: String },
    #[error("broker connection is closed")]
    Disconnected,
    #[error("broker did not answer within {0:?}")]
    Timeout(std::time::Duration),
    #[error("broker rejected the request: {0}")]
    Rejected(String),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error("invalid frame: {0}")]
    Protocol(#[from] serde_json::Error),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures reading or writing the relational event table.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("store worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
    #[error("payload is not valid UTF-8")]
    Encoding(#[from] std::string::FromUtf8Error),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Rejected process identifiers.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("identity `{0}` must be lowercase alphanumerics separated by single hyphens")]
    Invalid(String),
}

/// Umbrella error for bootstrap and subscription paths.
#[derive(Debug, Error)]
pub enum BusError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("messenger is closed")]
    Closed,
}
