use serde::{Deserialize, Serialize};
use tungstenite::protocol::Message as WsMessage;

use crate::broker::Headers;

/// Frames a broker client sends to the server.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type")]
pub enum ClientFrame {
    /// Names the connection in server logs. Optional.
    #[serde(rename = "hello")]
    Hello { client: String },

    #[serde(rename = "consume")]
    Consume { destination: String, tag: String },

    #[serde(rename = "cancel")]
    Cancel { tag: String },

    #[serde(rename = "publish")]
    Publish {
        destination: String,
        #[serde(default)]
        headers: Headers,
        #[serde(with = "base64_payload")]
        payload: Vec<u8>,
    },
}

/// Frames the server sends back.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type")]
pub enum ServerFrame {
    #[serde(rename = "consume_ok")]
    ConsumeOk { tag: String },

    #[serde(rename = "cancel_ok")]
    CancelOk { tag: String },

    #[serde(rename = "deliver")]
    Deliver {
        tag: String,
        destination: String,
        headers: Headers,
        #[serde(with = "base64_payload")]
        payload: Vec<u8>,
        timestamp: i64,
    },

    /// The broker dropped the consumer without being asked to.
    #[serde(rename = "cancelled")]
    Cancelled { tag: String },

    #[serde(rename = "error")]
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tag: Option<String>,
        message: String,
    },
}

impl ClientFrame {
    pub fn to_ws(&self) -> Result<WsMessage, serde_json::Error> {
        Ok(WsMessage::Text(serde_json::to_string(self)?.into()))
    }
}

impl ServerFrame {
    pub fn to_ws(&self) -> Result<WsMessage, serde_json::Error> {
        Ok(WsMessage::Text(serde_json::to_string(self)?.into()))
    }
}

/// Payloads are opaque bytes; JSON carries them as standard base64.
mod base64_payload {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
