use std::path::PathBuf;

use serde::Deserialize;

use crate::message::DEFAULT_MAX_PAYLOAD_SIZE;

/// Top-level configuration settings for a `tidings` process.
///
/// Includes the process identity, the broker server, the messenger
/// transport, and logging.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub broker: BrokerSettings,
    pub messenger: MessengerSettings,
    pub logging: LoggingSettings,
}

/// Identity of this process on the bus.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    pub name: String,
}

/// Where `tidings broker` listens and how many sockets it accepts.
#[derive(Debug, Deserialize, Clone)]
pub struct BrokerSettings {
    pub host: String,
    pub port: u16,
    pub max_connections: usize,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessengerKind {
    Broker,
    Polling,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MessengerSettings {
    pub kind: MessengerKind,
    pub broker_url: String,
    pub max_payload_bytes: usize,
    pub polling: PollingSettings,
}

/// Tunables of the table-polling transport.
#[derive(Debug, Deserialize, Clone)]
pub struct PollingSettings {
    pub database: PathBuf,
    pub poll_interval_ms: u64,
    pub recency_window_secs: u64,
    pub retention_secs: u64,
    pub cleanup_interval_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingSettings {
    pub level: String,
}

/// Partial configuration settings loaded from files or environment.
///
/// Allows partial specification of settings. Missing values are filled in
/// from [`Settings::default`].
#[derive(Debug, Default, Deserialize)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub broker: Option<PartialBrokerSettings>,
    pub messenger: Option<PartialMessengerSettings>,
    pub logging: Option<PartialLoggingSettings>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PartialServerSettings {
    pub name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PartialBrokerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub max_connections: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PartialMessengerSettings {
    pub kind: Option<MessengerKind>,
    pub broker_url: Option<String>,
    pub max_payload_bytes: Option<usize>,
    pub polling: Option<PartialPollingSettings>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PartialPollingSettings {
    pub database: Option<PathBuf>,
    pub poll_interval_ms: Option<u64>,
    pub recency_window_secs: Option<u64>,
    pub retention_secs: Option<u64>,
    pub cleanup_interval_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PartialLoggingSettings {
    pub level: Option<String>,
}

/// Provides default values for `Settings`.
///
/// A process started without any configuration joins a broker on
/// localhost under the name `tidings`.
impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                name: "tidings".to_string(),
            },
            broker: BrokerSettings {
                host: "127.0.0.1".to_string(),
                port: 8080,
                max_connections: 1000,
            },
            messenger: MessengerSettings {
                kind: MessengerKind::Broker,
                broker_url: "ws://127.0.0.1:8080".to_string(),
                max_payload_bytes: DEFAULT_MAX_PAYLOAD_SIZE,
                polling: PollingSettings {
                    database: PathBuf::from("tidings.db"),
                    poll_interval_ms: 600,
                    recency_window_secs: 30,
                    retention_secs: 3600,
                    cleanup_interval_secs: 600,
                },
            },
            logging: LoggingSettings {
                level: "info".to_string(),
            },
        }
    }
}
