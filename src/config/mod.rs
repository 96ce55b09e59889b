mod settings;

use config::{Config, ConfigError, Environment, File};

use settings::{PartialMessengerSettings, PartialPollingSettings, PartialSettings};

pub use settings::{
    BrokerSettings, LoggingSettings, MessengerKind, MessengerSettings, PollingSettings,
    ServerSettings, Settings,
};

/// Loads the configuration from `config/default.toml` (if present) and
/// `TIDINGS__*` environment variables, merged over the default values.
pub fn load_config() -> Result<Settings, ConfigError> {
    load_config_from("config/default")
}

/// Like [`load_config`], with an explicit file (extension optional).
pub fn load_config_from(file: &str) -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name(file).required(false))
        .add_source(
            Environment::with_prefix("TIDINGS")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

    let config = builder.build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    // Merge with defaults
    let default = Settings::default();

    Ok(Settings {
        server: ServerSettings {
            name: partial
                .server
                .and_then(|s| s.name)
                .unwrap_or(default.server.name),
        },
        broker: BrokerSettings {
            host: partial
                .broker
                .as_ref()
                .and_then(|b| b.host.clone())
                .unwrap_or(default.broker.host),
            port: partial
                .broker
                .as_ref()
                .and_then(|b| b.port)
                .unwrap_or(default.broker.port),
            max_connections: partial
                .broker
                .as_ref()
                .and_then(|b| b.max_connections)
                .unwrap_or(default.broker.max_connections),
        },
        messenger: merge_messenger(partial.messenger.unwrap_or_default(), default.messenger),
        logging: LoggingSettings {
            level: partial
                .logging
                .and_then(|l| l.level)
                .unwrap_or(default.logging.level),
        },
    })
}

fn merge_messenger(
    partial: PartialMessengerSettings,
    default: MessengerSettings,
) -> MessengerSettings {
    MessengerSettings {
        kind: partial.kind.unwrap_or(default.kind),
        broker_url: partial.broker_url.unwrap_or(default.broker_url),
        max_payload_bytes: partial
            .max_payload_bytes
            .unwrap_or(default.max_payload_bytes),
        polling: merge_polling(partial.polling.unwrap_or_default(), default.polling),
    }
}

fn merge_polling(partial: PartialPollingSettings, default: PollingSettings) -> PollingSettings {
    PollingSettings {
        database: partial.database.unwrap_or(default.database),
        poll_interval_ms: partial.poll_interval_ms.unwrap_or(default.poll_interval_ms),
        recency_window_secs: partial
            .recency_window_secs
            .unwrap_or(default.recency_window_secs),
        retention_secs: partial.retention_secs.unwrap_or(default.retention_secs),
        cleanup_interval_secs: partial
            .cleanup_interval_secs
            .unwrap_or(default.cleanup_interval_secs),
    }
}
