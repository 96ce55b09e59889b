//! CLI for tidings
//!
//! Subcommands:
//! - `broker`: run the WebSocket broker
//! - `prune`: delete old rows from the polling table

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use parking_lot::Mutex;
use tidings::broker::Broker;
use tidings::config::load_config_from;
use tidings::persistence::{EventTable, SqliteEventTable};
use tidings::transport::websocket::start_websocket_server;
use tidings::utils::logging;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "tidings", version, about)]
struct Cli {
    /// Configuration file, without extension
    #[arg(long, global = true, env = "TIDINGS_CONFIG", default_value = "config/default")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the WebSocket broker
    Broker,
    /// Delete rows older than the retention window from the polling table
    Prune {
        /// Overrides `messenger.polling.retention_secs`
        #[arg(long)]
        retention_secs: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let settings = load_config_from(&cli.config)
        .with_context(|| format!("failed to load configuration from {}", cli.config))?;
    logging::init(&settings.logging.level);

    match cli.command {
        Command::Broker => {
            let addr = format!("{}:{}", settings.broker.host, settings.broker.port);
            let broker = Arc::new(Mutex::new(Broker::new()));

            tokio::select! {
                result = start_websocket_server(&addr, broker, settings.broker.max_connections) => {
                    if let Err(e) = result {
                        error!("Broker failed: {e}");
                        return Err(e.into());
                    }
                    error!("Broker exited unexpectedly.");
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutdown signal received. Exiting gracefully.");
                }
            }
        }
        Command::Prune { retention_secs } => {
            let polling = &settings.messenger.polling;
            let retention =
                Duration::from_secs(retention_secs.unwrap_or(polling.retention_secs));
            let table = SqliteEventTable::open(&polling.database).await?;
            table.migrate().await?;

            let cutoff = chrono::Utc::now() - chrono::Duration::from_std(retention)?;
            let deleted = table.delete_older_than(cutoff).await?;
            info!(deleted, database = %polling.database.display(), "Pruned old rows");
        }
    }

    Ok(())
}
