use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, params};
use tracing::debug;

use super::table::{EventRow, EventTable, NewEventRow};
use crate::utils::error::StoreError;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS message_queue (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    created_at  INTEGER NOT NULL,
    sender      TEXT    NOT NULL,
    topic       TEXT    NOT NULL,
    payload     TEXT    NOT NULL
);
CREATE INDEX IF NOT EXISTS ix_message_queue_created_at ON message_queue (created_at);
";

/// Event table stored in SQLite.
///
/// Timestamps are kept as Unix milliseconds. Every call runs on the
/// blocking pool; clones share one connection.
#[derive(Clone)]
pub struct SqliteEventTable {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl SqliteEventTable {
    /// Opens (or creates) a database file shared with other processes.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let opened = path.clone();
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection, StoreError> {
            if let Some(parent) = opened.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            let conn = Connection::open(&opened)?;
            conn.busy_timeout(Duration::from_secs(5))?;
            let mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
            debug!(path = %opened.display(), journal_mode = %mode, "Opened event table");
            Ok(conn)
        })
        .await??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path),
        })
    }

    /// A private database that lives as long as this value.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Ok(Self {
            conn: Arc::new(Mutex::new(Connection::open_in_memory()?)),
            path: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Number of rows currently stored.
    pub async fn len(&self) -> Result<u64, StoreError> {
        self.with_conn(|conn| {
            conn.query_row("SELECT COUNT(*) FROM message_queue", [], |row| {
                row.get::<_, i64>(0)
            })
        })
        .await
        .map(|count| count.max(0) as u64)
    }

    async fn with_conn<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, rusqlite::Error> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        let value = tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock();
            f(&mut conn)
        })
        .await??;
        Ok(value)
    }
}

impl std::fmt::Debug for SqliteEventTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteEventTable")
            .field("path", &self.path)
            .finish()
    }
}

fn from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

#[async_trait]
impl EventTable for SqliteEventTable {
    async fn migrate(&self) -> Result<(), StoreError> {
        self.with_conn(|conn| conn.execute_batch(SCHEMA)).await
    }

    async fn max_id(&self) -> Result<i64, StoreError> {
        self.with_conn(|conn| {
            conn.query_row("SELECT COALESCE(MAX(id), 0) FROM message_queue", [], |row| {
                row.get(0)
            })
        })
        .await
    }

    async fn insert(&self, row: NewEventRow) -> Result<i64, StoreError> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO message_queue (created_at, sender, topic, payload) VALUES (?1, ?2, ?3, ?4)",
                params![
                    row.created_at.timestamp_millis(),
                    row.sender,
                    row.topic,
                    row.payload
                ],
            )?;
            let id = tx.last_insert_rowid();
            tx.commit()?;
            Ok(id)
        })
        .await
    }

    async fn fetch_after(
        &self,
        cursor: i64,
        exclude_sender: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<EventRow>, StoreError> {
        let exclude_sender = exclude_sender.to_string();
        let since = since.timestamp_millis();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, created_at, sender, topic, payload FROM message_queue \
                 WHERE id > ?1 AND sender <> ?2 AND created_at > ?3 \
                 ORDER BY id ASC",
            )?;
            let rows = stmt.query_map(params![cursor, exclude_sender, since], |row| {
                Ok(EventRow {
                    id: row.get(0)?,
                    created_at: from_millis(row.get(1)?),
                    sender: row.get(2)?,
                    topic: row.get(3)?,
                    payload: row.get(4)?,
                })
            })?;
            rows.collect()
        })
        .await
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let cutoff = cutoff.timestamp_millis();
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM message_queue WHERE created_at < ?1",
                params![cutoff],
            )
        })
        .await
        .map(|deleted| deleted as u64)
    }
}
