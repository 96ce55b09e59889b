//! Messenger backed by a shared relational table.
//!
//! Publishers append one row per message, tagged with the concrete type
//! only; subtype matching happens on the reading side. A background task
//! polls for rows newer than the cursor and fans them out locally. Rows
//! older than the recency window are never delivered, so a process that
//! was away longer than the window simply misses them.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};

use super::{Delivery, Dispatcher, ErasedListener, Identity, Messenger, Subscription};
use crate::config::PollingSettings;
use crate::message::{AnyMessage, MessageCodec, MessageRegistry};
use crate::persistence::{EventTable, NewEventRow};
use crate::utils::error::{BusError, CodecError, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollingOptions {
    pub poll_interval: Duration,
    /// Rows older than this are never delivered.
    pub recency_window: Duration,
    /// Rows older than this are deleted by housekeeping.
    pub retention: Duration,
    pub cleanup_interval: Duration,
}

impl Default for PollingOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(600),
            recency_window: Duration::from_secs(30),
            retention: Duration::from_secs(60 * 60),
            cleanup_interval: Duration::from_secs(10 * 60),
        }
    }
}

impl From<&PollingSettings> for PollingOptions {
    fn from(settings: &PollingSettings) -> Self {
        Self {
            poll_interval: Duration::from_millis(settings.poll_interval_ms),
            recency_window: Duration::from_secs(settings.recency_window_secs),
            retention: Duration::from_secs(settings.retention_secs),
            cleanup_interval: Duration::from_secs(settings.cleanup_interval_secs),
        }
    }
}

/// Outcome of one poll cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollReport {
    pub fetched: usize,
    pub delivered: usize,
    pub dropped: usize,
    /// Cursor after the cycle.
    pub cursor: i64,
}

pub struct PollingMessenger<T: EventTable> {
    inner: Arc<Inner<T>>,
}

impl<T: EventTable> Clone for PollingMessenger<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct Inner<T: EventTable> {
    table: T,
    identity: Identity,
    codec: MessageCodec,
    dispatcher: Arc<Dispatcher>,
    options: PollingOptions,
    poller: Mutex<Poller>,
    /// Read-only mirror of the poller's cursor.
    cursor: AtomicI64,
    worker: parking_lot::Mutex<Option<Worker>>,
    closed: AtomicBool,
}

/// Owns the cursor. Only a poll cycle holding this lock may move it.
struct Poller {
    cursor: i64,
}

struct Worker {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

const MIN_TICK: Duration = Duration::from_millis(1);

fn cutoff(age: Duration) -> DateTime<Utc> {
    let now = Utc::now();
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

impl<T: EventTable> PollingMessenger<T> {
    /// Migrates the table and places the cursor at its current end, so only
    /// rows written after this point are delivered.
    pub async fn open(
        table: T,
        identity: Identity,
        codec: MessageCodec,
        options: PollingOptions,
    ) -> Result<Self, StoreError> {
        table.migrate().await?;
        let cursor = table.max_id().await?;
        info!(%identity, cursor, "Polling messenger opened");

        let dispatcher = Arc::new(Dispatcher::new(codec.registry().clone()));
        Ok(Self {
            inner: Arc::new(Inner {
                table,
                identity,
                codec,
                dispatcher,
                options,
                poller: Mutex::new(Poller { cursor }),
                cursor: AtomicI64::new(cursor),
                worker: parking_lot::Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Runs one poll right away, then keeps polling and pruning in the
    /// background until [`Messenger::close`]. Calling it twice is a no-op.
    pub async fn start(&self) {
        if self.inner.closed.load(Ordering::SeqCst) || self.inner.worker.lock().is_some() {
            return;
        }

        let _ = self.inner.poll_once().await;

        let (stop, mut stopped) = oneshot::channel::<()>();
        let inner = self.inner.clone();
        let task = tokio::spawn(async move {
            let mut poll = tokio::time::interval(inner.options.poll_interval.max(MIN_TICK));
            poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut cleanup = tokio::time::interval(inner.options.cleanup_interval.max(MIN_TICK));
            cleanup.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick is immediate and the initial poll already ran.
            poll.tick().await;

            loop {
                tokio::select! {
                    biased;
                    _ = &mut stopped => break,
                    _ = poll.tick() => {
                        let _ = inner.poll_once().await;
                    }
                    _ = cleanup.tick() => {
                        let _ = inner.cleanup().await;
                    }
                }
            }
            debug!("Poll loop stopped");
        });

        let mut worker = self.inner.worker.lock();
        if worker.is_some() || self.inner.closed.load(Ordering::SeqCst) {
            // Lost a race with a concurrent start or close.
            task.abort();
            return;
        }
        *worker = Some(Worker { stop, task });
    }

    /// Runs one poll cycle. On a store error the cursor stays where it was.
    pub async fn poll_once(&self) -> Result<PollReport, StoreError> {
        self.inner.poll_once().await
    }

    /// Deletes rows older than the retention window.
    pub async fn cleanup(&self) -> Result<u64, StoreError> {
        self.inner.cleanup().await
    }

    pub fn cursor(&self) -> i64 {
        self.inner.cursor.load(Ordering::SeqCst)
    }

    pub fn identity(&self) -> &Identity {
        &self.inner.identity
    }

    pub fn options(&self) -> &PollingOptions {
        &self.inner.options
    }

    /// Number of live listeners registered on exactly `tag`.
    pub fn listener_count(&self, tag: &str) -> usize {
        self.inner.dispatcher.listener_count(tag)
    }

    pub fn is_running(&self) -> bool {
        self.inner.worker.lock().is_some()
    }
}

impl<T: EventTable> Inner<T> {
    async fn poll_once(&self) -> Result<PollReport, StoreError> {
        let mut poller = self.poller.lock().await;
        let since = cutoff(self.options.recency_window);

        let rows = match self
            .table
            .fetch_after(poller.cursor, self.identity.as_str(), since)
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                error!(cursor = poller.cursor, "Failed to poll messages: {e}");
                return Err(e);
            }
        };

        let mut report = PollReport {
            fetched: rows.len(),
            cursor: poller.cursor,
            ..PollReport::default()
        };

        for row in rows {
            report.cursor = report.cursor.max(row.id);
            match self.codec.decode(&row.topic, row.payload.as_bytes()) {
                Ok(message) => {
                    trace!(id = row.id, sender = %row.sender, concrete = message.tag(), "Received message");
                    self.dispatcher.dispatch(&Delivery::new(message)).await;
                    report.delivered += 1;
                }
                Err(e) if e.is_unknown_type() => {
                    trace!(id = row.id, sender = %row.sender, concrete = %row.topic, "Skipping row of unknown type");
                    report.dropped += 1;
                }
                Err(e) => {
                    error!(id = row.id, sender = %row.sender, concrete = %row.topic, "Failed to parse row: {e}");
                    report.dropped += 1;
                }
            }
        }

        poller.cursor = report.cursor;
        self.cursor.store(report.cursor, Ordering::SeqCst);
        Ok(report)
    }

    async fn cleanup(&self) -> Result<u64, StoreError> {
        match self
            .table
            .delete_older_than(cutoff(self.options.retention))
            .await
        {
            Ok(deleted) => {
                if deleted > 0 {
                    debug!(deleted, "Pruned old rows");
                }
                Ok(deleted)
            }
            Err(e) => {
                warn!("Failed to prune old rows: {e}");
                Err(e)
            }
        }
    }
}

#[async_trait]
impl<T: EventTable> Messenger for PollingMessenger<T> {
    fn registry(&self) -> &Arc<MessageRegistry> {
        self.inner.codec.registry()
    }

    async fn publish_any(&self, message: AnyMessage, local: bool) -> bool {
        let concrete = message.tag();
        if self.inner.closed.load(Ordering::SeqCst) {
            warn!(concrete, "Publish on a closed messenger");
            return false;
        }

        let payload = match self.inner.codec.encode(&message) {
            Ok(payload) => payload,
            Err(e) => {
                error!(concrete, "Failed to publish message: {e}");
                return false;
            }
        };
        let payload = match String::from_utf8(payload) {
            Ok(payload) => payload,
            Err(e) => {
                error!(concrete, "Failed to publish message: {}", StoreError::from(e));
                return false;
            }
        };

        if local {
            self.inner
                .dispatcher
                .dispatch(&Delivery::new(message))
                .await;
        }

        let row = NewEventRow {
            created_at: Utc::now(),
            sender: self.inner.identity.to_string(),
            topic: concrete.to_string(),
            payload,
        };
        match self.inner.table.insert(row).await {
            Ok(id) => {
                trace!(concrete, id, "Published message");
                true
            }
            Err(e) => {
                error!(concrete, "Failed to publish message: {e}");
                false
            }
        }
    }

    async fn subscribe_any(
        &self,
        tag: &'static str,
        listener: ErasedListener,
    ) -> Result<Subscription, BusError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        let tag = self
            .registry()
            .resolve(tag)
            .ok_or_else(|| CodecError::Unregistered(tag.to_string()))?;

        let id = self.inner.dispatcher.add(tag, listener);
        Ok(Subscription::new(tag, id, self.inner.dispatcher.clone()))
    }

    async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let worker = self.inner.worker.lock().take();
        if let Some(worker) = worker {
            let _ = worker.stop.send(());
            if tokio::task::try_id() == Some(worker.task.id()) {
                // Called by a listener on the poll task; the loop exits once
                // the current cycle returns.
                debug!("Close requested from the poll task");
            } else {
                let _ = worker.task.await;
            }
        }

        self.inner.dispatcher.clear();
        info!(identity = %self.inner.identity, cursor = self.cursor(), "Polling messenger closed");
    }
}
