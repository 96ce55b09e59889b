use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::utils::error::StoreError;

/// A row about to be appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEventRow {
    pub created_at: DateTime<Utc>,
    pub sender: String,
    pub topic: String,
    pub payload: String,
}

/// A row read back from the table. `id` is assigned by the store and
/// increases with every insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRow {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub sender: String,
    pub topic: String,
    pub payload: String,
}

#[async_trait]
pub trait EventTable: Send + Sync + 'static {
    /// Creates the table and its indexes if they are missing.
    async fn migrate(&self) -> Result<(), StoreError>;

    /// Highest row id, or 0 for an empty table.
    async fn max_id(&self) -> Result<i64, StoreError>;

    async fn insert(&self, row: NewEventRow) -> Result<i64, StoreError>;

    /// Rows with `id > cursor`, not sent by `exclude_sender` and created
    /// after `since`, in ascending id order.
    async fn fetch_after(
        &self,
        cursor: i64,
        exclude_sender: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<EventRow>, StoreError>;

    /// Deletes rows created before `cutoff` and returns how many went.
    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
}

#[async_trait]
impl<T: EventTable + ?Sized> EventTable for Arc<T> {
    async fn migrate(&self) -> Result<(), StoreError> {
        (**self).migrate().await
    }

    async fn max_id(&self) -> Result<i64, StoreError> {
        (**self).max_id().await
    }

    async fn insert(&self, row: NewEventRow) -> Result<i64, StoreError> {
        (**self).insert(row).await
    }

    async fn fetch_after(
        &self,
        cursor: i64,
        exclude_sender: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<EventRow>, StoreError> {
        (**self).fetch_after(cursor, exclude_sender, since).await
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        (**self).delete_older_than(cutoff).await
    }
}
