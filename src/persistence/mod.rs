//! The `persistence` module backs the polling transport.
//!
//! A shared relational table acts as an append-only event log: publishers
//! insert rows, every process polls for rows newer than its cursor, and old
//! rows are pruned after a retention window. [`EventTable`] is the contract
//! the polling messenger depends on; [`SqliteEventTable`] implements it with
//! `rusqlite` so several processes on one host can share a database file.

pub mod sqlite_store;
pub mod table;

pub use sqlite_store::SqliteEventTable;
pub use table::{EventRow, EventTable, NewEventRow};
