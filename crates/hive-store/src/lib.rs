//! # hive-store
//!
//! Persistent key-indexed store for Hive, backed by SQLite.
//!
//! The registry keeps its authoritative node, file, channel, user and
//! message tables here; storage nodes use the same schema as a local cache
//! of the channels they serve and the messages they hold. The crate exposes
//! a synchronous [`Database`] handle that wraps a `rusqlite::Connection` and
//! provides typed CRUD helpers for every table.

pub mod channels;
pub mod database;
pub mod files;
pub mod messages;
pub mod migrations;
pub mod nodes;
pub mod users;

mod columns;
mod error;

pub use database::Database;
pub use error::{Result, StoreError};
