//! # hive-shared
//!
//! Types shared by every Hive process: identifiers, the registry data model,
//! the JSON wire protocol spoken by the registry, storage nodes and the
//! realtime hub, and the error taxonomy used to classify failures.

pub mod constants;
pub mod error;
pub mod models;
pub mod protocol;
pub mod selection;
pub mod types;

pub use error::{ErrorKind, HiveError};
