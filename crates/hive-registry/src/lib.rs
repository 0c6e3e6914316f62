//! # hive-registry
//!
//! Central registry service for the Hive network.
//!
//! This crate provides:
//! - **NodeRegistry** / **FileRegistry**: authoritative node and file
//!   metadata with selection and replication-factor queries
//! - **NodeHealthMonitor**: the control loop that marks silent nodes
//!   unhealthy and copies under-replicated files onto healthy nodes
//! - **Reassignment**: hands clients a replacement node after a failure
//! - **Chat backend**: channels, memberships, presence and the message sync
//!   log that storage nodes pull from
//! - **REST API** (axum) exposing all of the above behind a bearer token

pub mod api;
pub mod auth;
pub mod chat;
pub mod config;
pub mod db;
pub mod error;
pub mod file_registry;
pub mod monitor;
pub mod node_registry;
pub mod reassign;
pub mod transfer;

pub use chat::ChatRegistry;
pub use config::RegistryConfig;
pub use db::SharedDb;
pub use error::RegistryError;
pub use file_registry::FileRegistry;
pub use monitor::NodeHealthMonitor;
pub use node_registry::NodeRegistry;
pub use reassign::Reassigner;
pub use transfer::{HttpNodeTransfer, NodeTransfer, TransferError};
