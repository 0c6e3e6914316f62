//! # hive-node
//!
//! A Hive storage node: holds file bytes on local disk, serves them over
//! HTTP, and hosts the realtime hub that chat clients attach to. The node
//! announces itself to the registry on start and reports its status with a
//! periodic heartbeat.

pub mod api;
pub mod auth;
pub mod config;
pub mod error;
pub mod file_store;
pub mod heartbeat;
pub mod hub;
pub mod registry_client;
pub mod status;
pub mod store;

pub use config::NodeConfig;
pub use error::NodeError;
pub use file_store::FileStore;
pub use hub::Hub;
pub use registry_client::RegistryClient;
pub use status::TransferGauge;
pub use store::LocalStore;
