//! # hive-client
//!
//! Client side of Hive: the [`FailoverGateway`] that moves files between a
//! caller and the storage nodes and keeps working when nodes fail, and the
//! [`RealtimeSession`] that keeps a chat connection attached to whichever
//! node the gateway is currently assigned to.

pub mod config;
pub mod error;
pub mod events;
pub mod gateway;
pub mod realtime;
pub mod services;

#[cfg(test)]
mod testing;

pub use config::GatewayConfig;
pub use error::ClientError;
pub use events::{GatewayEvent, GatewayEvents};
pub use gateway::{CurrentNode, FailoverGateway};
pub use realtime::{RealtimeSession, SessionHandle, SessionState, WsConnector};
pub use services::{HttpNodeService, HttpRegistryService, NodeOutcome, NodeService, RegistryService};
