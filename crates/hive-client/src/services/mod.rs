//! Seams between the gateway and the network.
//!
//! The gateway only talks to the registry and to storage nodes through
//! these traits, so tests can swap in fakes.

pub mod node;
pub mod registry;

pub use node::{Downloaded, HttpNodeService, NodeOutcome, NodeService};
pub use registry::{HttpRegistryService, RegistryService};
