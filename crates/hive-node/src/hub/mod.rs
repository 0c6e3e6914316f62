//! Realtime hub: websocket sessions, channel groups and presence.

pub mod connections;
pub mod engine;
pub mod groups;
pub mod sync;
pub mod upstream;
pub mod ws;

pub use connections::ConnectionRegistry;
pub use groups::GroupRegistry;
pub use engine::Hub;
pub use upstream::HubUpstream;
