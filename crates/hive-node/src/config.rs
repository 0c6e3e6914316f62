//! Storage node configuration loaded from environment variables.
//!
//! All settings have sensible defaults so a single node can start next to a
//! local registry with zero configuration.

use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use hive_shared::constants::*;
use hive_shared::types::NodeId;

/// Storage node configuration.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Identity announced to the registry.
    /// Env: `NODE_ID`
    /// Default: `node-1`
    pub node_id: NodeId,

    /// Socket address for the HTTP (axum) server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// Base URL other parties use to reach this node.
    /// Env: `PUBLIC_ENDPOINT`
    /// Default: `http://127.0.0.1:8080`
    pub public_endpoint: String,

    /// Env: `NODE_HOSTNAME`
    pub hostname: String,

    /// Env: `NODE_REGION`
    pub region: String,

    /// Comma-separated.
    /// Env: `NODE_TAGS`
    pub tags: BTreeSet<String>,

    /// Bytes this node offers to the network.
    /// Env: `TOTAL_STORAGE_BYTES`
    /// Default: 10 GiB
    pub total_storage: u64,

    /// Env: `NETWORK_CAPACITY` (bytes per second, advertised only)
    pub network_capacity: u64,

    /// Directory holding file bytes and their metadata sidecars.
    /// Env: `STORAGE_PATH`
    /// Default: `./storage`
    pub storage_path: PathBuf,

    /// SQLite database for the hub's channel and message cache.
    /// Env: `DATABASE_PATH`
    /// Default: `./node.db`
    pub database_path: PathBuf,

    /// Env: `MAX_FILE_SIZE`
    pub max_file_size: u64,

    /// Env: `REGISTRY_URL`
    /// Default: `http://127.0.0.1:7000`
    pub registry_url: String,

    /// Bearer token presented to the registry.
    /// Env: `REGISTRY_TOKEN`
    pub registry_token: Option<String>,

    /// Bearer token callers must present to this node (files and hub).
    /// Env: `API_TOKEN`
    /// Default: empty (authentication disabled, development only).
    pub api_token: Option<String>,

    /// Env: `HEARTBEAT_INTERVAL_SECS`
    pub heartbeat_interval: Duration,

    /// Env: `CHANNEL_SYNC_INTERVAL_SECS`
    pub channel_sync_interval: Duration,

    /// How far behind its cursor a channel pull re-reads for late messages.
    /// Env: `SYNC_LOOKBACK_SECS`
    /// Default: 300
    pub sync_lookback: Duration,

    /// Wait for a redirected user to reconnect elsewhere before Offline.
    /// Env: `REDIRECT_GRACE_SECS`
    /// Default: 30
    pub redirect_grace: Duration,

    /// Hub connections at which the node reports full load.
    /// Env: `MAX_CONNECTIONS`
    pub max_connections: u32,

    /// Concurrent file transfers at which the node reports full load.
    /// Env: `MAX_TRANSFERS`
    pub max_transfers: u32,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: NodeId::from("node-1"),
            http_addr: ([0, 0, 0, 0], DEFAULT_NODE_PORT).into(),
            public_endpoint: format!("http://127.0.0.1:{DEFAULT_NODE_PORT}"),
            hostname: "localhost".to_string(),
            region: "default".to_string(),
            tags: BTreeSet::new(),
            total_storage: 10 * 1024 * 1024 * 1024, // 10 GiB
            network_capacity: 0,
            storage_path: PathBuf::from("./storage"),
            database_path: PathBuf::from("./node.db"),
            max_file_size: MAX_FILE_SIZE as u64,
            registry_url: format!("http://127.0.0.1:{DEFAULT_REGISTRY_PORT}"),
            registry_token: None,
            api_token: None,
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_INTERVAL_SECS),
            channel_sync_interval: Duration::from_secs(DEFAULT_CHANNEL_SYNC_INTERVAL_SECS),
            sync_lookback: Duration::from_secs(DEFAULT_SYNC_LOOKBACK_SECS),
            redirect_grace: Duration::from_secs(DEFAULT_REDIRECT_GRACE_SECS),
            max_connections: 1000,
            max_transfers: 16,
        }
    }
}

impl NodeConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(id) = std::env::var("NODE_ID") {
            if !id.trim().is_empty() {
                config.node_id = NodeId::new(id.trim());
            }
        }

        if let Ok(addr) = std::env::var("HTTP_ADDR") {
            if let Ok(parsed) = addr.parse::<SocketAddr>() {
                config.http_addr = parsed;
            } else {
                tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default");
            }
        }

        if let Ok(endpoint) = std::env::var("PUBLIC_ENDPOINT") {
            config.public_endpoint = endpoint.trim_end_matches('/').to_string();
        }
        if let Ok(hostname) = std::env::var("NODE_HOSTNAME") {
            config.hostname = hostname;
        }
        if let Ok(region) = std::env::var("NODE_REGION") {
            config.region = region;
        }
        if let Ok(tags) = std::env::var("NODE_TAGS") {
            config.tags = tags
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(String::from)
                .collect();
        }

        if let Some(bytes) = parse_env::<u64>("TOTAL_STORAGE_BYTES") {
            config.total_storage = bytes;
        }
        if let Some(bps) = parse_env::<u64>("NETWORK_CAPACITY") {
            config.network_capacity = bps;
        }
        if let Some(bytes) = parse_env::<u64>("MAX_FILE_SIZE") {
            config.max_file_size = bytes;
        }

        if let Ok(path) = std::env::var("STORAGE_PATH") {
            config.storage_path = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("DATABASE_PATH") {
            config.database_path = PathBuf::from(path);
        }

        if let Ok(url) = std::env::var("REGISTRY_URL") {
            config.registry_url = url.trim_end_matches('/').to_string();
        }
        config.registry_token = std::env::var("REGISTRY_TOKEN").ok().filter(|t| !t.is_empty());
        config.api_token = std::env::var("API_TOKEN").ok().filter(|t| !t.is_empty());

        if let Some(secs) = parse_env::<u64>("HEARTBEAT_INTERVAL_SECS") {
            config.heartbeat_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(secs) = parse_env::<u64>("CHANNEL_SYNC_INTERVAL_SECS") {
            config.channel_sync_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(secs) = parse_env::<u64>("SYNC_LOOKBACK_SECS") {
            config.sync_lookback = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_env::<u64>("REDIRECT_GRACE_SECS") {
            config.redirect_grace = Duration::from_secs(secs);
        }
        if let Some(n) = parse_env::<u32>("MAX_CONNECTIONS") {
            config.max_connections = n.max(1);
        }
        if let Some(n) = parse_env::<u32>("MAX_TRANSFERS") {
            config.max_transfers = n.max(1);
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter.

        config
    }

    /// Free-form metadata announced with the node record.
    pub fn metadata(&self) -> BTreeMap<String, String> {
        BTreeMap::from([("version".to_string(), env!("CARGO_PKG_VERSION").to_string())])
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Invalid numeric setting, using default");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = NodeConfig::default();
        assert_eq!(config.http_addr, ([0, 0, 0, 0], 8080).into());
        assert_eq!(config.registry_url, "http://127.0.0.1:7000");
        assert_eq!(config.heartbeat_interval, Duration::from_secs(15));
        assert!(config.api_token.is_none());
        assert_eq!(config.sync_lookback, Duration::from_secs(300));
        assert_eq!(config.redirect_grace, Duration::from_secs(30));
    }
}
