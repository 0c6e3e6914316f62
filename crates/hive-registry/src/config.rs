//! Registry configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the registry can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use hive_shared::constants::*;

/// Registry configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Socket address for the HTTP (axum) API server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:7000`
    pub http_addr: SocketAddr,

    /// SQLite database file.
    /// Env: `DATABASE_PATH`
    /// Default: `./registry.db`
    pub database_path: PathBuf,

    /// Bearer token every API caller must present.
    /// Env: `API_TOKEN`
    /// Default: empty (authentication disabled, development only).
    pub api_token: Option<String>,

    /// Token handed back on AUTH_FAILURE reassignments.
    /// Env: `CLIENT_TOKEN`
    /// Default: empty (no token refresh).
    pub client_token: Option<String>,

    /// Lifetime advertised with a refreshed client token.
    /// Env: `CLIENT_TOKEN_TTL_SECS`
    pub client_token_ttl: Duration,

    /// Env: `HEALTH_CHECK_INTERVAL_SECS`
    pub health_check_interval: Duration,

    /// Env: `REPLICATION_INTERVAL_SECS`
    pub replication_interval: Duration,

    /// Env: `NODE_OFFLINE_THRESHOLD_SECS`
    pub node_offline_threshold: Duration,

    /// Env: `NODE_EXPIRATION_SECS`
    pub node_expiration: Duration,

    /// Env: `MIN_REPLICATION_FACTOR`
    pub min_replication_factor: usize,

    /// Env: `MAX_PARALLEL_REPLICATIONS`
    pub max_parallel_replications: usize,

    /// Env: `REPLICATION_BATCH_SIZE`
    pub replication_batch_size: usize,

    /// Upper bound for one node-to-node copy.
    /// Env: `TRANSFER_TIMEOUT_SECS`
    pub transfer_timeout: Duration,

    /// Bearer token presented to storage nodes when copying files.
    /// Env: `NODE_ACCESS_TOKEN`
    pub node_access_token: Option<String>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_REGISTRY_PORT).into(),
            database_path: PathBuf::from("./registry.db"),
            api_token: None,
            client_token: None,
            client_token_ttl: Duration::from_secs(3600),
            health_check_interval: Duration::from_secs(DEFAULT_HEALTH_CHECK_INTERVAL_SECS),
            replication_interval: Duration::from_secs(DEFAULT_REPLICATION_INTERVAL_SECS),
            node_offline_threshold: Duration::from_secs(DEFAULT_NODE_OFFLINE_THRESHOLD_SECS),
            node_expiration: Duration::from_secs(DEFAULT_NODE_EXPIRATION_SECS),
            min_replication_factor: DEFAULT_MIN_REPLICATION_FACTOR,
            max_parallel_replications: DEFAULT_MAX_PARALLEL_REPLICATIONS,
            replication_batch_size: DEFAULT_REPLICATION_BATCH_SIZE,
            transfer_timeout: Duration::from_secs(DEFAULT_TRANSFER_TIMEOUT_SECS),
            node_access_token: None,
        }
    }
}

impl RegistryConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("HTTP_ADDR") {
            if let Ok(parsed) = addr.parse::<SocketAddr>() {
                config.http_addr = parsed;
            } else {
                tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default");
            }
        }

        if let Ok(path) = std::env::var("DATABASE_PATH") {
            config.database_path = PathBuf::from(path);
        }

        config.api_token = non_empty("API_TOKEN");
        config.client_token = non_empty("CLIENT_TOKEN");
        config.node_access_token = non_empty("NODE_ACCESS_TOKEN");

        if let Some(secs) = parse_env::<u64>("CLIENT_TOKEN_TTL_SECS") {
            config.client_token_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_env::<u64>("HEALTH_CHECK_INTERVAL_SECS") {
            config.health_check_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(secs) = parse_env::<u64>("REPLICATION_INTERVAL_SECS") {
            config.replication_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(secs) = parse_env::<u64>("NODE_OFFLINE_THRESHOLD_SECS") {
            config.node_offline_threshold = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_env::<u64>("NODE_EXPIRATION_SECS") {
            config.node_expiration = Duration::from_secs(secs);
        }
        if let Some(n) = parse_env::<usize>("MIN_REPLICATION_FACTOR") {
            config.min_replication_factor = n.max(1);
        }
        if let Some(n) = parse_env::<usize>("MAX_PARALLEL_REPLICATIONS") {
            config.max_parallel_replications = n.max(1);
        }
        if let Some(n) = parse_env::<usize>("REPLICATION_BATCH_SIZE") {
            config.replication_batch_size = n.max(1);
        }
        if let Some(secs) = parse_env::<u64>("TRANSFER_TIMEOUT_SECS") {
            config.transfer_timeout = Duration::from_secs(secs.max(1));
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter.

        config
    }
}

fn non_empty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
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
