//! Gateway configuration.
//!
//! Built with [`GatewayConfig::new`] and refined with the `with_*` methods:
//!
//! ```
//! use std::time::Duration;
//! use hive_client::GatewayConfig;
//!
//! let config = GatewayConfig::new("http://registry:7000", "alice")
//!     .with_region("eu-west")
//!     .with_retry(5, Duration::from_millis(500));
//! assert_eq!(config.retry_budget, 5);
//! ```

use std::time::Duration;

use hive_shared::constants::*;
use hive_shared::types::UserId;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Base URL of the registry API.
    pub registry_url: String,
    pub registry_token: Option<String>,
    /// Owner recorded on uploaded files and identity used on the hub.
    pub user_id: UserId,
    /// Preferred region for writes and reassignment.
    pub region: Option<String>,
    /// Token presented to storage nodes until a reassignment refreshes it.
    pub node_token: Option<String>,
    pub max_parallel_transfers: usize,
    /// Attempts per logical call, the first one included.
    pub retry_budget: u32,
    /// Backoff before attempt `n + 1` is `retry_backoff_base * n`.
    pub retry_backoff_base: Duration,
    pub node_cache_ttl: Duration,
    pub request_timeout: Duration,
    pub transfer_timeout: Duration,
}

impl GatewayConfig {
    pub fn new(registry_url: impl Into<String>, user_id: impl Into<String>) -> Self {
        let registry_url: String = registry_url.into();
        Self {
            registry_url: registry_url.trim_end_matches('/').to_string(),
            registry_token: None,
            user_id: UserId::new(user_id),
            region: None,
            node_token: None,
            max_parallel_transfers: DEFAULT_MAX_PARALLEL_TRANSFERS,
            retry_budget: DEFAULT_RETRY_BUDGET,
            retry_backoff_base: Duration::from_millis(DEFAULT_RETRY_BACKOFF_BASE_MS),
            node_cache_ttl: Duration::from_secs(DEFAULT_NODE_CACHE_TTL_SECS),
            request_timeout: Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS),
            transfer_timeout: Duration::from_secs(DEFAULT_TRANSFER_TIMEOUT_SECS),
        }
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_registry_token(mut self, token: impl Into<String>) -> Self {
        self.registry_token = Some(token.into());
        self
    }

    pub fn with_node_token(mut self, token: impl Into<String>) -> Self {
        self.node_token = Some(token.into());
        self
    }

    pub fn with_max_parallel_transfers(mut self, n: usize) -> Self {
        self.max_parallel_transfers = n.max(1);
        self
    }

    pub fn with_retry(mut self, budget: u32, backoff_base: Duration) -> Self {
        self.retry_budget = budget.max(1);
        self.retry_backoff_base = backoff_base;
        self
    }

    pub fn with_node_cache_ttl(mut self, ttl: Duration) -> Self {
        self.node_cache_ttl = ttl;
        self
    }

    pub fn with_timeouts(mut self, request: Duration, transfer: Duration) -> Self {
        self.request_timeout = request;
        self.transfer_timeout = transfer;
        self
    }

    /// Delay after the `attempt`-th failure (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.retry_backoff_base * attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::new("http://registry:7000/", "alice");
        assert_eq!(config.registry_url, "http://registry:7000");
        assert_eq!(config.retry_budget, 3);
        assert_eq!(config.max_parallel_transfers, 4);
        assert_eq!(config.node_cache_ttl, Duration::from_secs(60));
    }

    #[test]
    fn test_backoff_is_linear() {
        let config = GatewayConfig::new("http://r", "u").with_retry(3, Duration::from_secs(1));
        assert_eq!(config.backoff(1), Duration::from_secs(1));
        assert_eq!(config.backoff(3), Duration::from_secs(3));
    }

    #[test]
    fn test_builders_clamp() {
        let config = GatewayConfig::new("http://r", "u")
            .with_retry(0, Duration::ZERO)
            .with_max_parallel_transfers(0);
        assert_eq!(config.retry_budget, 1);
        assert_eq!(config.max_parallel_transfers, 1);
    }
}
