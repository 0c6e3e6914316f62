/// Health-check period of the registry monitor in seconds
pub const DEFAULT_HEALTH_CHECK_INTERVAL_SECS: u64 = 30;

/// Replication scan period of the registry monitor in seconds (15 min)
pub const DEFAULT_REPLICATION_INTERVAL_SECS: u64 = 15 * 60;

/// A node without heartbeat for this long is marked unhealthy (2 min)
pub const DEFAULT_NODE_OFFLINE_THRESHOLD_SECS: u64 = 120;

/// Unhealthy nodes silent for this long are removed from the registry (24 h)
pub const DEFAULT_NODE_EXPIRATION_SECS: u64 = 24 * 60 * 60;

/// Minimum number of healthy copies every file should have
pub const DEFAULT_MIN_REPLICATION_FACTOR: usize = 2;

/// Concurrent node-to-node copies during one replication scan
pub const DEFAULT_MAX_PARALLEL_REPLICATIONS: usize = 4;

/// Files pulled per page when scanning for under-replicated files
pub const DEFAULT_REPLICATION_BATCH_SIZE: usize = 100;

/// Concurrent client uploads/downloads against storage nodes
pub const DEFAULT_MAX_PARALLEL_TRANSFERS: usize = 4;

/// Attempts a client makes for one logical call before giving up
pub const DEFAULT_RETRY_BUDGET: u32 = 3;

/// Base of the linear-per-attempt retry backoff in milliseconds
pub const DEFAULT_RETRY_BACKOFF_BASE_MS: u64 = 1_000;

/// Lifetime of the client's cached active-node list in seconds
pub const DEFAULT_NODE_CACHE_TTL_SECS: u64 = 60;

/// Timeout applied to every outbound HTTP request in seconds
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

/// Timeout for establishing outbound HTTP connections in seconds
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 5;

/// Timeout for a single node-to-node or client file transfer in seconds
pub const DEFAULT_TRANSFER_TIMEOUT_SECS: u64 = 300;

/// Storage node heartbeat period in seconds
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 15;

/// Hub pull-sync period in seconds
pub const DEFAULT_CHANNEL_SYNC_INTERVAL_SECS: u64 = 10;

/// Messages returned per channel by a resync or pull
pub const SYNC_PAGE_SIZE: u32 = 100;

/// How far behind its cursor a pull re-reads, in seconds, to pick up
/// messages that reached the registry late
pub const DEFAULT_SYNC_LOOKBACK_SECS: u64 = 300;

/// How long a hub waits for a redirected user to show up elsewhere before
/// announcing them offline, in seconds
pub const DEFAULT_REDIRECT_GRACE_SECS: u64 = 30;

/// Maximum chat message size in bytes (256 KiB)
pub const MAX_MESSAGE_SIZE: usize = 262_144;

/// Maximum file size accepted by a storage node (512 MiB)
pub const MAX_FILE_SIZE: usize = 512 * 1024 * 1024;

/// Default HTTP port of the registry
pub const DEFAULT_REGISTRY_PORT: u16 = 7000;

/// Default HTTP port of a storage node
pub const DEFAULT_NODE_PORT: u16 = 8080;
