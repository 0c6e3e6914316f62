use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use hive_node::api::{self, NodeState};
use hive_node::auth::NodeToken;
use hive_node::heartbeat::Heartbeat;
use hive_node::hub::sync::run_channel_sync;
use hive_node::hub::ConnectionRegistry;
use hive_node::{FileStore, Hub, LocalStore, NodeConfig, RegistryClient, TransferGauge};
use hive_store::Database;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,hive_node=debug")),
        )
        .init();

    info!("Starting Hive storage node v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = Arc::new(NodeConfig::from_env());
    info!(
        node_id = %config.node_id,
        http_addr = %config.http_addr,
        endpoint = %config.public_endpoint,
        region = %config.region,
        registry = %config.registry_url,
        auth_enabled = config.api_token.is_some(),
        "Loaded configuration"
    );

    // -----------------------------------------------------------------------
    // 3. Initialize subsystems
    // -----------------------------------------------------------------------

    // File store (creates directory if missing)
    let files = Arc::new(
        FileStore::open(
            config.storage_path.clone(),
            config.total_storage,
            config.max_file_size,
        )
        .await?,
    );

    // Local channel and message cache
    let store = LocalStore::new(Database::open_at(&config.database_path)?);

    let registry = RegistryClient::new(&config.registry_url, config.registry_token.clone())?;
    let hub = Arc::new(
        Hub::new(
            config.node_id.clone(),
            store,
            ConnectionRegistry::new(),
            Arc::new(registry.clone()),
        )
        .with_sync_lookback(config.sync_lookback)
        .with_redirect_grace(config.redirect_grace),
    );
    let gauge = TransferGauge::new();

    // -----------------------------------------------------------------------
    // 4. Spawn background tasks
    // -----------------------------------------------------------------------
    let shutdown = CancellationToken::new();

    let heartbeat = Heartbeat::new(
        registry,
        config.clone(),
        files.clone(),
        hub.clone(),
        gauge.clone(),
    );
    let heartbeat_task = tokio::spawn(heartbeat.run(shutdown.clone()));
    let sync_task = tokio::spawn(run_channel_sync(
        hub.clone(),
        config.channel_sync_interval,
        shutdown.clone(),
    ));

    // -----------------------------------------------------------------------
    // 5. Run the HTTP API server (blocks until shutdown)
    // -----------------------------------------------------------------------
    let http_addr = config.http_addr;
    let state = NodeState {
        files,
        hub,
        token: NodeToken::new(config.api_token.clone()),
        gauge,
        config,
    };

    let result = tokio::select! {
        result = api::serve(state, http_addr) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
            Ok(())
        }
    };

    shutdown.cancel();
    for (name, task) in [("heartbeat", heartbeat_task), ("channel sync", sync_task)] {
        if let Err(e) = task.await {
            tracing::warn!(task = name, error = %e, "Background task ended abnormally");
        }
    }

    if let Err(e) = &result {
        tracing::error!(error = %e, "HTTP server failed");
    }
    result
}
