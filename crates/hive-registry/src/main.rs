use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use hive_registry::api::{self, AppState};
use hive_registry::monitor::{MonitorConfig, NodeHealthMonitor};
use hive_registry::{
    ChatRegistry, FileRegistry, HttpNodeTransfer, NodeRegistry, Reassigner, RegistryConfig,
    SharedDb,
};
use hive_store::Database;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,hive_registry=debug")),
        )
        .init();

    info!("Starting Hive registry v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = RegistryConfig::from_env();
    info!(
        http_addr = %config.http_addr,
        database = %config.database_path.display(),
        auth_enabled = config.api_token.is_some(),
        min_replication_factor = config.min_replication_factor,
        "Loaded configuration"
    );

    // -----------------------------------------------------------------------
    // 3. Initialize subsystems
    // -----------------------------------------------------------------------
    let db = SharedDb::new(Database::open_at(&config.database_path)?);
    let nodes = NodeRegistry::new(db.clone());
    let files = FileRegistry::new(db.clone(), nodes.clone(), config.replication_batch_size);
    let chat = ChatRegistry::new(db);
    let reassigner = Reassigner::new(
        nodes.clone(),
        files.clone(),
        config.client_token.clone(),
        config.client_token_ttl,
    );

    let transfer = Arc::new(HttpNodeTransfer::new(
        config.node_access_token.clone(),
        config.transfer_timeout,
    )?);
    let monitor = Arc::new(NodeHealthMonitor::new(
        nodes.clone(),
        files.clone(),
        transfer,
        MonitorConfig::from(&config),
    ));

    // -----------------------------------------------------------------------
    // 4. Spawn the health monitor
    // -----------------------------------------------------------------------
    let shutdown = CancellationToken::new();
    let monitor_task = tokio::spawn(monitor.run(shutdown.clone()));

    // -----------------------------------------------------------------------
    // 5. Run the HTTP API server (blocks until shutdown)
    // -----------------------------------------------------------------------
    let http_addr = config.http_addr;
    let app_state = AppState {
        nodes,
        files,
        chat,
        reassigner,
        config: Arc::new(config),
    };

    let result = tokio::select! {
        result = api::serve(app_state, http_addr) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
            Ok(())
        }
    };

    shutdown.cancel();
    if let Err(e) = monitor_task.await {
        tracing::warn!(error = %e, "Health monitor task ended abnormally");
    }

    if let Err(e) = &result {
        tracing::error!(error = %e, "HTTP server failed");
    }
    result
}
