//! Registration with the registry and the periodic heartbeat.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use hive_shared::models::{NodeStatus, StorageNode};
use hive_shared::types::utc_now_millis;

use crate::config::NodeConfig;
use crate::file_store::FileStore;
use crate::hub::Hub;
use crate::registry_client::{HeartbeatOutcome, RegistryClient};
use crate::status::{node_status, TransferGauge};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

pub struct Heartbeat {
    client: RegistryClient,
    config: Arc<NodeConfig>,
    files: Arc<FileStore>,
    hub: Arc<Hub>,
    gauge: TransferGauge,
}

impl Heartbeat {
    pub fn new(
        client: RegistryClient,
        config: Arc<NodeConfig>,
        files: Arc<FileStore>,
        hub: Arc<Hub>,
        gauge: TransferGauge,
    ) -> Self {
        Self {
            client,
            config,
            files,
            hub,
            gauge,
        }
    }

    fn status(&self) -> NodeStatus {
        let connections = u32::try_from(self.hub.connection_count()).unwrap_or(u32::MAX);
        node_status(&self.config, &self.files, connections, self.gauge.active())
    }

    /// The record this node announces on registration.
    pub fn node_record(&self) -> StorageNode {
        node_record(&self.config, self.status())
    }

    /// Register until the registry accepts us or shutdown is requested.
    /// Returns `false` on shutdown.
    pub async fn register_with_retry(&self, shutdown: &CancellationToken) -> bool {
        let mut backoff = INITIAL_BACKOFF;
        loop {
            match self.client.register_node(&self.node_record()).await {
                Ok(node) => {
                    info!(node_id = %node.id, endpoint = %node.endpoint, "Registered with registry");
                    return true;
                }
                Err(e) => {
                    warn!(error = %e, retry_in_secs = backoff.as_secs(), "Registration failed");
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => return false,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        if !self.register_with_retry(&shutdown).await {
            return;
        }

        let mut interval = tokio::time::interval(self.config.heartbeat_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately; registration already reported status
        interval.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            let status = self.status();
            match self.client.heartbeat(&self.config.node_id, &status).await {
                Ok(HeartbeatOutcome::Accepted) => {
                    debug!(
                        load = status.current_load,
                        available = status.available_space,
                        connections = status.active_connections,
                        "Heartbeat sent"
                    );
                }
                Ok(HeartbeatOutcome::UnknownNode) => {
                    warn!("Registry forgot this node, registering again");
                    if !self.register_with_retry(&shutdown).await {
                        break;
                    }
                }
                Err(e) => warn!(error = %e, "Heartbeat failed"),
            }
        }

        info!("Heartbeat loop stopped");
    }
}

pub fn node_record(config: &NodeConfig, status: NodeStatus) -> StorageNode {
    StorageNode {
        id: config.node_id.clone(),
        endpoint: config.public_endpoint.clone(),
        hostname: config.hostname.clone(),
        region: config.region.clone(),
        tags: config.tags.clone(),
        total_storage: config.total_storage,
        metadata: config.metadata(),
        last_seen: utc_now_millis(),
        status,
    }
}
