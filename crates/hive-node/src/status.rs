//! Live status reported to the registry with every heartbeat.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use hive_shared::models::NodeStatus;
use hive_shared::types::utc_now_millis;

use crate::config::NodeConfig;
use crate::file_store::FileStore;

/// Counts file transfers in flight on this node.
#[derive(Clone, Default)]
pub struct TransferGauge {
    active: Arc<AtomicU32>,
}

impl TransferGauge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a transfer until the returned guard is dropped.
    pub fn start(&self) -> TransferGuard {
        self.active.fetch_add(1, Ordering::Relaxed);
        TransferGuard {
            active: self.active.clone(),
        }
    }

    pub fn active(&self) -> u32 {
        self.active.load(Ordering::Relaxed)
    }
}

pub struct TransferGuard {
    active: Arc<AtomicU32>,
}

impl Drop for TransferGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Load is the busier of the connection and transfer ratios, capped at 1.
pub fn current_load(connections: u32, max_connections: u32, transfers: u32, max_transfers: u32) -> f64 {
    let ratio = |used: u32, max: u32| f64::from(used) / f64::from(max.max(1));
    ratio(connections, max_connections)
        .max(ratio(transfers, max_transfers))
        .min(1.0)
}

pub fn node_status(
    config: &NodeConfig,
    files: &FileStore,
    connections: u32,
    transfers: u32,
) -> NodeStatus {
    NodeStatus {
        is_healthy: true,
        current_load: current_load(
            connections,
            config.max_connections,
            transfers,
            config.max_transfers,
        ),
        available_space: files.available_space(),
        used_space: files.used_space(),
        active_connections: connections,
        active_transfers: transfers,
        network_capacity: config.network_capacity,
        last_updated: utc_now_millis(),
    }
}
