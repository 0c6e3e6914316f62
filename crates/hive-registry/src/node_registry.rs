//! Authoritative view of every storage node in the network.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use hive_shared::models::{NodeStatus, StorageNode};
use hive_shared::protocol::NodeQuery;
use hive_shared::selection::{by_lowest_load, by_most_storage, in_region};
use hive_shared::types::NodeId;

use crate::db::SharedDb;
use crate::error::RegistryError;

#[derive(Clone)]
pub struct NodeRegistry {
    db: SharedDb,
}

impl NodeRegistry {
    pub fn new(db: SharedDb) -> Self {
        Self { db }
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Create or overwrite a node by id.
    pub fn register_node(&self, node: StorageNode) -> Result<StorageNode, RegistryError> {
        validate_node(&node)?;
        self.db.with(|db| db.upsert_node(&node))?;
        info!(
            node_id = %node.id,
            endpoint = %node.endpoint,
            region = %node.region,
            "Node registered"
        );
        Ok(node)
    }

    /// Overwrite an existing node. Unknown ids are rejected.
    pub fn update_node(&self, node: StorageNode) -> Result<StorageNode, RegistryError> {
        validate_node(&node)?;
        let exists = self.db.with(|db| db.get_node(&node.id))?.is_some();
        if !exists {
            return Err(RegistryError::NodeNotFound(node.id));
        }
        self.db.with(|db| db.upsert_node(&node))?;
        debug!(node_id = %node.id, "Node updated");
        Ok(node)
    }

    /// Store a fresh status from the node itself. A heartbeat always marks
    /// the node healthy again.
    pub fn record_heartbeat(
        &self,
        id: &NodeId,
        mut status: NodeStatus,
        now: DateTime<Utc>,
    ) -> Result<StorageNode, RegistryError> {
        status.is_healthy = true;
        status.last_updated = now;

        let known = self.db.with(|db| db.update_node_status(id, &status, now))?;
        if !known {
            return Err(RegistryError::NodeNotFound(id.clone()));
        }
        self.db
            .with(|db| db.get_node(id))?
            .ok_or_else(|| RegistryError::NodeNotFound(id.clone()))
    }

    /// Returns `true` if the node was healthy before the call.
    pub fn mark_node_unhealthy(&self, id: &NodeId) -> Result<bool, RegistryError> {
        if self.db.with(|db| db.get_node(id))?.is_none() {
            return Err(RegistryError::NodeNotFound(id.clone()));
        }
        let changed = self.db.with(|db| db.set_node_health(id, false))?;
        if changed {
            warn!(node_id = %id, "Node marked unhealthy");
        }
        Ok(changed)
    }

    pub fn remove_node(&self, id: &NodeId) -> Result<bool, RegistryError> {
        let removed = self.db.with(|db| db.delete_node(id))?;
        if removed {
            info!(node_id = %id, "Node removed");
        }
        Ok(removed)
    }

    /// Remove unhealthy nodes silent for longer than `expiration`.
    pub fn expire_nodes(
        &self,
        now: DateTime<Utc>,
        expiration: Duration,
    ) -> Result<Vec<NodeId>, RegistryError> {
        let mut expired = Vec::new();
        for node in self.get_all_nodes(true)? {
            if node.is_healthy() || !silent_for(&node, now, expiration) {
                continue;
            }
            if self.db.with(|db| db.delete_node(&node.id))? {
                info!(node_id = %node.id, last_seen = %node.last_seen, "Expired node removed");
                expired.push(node.id);
            }
        }
        Ok(expired)
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    pub fn get_node(&self, id: &NodeId) -> Result<Option<StorageNode>, RegistryError> {
        self.db.with(|db| db.get_node(id))
    }

    pub fn get_all_nodes(&self, include_offline: bool) -> Result<Vec<StorageNode>, RegistryError> {
        self.db.with(|db| db.list_nodes(include_offline))
    }

    pub fn healthy_node_ids(&self) -> Result<BTreeSet<NodeId>, RegistryError> {
        Ok(self
            .get_all_nodes(false)?
            .into_iter()
            .map(|n| n.id)
            .collect())
    }

    /// Nodes matching every criterion in `query`, ordered by id.
    pub fn find_nodes(&self, query: &NodeQuery) -> Result<Vec<StorageNode>, RegistryError> {
        let nodes = self.get_all_nodes(!query.healthy_only)?;
        Ok(nodes
            .into_iter()
            .filter(|n| in_region(n, query.region.as_deref()))
            .filter(|n| query.tags.is_subset(&n.tags))
            .filter(|n| {
                query
                    .min_available_storage
                    .map_or(true, |min| n.available_space() >= min)
            })
            .collect())
    }

    pub fn nodes_with_most_storage(
        &self,
        count: usize,
        region: Option<&str>,
    ) -> Result<Vec<StorageNode>, RegistryError> {
        let mut nodes = self.healthy_in_region(region)?;
        nodes.sort_by(by_most_storage);
        nodes.truncate(count);
        Ok(nodes)
    }

    pub fn nodes_with_lowest_load(
        &self,
        count: usize,
        region: Option<&str>,
    ) -> Result<Vec<StorageNode>, RegistryError> {
        let mut nodes = self.healthy_in_region(region)?;
        nodes.sort_by(by_lowest_load);
        nodes.truncate(count);
        Ok(nodes)
    }

    /// Known nodes among `ids`, in request order. Unknown and repeated ids
    /// are skipped.
    pub fn nodes_by_ids(&self, ids: &[NodeId]) -> Result<Vec<StorageNode>, RegistryError> {
        let mut seen = BTreeSet::new();
        let mut nodes = Vec::with_capacity(ids.len());
        for id in ids {
            if !seen.insert(id) {
                continue;
            }
            if let Some(node) = self.get_node(id)? {
                nodes.push(node);
            }
        }
        Ok(nodes)
    }

    /// Healthy nodes with at least `min_space` bytes free, most storage first.
    pub fn available_nodes(
        &self,
        min_space: u64,
        region: Option<&str>,
    ) -> Result<Vec<StorageNode>, RegistryError> {
        let mut nodes: Vec<StorageNode> = self
            .healthy_in_region(region)?
            .into_iter()
            .filter(|n| n.available_space() >= min_space)
            .collect();
        nodes.sort_by(by_most_storage);
        Ok(nodes)
    }

    fn healthy_in_region(&self, region: Option<&str>) -> Result<Vec<StorageNode>, RegistryError> {
        Ok(self
            .get_all_nodes(false)?
            .into_iter()
            .filter(|n| in_region(n, region))
            .collect())
    }
}

/// `true` when more than `threshold` has passed since the node was last seen.
pub fn silent_for(node: &StorageNode, now: DateTime<Utc>, threshold: Duration) -> bool {
    let silent_ms = now.signed_duration_since(node.last_seen).num_milliseconds();
    silent_ms > i64::try_from(threshold.as_millis()).unwrap_or(i64::MAX)
}

fn validate_node(node: &StorageNode) -> Result<(), RegistryError> {
    if node.id.as_str().trim().is_empty() {
        return Err(RegistryError::BadRequest("node id must not be empty".into()));
    }
    if !(node.endpoint.starts_with("http://") || node.endpoint.starts_with("https://")) {
        return Err(RegistryError::BadRequest(format!(
            "node endpoint must be an http(s) URL: {}",
            node.endpoint
        )));
    }
    Ok(())
}
