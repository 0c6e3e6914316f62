//! CRUD operations for [`StorageNode`] records.

use rusqlite::{params, OptionalExtension};

use hive_shared::models::{NodeStatus, StorageNode};
use hive_shared::types::NodeId;

use crate::columns::{json_column, millis, timestamp, to_json};
use crate::database::Database;
use crate::error::Result;

const NODE_COLUMNS: &str = "id, endpoint, hostname, region, tags, total_storage, metadata,
     last_seen, is_healthy, current_load, available_space, used_space,
     active_connections, active_transfers, network_capacity, status_updated";

impl Database {
    // ------------------------------------------------------------------
    // Write
    // ------------------------------------------------------------------

    /// Insert a node or overwrite every column of an existing one.
    pub fn upsert_node(&self, node: &StorageNode) -> Result<()> {
        self.conn().execute(
            "INSERT INTO nodes (id, endpoint, hostname, region, tags, total_storage, metadata,
                                last_seen, is_healthy, current_load, available_space, used_space,
                                active_connections, active_transfers, network_capacity, status_updated)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
             ON CONFLICT(id) DO UPDATE SET
                endpoint = excluded.endpoint,
                hostname = excluded.hostname,
                region = excluded.region,
                tags = excluded.tags,
                total_storage = excluded.total_storage,
                metadata = excluded.metadata,
                last_seen = excluded.last_seen,
                is_healthy = excluded.is_healthy,
                current_load = excluded.current_load,
                available_space = excluded.available_space,
                used_space = excluded.used_space,
                active_connections = excluded.active_connections,
                active_transfers = excluded.active_transfers,
                network_capacity = excluded.network_capacity,
                status_updated = excluded.status_updated",
            params![
                node.id.as_str(),
                node.endpoint,
                node.hostname,
                node.region,
                to_json(&node.tags)?,
                node.total_storage as i64,
                to_json(&node.metadata)?,
                millis(&node.last_seen),
                node.status.is_healthy as i32,
                node.status.current_load,
                node.status.available_space as i64,
                node.status.used_space as i64,
                node.status.active_connections,
                node.status.active_transfers,
                node.status.network_capacity as i64,
                millis(&node.status.last_updated),
            ],
        )?;
        Ok(())
    }

    /// Replace a node's status and `last_seen`. Returns `false` for an
    /// unknown node.
    pub fn update_node_status(
        &self,
        id: &NodeId,
        status: &NodeStatus,
        last_seen: chrono::DateTime<chrono::Utc>,
    ) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE nodes SET
                last_seen = ?2, is_healthy = ?3, current_load = ?4, available_space = ?5,
                used_space = ?6, active_connections = ?7, active_transfers = ?8,
                network_capacity = ?9, status_updated = ?10
             WHERE id = ?1",
            params![
                id.as_str(),
                millis(&last_seen),
                status.is_healthy as i32,
                status.current_load,
                status.available_space as i64,
                status.used_space as i64,
                status.active_connections,
                status.active_transfers,
                status.network_capacity as i64,
                millis(&status.last_updated),
            ],
        )?;
        Ok(affected > 0)
    }

    /// Flip the health flag. Returns `true` only if the flag actually changed.
    pub fn set_node_health(&self, id: &NodeId, healthy: bool) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE nodes SET is_healthy = ?2 WHERE id = ?1 AND is_healthy != ?2",
            params![id.as_str(), healthy as i32],
        )?;
        Ok(affected > 0)
    }

    /// Delete a node by id. Returns `true` if a row was deleted.
    pub fn delete_node(&self, id: &NodeId) -> Result<bool> {
        let affected = self
            .conn()
            .execute("DELETE FROM nodes WHERE id = ?1", params![id.as_str()])?;
        Ok(affected > 0)
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    pub fn get_node(&self, id: &NodeId) -> Result<Option<StorageNode>> {
        let node = self
            .conn()
            .query_row(
                &format!("SELECT {NODE_COLUMNS} FROM nodes WHERE id = ?1"),
                params![id.as_str()],
                row_to_node,
            )
            .optional()?;
        Ok(node)
    }

    /// List nodes ordered by id. Unhealthy nodes are skipped unless
    /// `include_unhealthy` is set.
    pub fn list_nodes(&self, include_unhealthy: bool) -> Result<Vec<StorageNode>> {
        let sql = if include_unhealthy {
            format!("SELECT {NODE_COLUMNS} FROM nodes ORDER BY id ASC")
        } else {
            format!("SELECT {NODE_COLUMNS} FROM nodes WHERE is_healthy = 1 ORDER BY id ASC")
        };
        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map([], row_to_node)?;

        let mut nodes = Vec::new();
        for row in rows {
            nodes.push(row?);
        }
        Ok(nodes)
    }
}

fn row_to_node(row: &rusqlite::Row<'_>) -> rusqlite::Result<StorageNode> {
    let id: String = row.get(0)?;
    let tags_json: String = row.get(4)?;
    let total_storage: i64 = row.get(5)?;
    let metadata_json: String = row.get(6)?;
    let last_seen: i64 = row.get(7)?;
    let is_healthy: i32 = row.get(8)?;
    let available_space: i64 = row.get(10)?;
    let used_space: i64 = row.get(11)?;
    let network_capacity: i64 = row.get(14)?;
    let status_updated: i64 = row.get(15)?;

    Ok(StorageNode {
        id: NodeId(id),
        endpoint: row.get(1)?,
        hostname: row.get(2)?,
        region: row.get(3)?,
        tags: json_column(4, &tags_json)?,
        total_storage: total_storage as u64,
        metadata: json_column(6, &metadata_json)?,
        last_seen: timestamp(last_seen),
        status: NodeStatus {
            is_healthy: is_healthy != 0,
            current_load: row.get(9)?,
            available_space: available_space as u64,
            used_space: used_space as u64,
            active_connections: row.get(12)?,
            active_transfers: row.get(13)?,
            network_capacity: network_capacity as u64,
            last_updated: timestamp(status_updated),
        },
    })
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};

    use hive_shared::types::utc_now_millis;

    use super::*;

    fn sample(id: &str) -> StorageNode {
        let now = utc_now_millis();
        StorageNode {
            id: NodeId::from(id),
            endpoint: format!("http://{id}:8080"),
            hostname: id.to_string(),
            region: "eu".into(),
            tags: BTreeSet::from(["ssd".to_string()]),
            total_storage: 10_000,
            metadata: BTreeMap::from([("rack".to_string(), "r1".to_string())]),
            last_seen: now,
            status: NodeStatus::initial(10_000, now),
        }
    }

    #[test]
    fn test_upsert_then_get_is_identical() {
        let db = Database::open_in_memory().unwrap();
        let node = sample("n1");
        db.upsert_node(&node).unwrap();
        assert_eq!(db.get_node(&node.id).unwrap(), Some(node));
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        let mut node = sample("n1");
        db.upsert_node(&node).unwrap();
        node.region = "us".into();
        db.upsert_node(&node).unwrap();

        let all = db.list_nodes(true).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].region, "us");
    }

    #[test]
    fn test_health_flag_reports_transitions() {
        let db = Database::open_in_memory().unwrap();
        let node = sample("n1");
        db.upsert_node(&node).unwrap();

        assert!(db.set_node_health(&node.id, false).unwrap());
        assert!(!db.set_node_health(&node.id, false).unwrap());
        assert!(db.list_nodes(false).unwrap().is_empty());
        assert_eq!(db.list_nodes(true).unwrap().len(), 1);
    }

    #[test]
    fn test_status_update_on_missing_node() {
        let db = Database::open_in_memory().unwrap();
        let node = sample("ghost");
        assert!(!db
            .update_node_status(&node.id, &node.status, node.last_seen)
            .unwrap());
    }

    #[test]
    fn test_delete_node_removes_row() {
        let db = Database::open_in_memory().unwrap();
        let node = sample("n1");
        db.upsert_node(&node).unwrap();
        assert!(db.delete_node(&node.id).unwrap());
        assert!(!db.delete_node(&node.id).unwrap());
        assert!(db.get_node(&node.id).unwrap().is_none());
    }
}
