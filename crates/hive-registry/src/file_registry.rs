//! File records, their locations and replication-factor accounting.
//!
//! The replication factor of a file is the number of its locations whose
//! node is currently healthy. Locations on dead nodes are never pruned here.

use std::collections::BTreeSet;

use tracing::{debug, info};

use hive_shared::models::FileRecord;
use hive_shared::protocol::ReplicationCheck;
use hive_shared::types::{utc_now_millis, FileId, NodeId};

use crate::db::SharedDb;
use crate::error::RegistryError;
use crate::node_registry::NodeRegistry;

#[derive(Clone)]
pub struct FileRegistry {
    db: SharedDb,
    nodes: NodeRegistry,
    batch_size: usize,
}

/// One keyset page of the under-replication scan.
#[derive(Debug, Default)]
pub struct ReplicationBatch {
    pub files: Vec<FileRecord>,
    /// Cursor for the next page, `None` once the table is exhausted.
    pub next: Option<FileId>,
}

impl FileRegistry {
    pub fn new(db: SharedDb, nodes: NodeRegistry, batch_size: usize) -> Self {
        Self {
            db,
            nodes,
            batch_size: batch_size.max(1),
        }
    }

    pub fn register_file(&self, file: FileRecord) -> Result<FileRecord, RegistryError> {
        if file.filename.trim().is_empty() {
            return Err(RegistryError::BadRequest("filename must not be empty".into()));
        }
        self.db.with(|db| db.upsert_file(&file))?;
        info!(
            file_id = %file.file_id,
            filename = %file.filename,
            size = file.size,
            "File registered"
        );
        Ok(file)
    }

    pub fn get_file_info(&self, id: FileId) -> Result<Option<FileRecord>, RegistryError> {
        self.db.with(|db| db.get_file(id))
    }

    pub fn update_file_locations(
        &self,
        id: FileId,
        node_ids: &BTreeSet<NodeId>,
    ) -> Result<FileRecord, RegistryError> {
        let known = self
            .db
            .with(|db| db.replace_file_locations(id, node_ids, utc_now_millis()))?;
        if !known {
            return Err(RegistryError::FileNotFound(id));
        }
        self.require(id)
    }

    pub fn add_file_location(&self, id: FileId, node_id: &NodeId) -> Result<FileRecord, RegistryError> {
        let known = self
            .db
            .with(|db| db.add_file_location(id, node_id, utc_now_millis()))?;
        if !known {
            return Err(RegistryError::FileNotFound(id));
        }
        debug!(file_id = %id, node_id = %node_id, "File location added");
        self.require(id)
    }

    pub fn remove_file_location(
        &self,
        id: FileId,
        node_id: &NodeId,
    ) -> Result<FileRecord, RegistryError> {
        let known = self
            .db
            .with(|db| db.remove_file_location(id, node_id, utc_now_millis()))?;
        if !known {
            return Err(RegistryError::FileNotFound(id));
        }
        debug!(file_id = %id, node_id = %node_id, "File location removed");
        self.require(id)
    }

    pub fn files_by_node(&self, node_id: &NodeId) -> Result<Vec<FileRecord>, RegistryError> {
        self.db.with(|db| db.files_on_node(node_id))
    }

    /// Drops the record and its locations. Bytes on nodes are untouched.
    pub fn delete_file(&self, id: FileId) -> Result<bool, RegistryError> {
        let deleted = self.db.with(|db| db.delete_file(id))?;
        if deleted {
            info!(file_id = %id, "File deregistered");
        }
        Ok(deleted)
    }

    /// Files whose name matches the glob `pattern` (case insensitive) and
    /// that carry every tag in `tags`.
    pub fn list_files(
        &self,
        pattern: Option<&str>,
        tags: &BTreeSet<String>,
    ) -> Result<Vec<FileRecord>, RegistryError> {
        let pattern = pattern.map(filename_pattern).transpose()?;
        let files = self.db.with(|db| db.list_files())?;
        Ok(files
            .into_iter()
            .filter(|f| pattern.as_ref().map_or(true, |p| filename_matches(p, &f.filename)))
            .filter(|f| tags.is_subset(&f.tags))
            .collect())
    }

    // ------------------------------------------------------------------
    // Replication accounting
    // ------------------------------------------------------------------

    pub fn replication_status(
        &self,
        id: FileId,
        min_replication_factor: usize,
    ) -> Result<Option<ReplicationCheck>, RegistryError> {
        let Some(file) = self.get_file_info(id)? else {
            return Ok(None);
        };
        let healthy = self.nodes.healthy_node_ids()?;
        let healthy_locations = healthy_location_count(&file, &healthy);
        Ok(Some(ReplicationCheck {
            file_id: id,
            min_replication_factor,
            healthy_locations,
            satisfied: healthy_locations >= min_replication_factor,
        }))
    }

    /// `true` iff the file has at least `min` healthy locations. Unknown
    /// files are never satisfied.
    pub fn check_replication_factor(&self, id: FileId, min: usize) -> Result<bool, RegistryError> {
        Ok(self
            .replication_status(id, min)?
            .map_or(false, |status| status.satisfied))
    }

    /// Scan one page of `batch_size` files after `after` and keep the ones
    /// with fewer than `min` locations in `healthy`.
    pub fn under_replicated_batch(
        &self,
        min: usize,
        after: Option<FileId>,
        healthy: &BTreeSet<NodeId>,
    ) -> Result<ReplicationBatch, RegistryError> {
        let page = self
            .db
            .with(|db| db.list_files_after(after, self.batch_size))?;

        let next = if page.len() == self.batch_size {
            page.last().map(|f| f.file_id)
        } else {
            None
        };

        let files = page
            .into_iter()
            .filter(|f| healthy_location_count(f, healthy) < min)
            .collect();

        Ok(ReplicationBatch { files, next })
    }

    /// Every under-replicated file, gathered page by page.
    pub fn files_needing_replication(&self, min: usize) -> Result<Vec<FileRecord>, RegistryError> {
        let healthy = self.nodes.healthy_node_ids()?;
        let mut result = Vec::new();
        let mut after = None;
        loop {
            let batch = self.under_replicated_batch(min, after, &healthy)?;
            result.extend(batch.files);
            match batch.next {
                Some(cursor) => after = Some(cursor),
                None => break,
            }
        }
        Ok(result)
    }

    fn require(&self, id: FileId) -> Result<FileRecord, RegistryError> {
        self.get_file_info(id)?
            .ok_or(RegistryError::FileNotFound(id))
    }
}

pub fn healthy_location_count(file: &FileRecord, healthy: &BTreeSet<NodeId>) -> usize {
    file.node_ids.intersection(healthy).count()
}

/// Compile a filename filter. Invalid patterns are a caller error.
pub fn filename_pattern(pattern: &str) -> Result<glob::Pattern, RegistryError> {
    glob::Pattern::new(pattern)
        .map_err(|e| RegistryError::BadRequest(format!("invalid filename pattern {pattern:?}: {e}")))
}

/// Case-insensitive filename match; `/` is an ordinary character.
pub fn filename_matches(pattern: &glob::Pattern, name: &str) -> bool {
    pattern.matches_with(
        name,
        glob::MatchOptions {
            case_sensitive: false,
            ..Default::default()
        },
    )
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::BTreeMap;

    use hive_shared::types::UserId;

    use super::*;
    use crate::node_registry::tests::node;

    pub(crate) fn record(name: &str, nodes: &[&str]) -> FileRecord {
        let now = utc_now_millis();
        FileRecord {
            file_id: FileId::new(),
            filename: name.into(),
            content_type: "application/octet-stream".into(),
            size: 64,
            checksum: hive_shared::models::content_checksum(name.as_bytes()),
            node_ids: nodes.iter().map(|n| NodeId::from(*n)).collect(),
            tags: BTreeSet::new(),
            metadata: BTreeMap::new(),
            owner_id: UserId::from("alice"),
            created_at: now,
            modified_at: now,
        }
    }

    fn registries(batch_size: usize) -> (NodeRegistry, FileRegistry) {
        let db = SharedDb::in_memory().unwrap();
        let nodes = NodeRegistry::new(db.clone());
        let files = FileRegistry::new(db, nodes.clone(), batch_size);
        (nodes, files)
    }

    fn name_matches(pattern: &str, name: &str) -> bool {
        filename_matches(&filename_pattern(pattern).unwrap(), name)
    }

    #[test]
    fn test_filename_patterns() {
        assert!(name_matches("*.PDF", "report.pdf"));
        assert!(name_matches("rep?rt*", "Report-2024.txt"));
        assert!(name_matches("*", ""));
        assert!(name_matches("a*b*c", "aXXbYYc"));
        assert!(name_matches("[0-9]*.log", "2024-01.log"));
        assert!(!name_matches("a*b*c", "aXXbYY"));
        assert!(!name_matches("?", ""));
        assert!(!name_matches("report", "report.pdf"));
    }

    #[test]
    fn test_invalid_pattern_is_bad_request() {
        let (_, files) = registries(10);
        let err = files.list_files(Some("[unclosed"), &BTreeSet::new()).unwrap_err();
        assert!(matches!(err, RegistryError::BadRequest(_)));
    }

    #[test]
    fn test_add_location_twice_yields_one_entry() {
        let (_, files) = registries(10);
        let f = files.register_file(record("a.txt", &[])).unwrap();
        let n = NodeId::from("n1");

        files.add_file_location(f.file_id, &n).unwrap();
        let after = files.add_file_location(f.file_id, &n).unwrap();
        assert_eq!(after.node_ids.len(), 1);
        assert!(after.is_on(&n));
    }

    #[test]
    fn test_location_changes_on_unknown_file_are_not_found() {
        let (_, files) = registries(10);
        let err = files
            .add_file_location(FileId::new(), &NodeId::from("n1"))
            .unwrap_err();
        assert!(matches!(err, RegistryError::FileNotFound(_)));
        assert!(files.get_file_info(FileId::new()).unwrap().is_none());
    }

    #[test]
    fn test_update_replaces_and_remove_is_idempotent() {
        let (_, files) = registries(10);
        let f = files.register_file(record("a.txt", &["n1", "n2"])).unwrap();

        let set: BTreeSet<NodeId> = [NodeId::from("n3")].into();
        let updated = files.update_file_locations(f.file_id, &set).unwrap();
        assert_eq!(updated.node_ids, set);

        files.remove_file_location(f.file_id, &NodeId::from("n3")).unwrap();
        let again = files
            .remove_file_location(f.file_id, &NodeId::from("n3"))
            .unwrap();
        assert!(again.node_ids.is_empty());
    }

    #[test]
    fn test_list_files_filters_name_and_tags() {
        let (_, files) = registries(10);
        let mut a = record("Holiday.jpg", &[]);
        a.tags.insert("photos".into());
        let b = record("notes.txt", &[]);
        files.register_file(a.clone()).unwrap();
        files.register_file(b).unwrap();

        let found = files.list_files(Some("*.JPG"), &BTreeSet::new()).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].file_id, a.file_id);

        let tagged = files
            .list_files(None, &["photos".to_string()].into())
            .unwrap();
        assert_eq!(tagged.len(), 1);

        assert_eq!(files.list_files(None, &BTreeSet::new()).unwrap().len(), 2);
    }

    #[test]
    fn test_replication_factor_counts_only_healthy_locations() {
        let (nodes, files) = registries(10);
        nodes.register_node(node("a", "eu", 100, 0.0)).unwrap();
        nodes.register_node(node("b", "eu", 100, 0.0)).unwrap();
        let f = files.register_file(record("x", &["a", "b"])).unwrap();

        assert!(files.check_replication_factor(f.file_id, 2).unwrap());
        nodes.mark_node_unhealthy(&NodeId::from("a")).unwrap();
        assert!(!files.check_replication_factor(f.file_id, 2).unwrap());

        let status = files.replication_status(f.file_id, 2).unwrap().unwrap();
        assert_eq!(status.healthy_locations, 1);
        assert!(!status.satisfied);

        assert!(!files.check_replication_factor(FileId::new(), 1).unwrap());
    }

    #[test]
    fn test_needing_replication_spans_every_batch() {
        let (nodes, files) = registries(2);
        nodes.register_node(node("a", "eu", 100, 0.0)).unwrap();
        nodes.register_node(node("b", "eu", 100, 0.0)).unwrap();

        let mut under = BTreeSet::new();
        for i in 0..5 {
            let f = files.register_file(record(&format!("u{i}"), &["a"])).unwrap();
            under.insert(f.file_id);
        }
        for i in 0..3 {
            files
                .register_file(record(&format!("ok{i}"), &["a", "b"]))
                .unwrap();
        }

        let found: BTreeSet<FileId> = files
            .files_needing_replication(2)
            .unwrap()
            .into_iter()
            .map(|f| f.file_id)
            .collect();
        assert_eq!(found, under);
        assert!(files.files_needing_replication(1).unwrap().is_empty());
    }
}
