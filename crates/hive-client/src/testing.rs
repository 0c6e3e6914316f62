//! In-memory registry and node services for unit tests.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use hive_shared::models::{content_checksum, FileRecord, NodeStatus, StorageNode};
use hive_shared::protocol::{
    ReassignReason, ReassignmentRequest, ReassignmentResponse, StoredFileInfo,
};
use hive_shared::types::{utc_now_millis, FileId, NodeId};

use crate::error::ClientError;
use crate::services::{Downloaded, NodeOutcome, NodeService, RegistryService};

pub(crate) fn node(id: &str, region: &str, load: f64) -> StorageNode {
    let now = utc_now_millis();
    let mut status = NodeStatus::initial(1_000_000, now);
    status.current_load = load;
    StorageNode {
        id: NodeId::from(id),
        endpoint: format!("http://{id}"),
        hostname: id.into(),
        region: region.into(),
        tags: BTreeSet::new(),
        total_storage: 1_000_000,
        metadata: BTreeMap::new(),
        last_seen: now,
        status,
    }
}

#[derive(Default)]
struct RegistryState {
    nodes: Vec<StorageNode>,
    files: HashMap<FileId, FileRecord>,
    active_calls: usize,
    reassigns: Vec<ReassignReason>,
}

#[derive(Default)]
pub(crate) struct FakeRegistry {
    state: Mutex<RegistryState>,
}

impl FakeRegistry {
    pub(crate) fn with_nodes(nodes: Vec<StorageNode>) -> Self {
        let registry = Self::default();
        registry.state.lock().unwrap().nodes = nodes;
        registry
    }

    pub(crate) fn insert_file(&self, record: FileRecord) {
        self.state.lock().unwrap().files.insert(record.file_id, record);
    }

    pub(crate) fn file(&self, id: FileId) -> Option<FileRecord> {
        self.state.lock().unwrap().files.get(&id).cloned()
    }

    pub(crate) fn active_calls(&self) -> usize {
        self.state.lock().unwrap().active_calls
    }

    pub(crate) fn reassigns(&self) -> Vec<ReassignReason> {
        self.state.lock().unwrap().reassigns.clone()
    }
}

#[async_trait]
impl RegistryService for FakeRegistry {
    async fn active_nodes(&self) -> Result<Vec<StorageNode>, ClientError> {
        tokio::time::sleep(Duration::from_millis(10)).await;
        let mut state = self.state.lock().unwrap();
        state.active_calls += 1;
        Ok(state.nodes.iter().filter(|n| n.is_healthy()).cloned().collect())
    }

    async fn nodes_by_ids(&self, ids: &[NodeId]) -> Result<Vec<StorageNode>, ClientError> {
        let state = self.state.lock().unwrap();
        Ok(state.nodes.iter().filter(|n| ids.contains(&n.id)).cloned().collect())
    }

    async fn register_file(&self, record: &FileRecord) -> Result<FileRecord, ClientError> {
        self.insert_file(record.clone());
        Ok(record.clone())
    }

    async fn get_file(&self, id: FileId) -> Result<Option<FileRecord>, ClientError> {
        Ok(self.file(id))
    }

    async fn add_file_location(
        &self,
        id: FileId,
        node_id: &NodeId,
    ) -> Result<FileRecord, ClientError> {
        let mut state = self.state.lock().unwrap();
        let record = state.files.get_mut(&id).ok_or(ClientError::FileNotFound(id))?;
        record.node_ids.insert(node_id.clone());
        Ok(record.clone())
    }

    async fn delete_file(&self, id: FileId) -> Result<bool, ClientError> {
        Ok(self.state.lock().unwrap().files.remove(&id).is_some())
    }

    async fn list_files(
        &self,
        name_pattern: Option<&str>,
        _tags: &[String],
    ) -> Result<Vec<FileRecord>, ClientError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .files
            .values()
            .filter(|r| name_pattern.map_or(true, |p| r.filename.contains(p)))
            .cloned()
            .collect())
    }

    async fn reassign(
        &self,
        request: &ReassignmentRequest,
    ) -> Result<ReassignmentResponse, ClientError> {
        let mut state = self.state.lock().unwrap();
        state.reassigns.push(request.reason);
        let mut candidates: Vec<&StorageNode> = state
            .nodes
            .iter()
            .filter(|n| n.is_healthy() && Some(&n.id) != request.current_node_id.as_ref())
            .collect();
        candidates.sort_by(|a, b| a.id.cmp(&b.id));
        let chosen = candidates.first().ok_or(ClientError::NoNodesAvailable)?;
        Ok(ReassignmentResponse {
            node_endpoint: chosen.endpoint.clone(),
            node_id: chosen.id.clone(),
            region: chosen.region.clone(),
            token: Some("fresh-token".into()),
            token_expires_at: None,
        })
    }
}

#[derive(Default)]
struct NodeState {
    down: HashSet<String>,
    corrupt: HashSet<String>,
    blobs: HashMap<(String, FileId), Vec<u8>>,
}

#[derive(Default)]
pub(crate) struct FakeNodes {
    state: Mutex<NodeState>,
}

impl FakeNodes {
    pub(crate) fn take_down(&self, id: &str) {
        self.state.lock().unwrap().down.insert(format!("http://{id}"));
    }

    pub(crate) fn corrupt(&self, id: &str) {
        self.state.lock().unwrap().corrupt.insert(format!("http://{id}"));
    }

    pub(crate) fn seed(&self, id: &str, file_id: FileId, bytes: &[u8]) {
        self.state
            .lock()
            .unwrap()
            .blobs
            .insert((format!("http://{id}"), file_id), bytes.to_vec());
    }

    pub(crate) fn holds(&self, id: &str, file_id: FileId) -> bool {
        self.state
            .lock()
            .unwrap()
            .blobs
            .contains_key(&(format!("http://{id}"), file_id))
    }

    fn is_down(&self, endpoint: &str) -> bool {
        self.state.lock().unwrap().down.contains(endpoint)
    }
}

#[async_trait]
impl NodeService for FakeNodes {
    async fn upload(
        &self,
        endpoint: &str,
        _token: Option<&str>,
        file_id: FileId,
        _filename: &str,
        source: &Path,
    ) -> Result<NodeOutcome<StoredFileInfo>, ClientError> {
        if self.is_down(endpoint) {
            return Ok(NodeOutcome::Failed("HTTP 503 Service Unavailable".into()));
        }
        let bytes = tokio::fs::read(source).await?;
        let stored = StoredFileInfo {
            file_id,
            size: bytes.len() as u64,
            checksum: content_checksum(&bytes),
            stored_at: utc_now_millis(),
        };
        self.state
            .lock()
            .unwrap()
            .blobs
            .insert((endpoint.to_string(), file_id), bytes);
        Ok(NodeOutcome::Done(stored))
    }

    async fn download(
        &self,
        endpoint: &str,
        _token: Option<&str>,
        file_id: FileId,
        dest: &Path,
    ) -> Result<NodeOutcome<Downloaded>, ClientError> {
        if self.is_down(endpoint) {
            return Ok(NodeOutcome::Failed("HTTP 503 Service Unavailable".into()));
        }
        let (bytes, corrupt) = {
            let state = self.state.lock().unwrap();
            let bytes = state.blobs.get(&(endpoint.to_string(), file_id)).cloned();
            (bytes, state.corrupt.contains(endpoint))
        };
        let Some(mut bytes) = bytes else {
            return Ok(NodeOutcome::NotFound);
        };
        if corrupt {
            bytes.push(0xff);
        }
        tokio::fs::write(dest, &bytes).await?;
        Ok(NodeOutcome::Done(Downloaded {
            size: bytes.len() as u64,
            checksum: content_checksum(&bytes),
        }))
    }

    async fn delete(
        &self,
        endpoint: &str,
        _token: Option<&str>,
        file_id: FileId,
    ) -> Result<NodeOutcome<()>, ClientError> {
        if self.is_down(endpoint) {
            return Ok(NodeOutcome::Failed("HTTP 503 Service Unavailable".into()));
        }
        let removed = self
            .state
            .lock()
            .unwrap()
            .blobs
            .remove(&(endpoint.to_string(), file_id));
        Ok(match removed {
            Some(_) => NodeOutcome::Done(()),
            None => NodeOutcome::NotFound,
        })
    }
}
