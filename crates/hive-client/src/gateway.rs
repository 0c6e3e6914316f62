//! Client failover gateway.
//!
//! Every file operation goes through here. The gateway picks nodes, fans
//! uploads out in parallel, and when a node misbehaves asks the registry
//! for a different one and retries within a fixed budget.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

use futures::future::join_all;
use tokio::io::AsyncReadExt;
use tokio::sync::{broadcast, Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use hive_shared::models::{FileRecord, StorageNode};
use hive_shared::protocol::{ReassignReason, ReassignmentRequest};
use hive_shared::selection::{by_lowest_load, in_region, select_for_write};
use hive_shared::types::{utc_now_millis, FileId, NodeId};

use crate::config::GatewayConfig;
use crate::error::ClientError;
use crate::events::{GatewayEvent, GatewayEvents};
use crate::services::{HttpNodeService, HttpRegistryService, NodeOutcome, NodeService, RegistryService};

const HASH_CHUNK: usize = 64 * 1024;

/// The node this client is attached to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentNode {
    pub id: NodeId,
    pub endpoint: String,
    pub region: String,
}

impl From<&StorageNode> for CurrentNode {
    fn from(node: &StorageNode) -> Self {
        Self {
            id: node.id.clone(),
            endpoint: node.endpoint.clone(),
            region: node.region.clone(),
        }
    }
}

#[derive(Default)]
struct NodeCache {
    nodes: Vec<StorageNode>,
    fetched_at: Option<Instant>,
}

pub struct FailoverGateway {
    config: GatewayConfig,
    registry: Arc<dyn RegistryService>,
    nodes: Arc<dyn NodeService>,
    current: RwLock<Option<CurrentNode>>,
    token: RwLock<Option<String>>,
    cache: RwLock<NodeCache>,
    refresh_lock: Mutex<()>,
    transfers: Arc<Semaphore>,
    events: GatewayEvents,
    cancel: CancellationToken,
}

impl FailoverGateway {
    pub fn new(
        config: GatewayConfig,
        registry: Arc<dyn RegistryService>,
        nodes: Arc<dyn NodeService>,
    ) -> Self {
        Self {
            token: RwLock::new(config.node_token.clone()),
            transfers: Arc::new(Semaphore::new(config.max_parallel_transfers)),
            config,
            registry,
            nodes,
            current: RwLock::new(None),
            cache: RwLock::new(NodeCache::default()),
            refresh_lock: Mutex::new(()),
            events: GatewayEvents::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Gateway speaking HTTP to the configured registry and to nodes.
    pub fn connect(config: GatewayConfig) -> Result<Self, ClientError> {
        let registry = Arc::new(HttpRegistryService::new(&config)?);
        let nodes = Arc::new(HttpNodeService::new(&config)?);
        Ok(Self::new(config, registry, nodes))
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.events.subscribe()
    }

    pub fn current_node(&self) -> Option<CurrentNode> {
        read(&self.current).clone()
    }

    pub fn set_current_node(&self, node: CurrentNode) {
        *write(&self.current) = Some(node);
    }

    /// Token presented to storage nodes and the hub.
    pub fn token(&self) -> Option<String> {
        read(&self.token).clone()
    }

    /// Abort in-flight transfers and backoff sleeps.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    // ------------------------------------------------------------------
    // Node list cache
    // ------------------------------------------------------------------

    /// Healthy nodes, from the cache while it is fresh.
    pub async fn active_nodes(&self) -> Result<Vec<StorageNode>, ClientError> {
        if let Some(nodes) = self.cached_nodes() {
            return Ok(nodes);
        }

        let _refresh = self.refresh_lock.lock().await;
        // another caller may have refreshed while we waited
        if let Some(nodes) = self.cached_nodes() {
            return Ok(nodes);
        }

        let nodes: Vec<StorageNode> = self
            .registry
            .active_nodes()
            .await?
            .into_iter()
            .filter(StorageNode::is_healthy)
            .collect();
        debug!(count = nodes.len(), "Refreshed active node list");

        *write(&self.cache) = NodeCache {
            nodes: nodes.clone(),
            fetched_at: Some(Instant::now()),
        };
        Ok(nodes)
    }

    pub fn invalidate_nodes(&self) {
        write(&self.cache).fetched_at = None;
    }

    fn cached_nodes(&self) -> Option<Vec<StorageNode>> {
        let cache = read(&self.cache);
        match cache.fetched_at {
            Some(at) if at.elapsed() < self.config.node_cache_ttl => Some(cache.nodes.clone()),
            _ => None,
        }
    }

    /// The current node, choosing one on first use: preferred region
    /// first, then lowest load.
    pub async fn ensure_current(&self) -> Result<CurrentNode, ClientError> {
        if let Some(current) = self.current_node() {
            return Ok(current);
        }

        let region = self.config.region.as_deref();
        let mut nodes = self.active_nodes().await?;
        nodes.sort_by(|a, b| {
            let a_remote = region.is_some() && !in_region(a, region);
            let b_remote = region.is_some() && !in_region(b, region);
            a_remote.cmp(&b_remote).then_with(|| by_lowest_load(a, b))
        });
        let chosen = nodes.first().map(CurrentNode::from).ok_or(ClientError::NoNodesAvailable)?;

        info!(node_id = %chosen.id, endpoint = %chosen.endpoint, "Attached to node");
        self.set_current_node(chosen.clone());
        Ok(chosen)
    }

    // ------------------------------------------------------------------
    // Reassignment
    // ------------------------------------------------------------------

    /// Ask the registry for a different node and switch to it.
    pub async fn reassign(
        &self,
        reason: ReassignReason,
        required_file_access: Vec<FileId>,
    ) -> Result<CurrentNode, ClientError> {
        let previous = self.current_node().map(|c| c.id);
        let request = ReassignmentRequest {
            current_node_id: previous.clone(),
            reason,
            preferred_region: self.config.region.clone(),
            required_file_access,
        };
        let response = self.registry.reassign(&request).await?;

        let node = CurrentNode {
            id: response.node_id,
            endpoint: response.node_endpoint,
            region: response.region,
        };
        self.set_current_node(node.clone());
        if let Some(token) = response.token {
            *write(&self.token) = Some(token);
        }
        self.invalidate_nodes();

        info!(
            previous = ?previous,
            node_id = %node.id,
            endpoint = %node.endpoint,
            ?reason,
            "Reassigned to new node"
        );
        self.events.emit(GatewayEvent::Reassigned {
            previous,
            node_id: node.id.clone(),
            endpoint: node.endpoint.clone(),
            reason,
        });
        Ok(node)
    }

    fn node_failed(&self, node_id: &NodeId, error: impl Into<String>) {
        let error = error.into();
        warn!(node_id = %node_id, error = %error, "Node call failed");
        self.invalidate_nodes();
        self.events.emit(GatewayEvent::NodeFailed {
            node_id: node_id.clone(),
            error,
        });
    }

    /// Move off `failed` if it is the node we are attached to. Registry
    /// trouble is logged; the caller's retry loop carries on.
    async fn recover(&self, reason: ReassignReason, failed: &NodeId, file_id: FileId) {
        let attached = self.current_node().is_some_and(|c| &c.id == failed);
        if !attached && reason != ReassignReason::AuthFailure {
            return;
        }
        if let Err(e) = self.reassign(reason, vec![file_id]).await {
            warn!(error = %e, ?reason, "Reassignment failed");
        }
    }

    // ------------------------------------------------------------------
    // Files
    // ------------------------------------------------------------------

    /// Register `path` with the registry, then push its bytes to
    /// `replication_factor` nodes in parallel.
    ///
    /// The record is registered before any byte moves and is kept even if
    /// every transfer fails; the health monitor repairs missing copies.
    pub async fn upload(
        &self,
        path: &Path,
        tags: Vec<String>,
        replication_factor: usize,
    ) -> Result<FileId, ClientError> {
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| ClientError::Validation(format!("{} has no file name", path.display())))?
            .to_string();
        let (size, checksum) = hash_file(path).await?;
        if size == 0 {
            return Err(ClientError::Validation("cannot upload an empty file".to_string()));
        }

        let candidates = self.active_nodes().await?;
        let targets = select_for_write(
            &candidates,
            self.config.region.as_deref(),
            replication_factor.max(1),
        );
        if targets.is_empty() {
            return Err(ClientError::NoNodesAvailable);
        }

        let now = utc_now_millis();
        let record = FileRecord {
            file_id: FileId::new(),
            filename,
            content_type: content_type_for(path).to_string(),
            size,
            checksum,
            node_ids: BTreeSet::new(),
            tags: tags.into_iter().collect(),
            metadata: BTreeMap::new(),
            owner_id: self.config.user_id.clone(),
            created_at: now,
            modified_at: now,
        };
        let record = self.registry.register_file(&record).await?;
        info!(
            file_id = %record.file_id,
            size,
            targets = targets.len(),
            "Registered file, starting transfers"
        );

        let token = self.token();
        let landed = join_all(
            targets
                .iter()
                .map(|node| self.upload_to(node, &record, path, token.as_deref())),
        )
        .await
        .into_iter()
        .filter(|ok| *ok)
        .count();

        if landed == 0 {
            return Err(ClientError::UploadFailed {
                file_id: record.file_id,
                attempted: targets.len(),
            });
        }
        if landed < replication_factor {
            warn!(
                file_id = %record.file_id,
                landed,
                wanted = replication_factor,
                "File is under-replicated after upload"
            );
        }
        Ok(record.file_id)
    }

    async fn upload_to(
        &self,
        node: &StorageNode,
        record: &FileRecord,
        path: &Path,
        token: Option<&str>,
    ) -> bool {
        let Ok(_permit) = self.transfers.acquire().await else {
            return false;
        };

        let outcome = self
            .cancellable(self.nodes.upload(
                &node.endpoint,
                token,
                record.file_id,
                &record.filename,
                path,
            ))
            .await;

        match outcome {
            Ok(NodeOutcome::Done(stored)) => {
                if !stored.checksum.eq_ignore_ascii_case(&record.checksum) {
                    self.node_failed(&node.id, "stored checksum does not match");
                    return false;
                }
                match self.registry.add_file_location(record.file_id, &node.id).await {
                    Ok(_) => {
                        debug!(file_id = %record.file_id, node_id = %node.id, "Copy confirmed");
                        true
                    }
                    Err(e) => {
                        warn!(file_id = %record.file_id, node_id = %node.id, error = %e, "Failed to record location");
                        false
                    }
                }
            }
            Ok(other) => {
                self.node_failed(&node.id, describe(&other));
                false
            }
            Err(e) => {
                warn!(file_id = %record.file_id, node_id = %node.id, error = %e, "Upload aborted");
                false
            }
        }
    }

    /// Fetch a file into `dest`. Returns `false` if the registry does not
    /// know the file.
    pub async fn download(&self, file_id: FileId, dest: &Path) -> Result<bool, ClientError> {
        let Some(record) = self.registry.get_file(file_id).await? else {
            return Ok(false);
        };

        let partial = partial_path(dest);
        let budget = self.config.retry_budget;
        let mut redirect: Option<CurrentNode> = None;
        let mut last_error = String::new();

        for attempt in 1..=budget {
            let target = match redirect.take() {
                Some(node) => node,
                None => self.ensure_current().await?,
            };

            let outcome = {
                let _permit = self
                    .transfers
                    .acquire()
                    .await
                    .map_err(|_| ClientError::Cancelled)?;
                let token = self.token();
                self.cancellable(self.nodes.download(
                    &target.endpoint,
                    token.as_deref(),
                    file_id,
                    &partial,
                ))
                .await
            };
            let outcome = match outcome {
                Ok(outcome) => outcome,
                Err(e) => {
                    let _ = tokio::fs::remove_file(&partial).await;
                    return Err(e);
                }
            };

            match outcome {
                NodeOutcome::Done(got) if got.checksum.eq_ignore_ascii_case(&record.checksum) => {
                    tokio::fs::rename(&partial, dest).await?;
                    info!(file_id = %file_id, node_id = %target.id, size = got.size, attempt, "Downloaded file");
                    return Ok(true);
                }
                NodeOutcome::Done(got) => {
                    last_error = ClientError::ChecksumMismatch {
                        expected: record.checksum.clone(),
                        actual: got.checksum,
                    }
                    .to_string();
                    self.node_failed(&target.id, last_error.clone());
                    self.recover(ReassignReason::NodeFailure, &target.id, file_id).await;
                }
                NodeOutcome::NotFound => match self.healthy_holder(file_id, &target.id).await? {
                    Some(holder) => {
                        debug!(file_id = %file_id, from = %target.id, to = %holder.id, "Redirecting download");
                        last_error = format!("{file_id} not held by {}", target.id);
                        redirect = Some(holder);
                        continue;
                    }
                    None => {
                        let _ = tokio::fs::remove_file(&partial).await;
                        return Err(ClientError::FileNotFound(file_id));
                    }
                },
                NodeOutcome::Unauthorized => {
                    last_error = format!("{} rejected our token", target.id);
                    self.recover(ReassignReason::AuthFailure, &target.id, file_id).await;
                }
                NodeOutcome::Failed(reason) => {
                    last_error = reason.clone();
                    self.node_failed(&target.id, reason);
                    self.recover(ReassignReason::NodeFailure, &target.id, file_id).await;
                }
            }

            if attempt < budget {
                self.sleep(self.config.backoff(attempt)).await?;
            }
        }

        let _ = tokio::fs::remove_file(&partial).await;
        Err(ClientError::RetriesExhausted {
            attempts: budget,
            last: last_error,
        })
    }

    /// A healthy node other than `exclude` that the registry says holds the
    /// file, preferring our region and then the least loaded.
    async fn healthy_holder(
        &self,
        file_id: FileId,
        exclude: &NodeId,
    ) -> Result<Option<CurrentNode>, ClientError> {
        let Some(record) = self.registry.get_file(file_id).await? else {
            return Ok(None);
        };
        let ids: Vec<NodeId> = record
            .node_ids
            .into_iter()
            .filter(|id| id != exclude)
            .collect();
        if ids.is_empty() {
            return Ok(None);
        }

        let region = self.config.region.as_deref();
        let mut holders: Vec<StorageNode> = self
            .registry
            .nodes_by_ids(&ids)
            .await?
            .into_iter()
            .filter(StorageNode::is_healthy)
            .collect();
        holders.sort_by(|a, b| {
            let a_remote = region.is_some() && !in_region(a, region);
            let b_remote = region.is_some() && !in_region(b, region);
            a_remote.cmp(&b_remote).then_with(|| by_lowest_load(a, b))
        });
        Ok(holders.first().map(CurrentNode::from))
    }

    /// Delete the file from every node holding it and from the registry.
    /// `true` only if every step succeeded. No retries.
    pub async fn delete(&self, file_id: FileId) -> Result<bool, ClientError> {
        let Some(record) = self.registry.get_file(file_id).await? else {
            return Ok(false);
        };

        let ids: Vec<NodeId> = record.node_ids.into_iter().collect();
        let holders = if ids.is_empty() {
            Vec::new()
        } else {
            self.registry.nodes_by_ids(&ids).await?
        };
        let mut all_ok = holders.len() == ids.len();
        if !all_ok {
            warn!(file_id = %file_id, known = holders.len(), listed = ids.len(), "Some locations are unknown nodes");
        }

        let token = self.token();
        let results = join_all(holders.iter().map(|node| {
            let token = token.as_deref();
            async move { (node, self.nodes.delete(&node.endpoint, token, file_id).await) }
        }))
        .await;

        for (node, result) in results {
            match result {
                // already gone counts as deleted
                Ok(NodeOutcome::Done(())) | Ok(NodeOutcome::NotFound) => {}
                Ok(other) => {
                    all_ok = false;
                    self.node_failed(&node.id, describe(&other));
                }
                Err(e) => {
                    all_ok = false;
                    warn!(file_id = %file_id, node_id = %node.id, error = %e, "Delete failed");
                }
            }
        }

        let deregistered = self.registry.delete_file(file_id).await?;
        info!(file_id = %file_id, all_ok, deregistered, "Deleted file");
        Ok(all_ok && deregistered)
    }

    pub async fn list(
        &self,
        name_pattern: Option<&str>,
        tags: &[String],
    ) -> Result<Vec<FileRecord>, ClientError> {
        self.registry.list_files(name_pattern, tags).await
    }

    pub async fn get_info(&self, file_id: FileId) -> Result<Option<FileRecord>, ClientError> {
        self.registry.get_file(file_id).await
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    async fn cancellable<T>(
        &self,
        fut: impl Future<Output = Result<T, ClientError>>,
    ) -> Result<T, ClientError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ClientError::Cancelled),
            result = fut => result,
        }
    }

    async fn sleep(&self, delay: std::time::Duration) -> Result<(), ClientError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ClientError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

fn describe<T>(outcome: &NodeOutcome<T>) -> String {
    match outcome {
        NodeOutcome::Done(_) => "ok".to_string(),
        NodeOutcome::NotFound => "not found".to_string(),
        NodeOutcome::Unauthorized => "unauthorized".to_string(),
        NodeOutcome::Failed(reason) => reason.clone(),
    }
}

fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

/// Size and BLAKE3 checksum of a local file.
async fn hash_file(path: &Path) -> Result<(u64, String), ClientError> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = blake3::Hasher::new();
    let mut buf = vec![0u8; HASH_CHUNK];
    let mut size = 0u64;
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((size, hasher.finalize().to_hex().to_string()))
}

fn content_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "txt" | "log" => "text/plain",
        "json" => "application/json",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tempfile::TempDir;

    use hive_shared::models::content_checksum;
    use hive_shared::types::UserId;

    use super::*;
    use crate::testing::{node, FakeNodes, FakeRegistry};

    struct Fixture {
        registry: Arc<FakeRegistry>,
        nodes: Arc<FakeNodes>,
        gateway: FailoverGateway,
        dir: TempDir,
    }

    fn fixture(nodes: Vec<StorageNode>) -> Fixture {
        let registry = Arc::new(FakeRegistry::with_nodes(nodes));
        let fake_nodes = Arc::new(FakeNodes::default());
        let config = GatewayConfig::new("http://registry", "alice")
            .with_retry(3, Duration::from_millis(1));
        let gateway = FailoverGateway::new(config, registry.clone(), fake_nodes.clone());
        Fixture {
            registry,
            nodes: fake_nodes,
            gateway,
            dir: TempDir::new().unwrap(),
        }
    }

    fn attach(gateway: &FailoverGateway, id: &str) {
        gateway.set_current_node(CurrentNode {
            id: NodeId::from(id),
            endpoint: format!("http://{id}"),
            region: "eu".into(),
        });
    }

    /// Register `content` as held by `holders` and seed their blobs.
    fn seed_file(fx: &Fixture, content: &[u8], holders: &[&str]) -> FileId {
        let now = utc_now_millis();
        let record = FileRecord {
            file_id: FileId::new(),
            filename: "report.txt".into(),
            content_type: "text/plain".into(),
            size: content.len() as u64,
            checksum: content_checksum(content),
            node_ids: holders.iter().map(|h| NodeId::from(*h)).collect(),
            tags: BTreeSet::new(),
            metadata: BTreeMap::new(),
            owner_id: UserId::from("alice"),
            created_at: now,
            modified_at: now,
        };
        for holder in holders {
            fx.nodes.seed(holder, record.file_id, content);
        }
        let id = record.file_id;
        fx.registry.insert_file(record);
        id
    }

    fn drain(rx: &mut broadcast::Receiver<GatewayEvent>) -> Vec<GatewayEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_upload_survives_one_failed_node() {
        let fx = fixture(vec![node("a", "eu", 0.1), node("b", "eu", 0.1), node("c", "eu", 0.1)]);
        fx.nodes.take_down("b");
        let mut rx = fx.gateway.subscribe();

        let path = fx.dir.path().join("notes.txt");
        tokio::fs::write(&path, b"quarterly numbers").await.unwrap();

        let file_id = fx.gateway.upload(&path, vec!["finance".into()], 3).await.unwrap();

        let record = fx.registry.file(file_id).unwrap();
        let holders: Vec<&str> = record.node_ids.iter().map(|n| n.as_str()).collect();
        assert_eq!(holders, ["a", "c"]);
        assert_eq!(record.checksum, content_checksum(b"quarterly numbers"));
        assert_eq!(record.content_type, "text/plain");
        assert!(record.tags.contains("finance"));
        assert!(fx.nodes.holds("a", file_id));
        assert!(!fx.nodes.holds("b", file_id));

        let failed = drain(&mut rx);
        assert!(failed.iter().any(|e| matches!(
            e,
            GatewayEvent::NodeFailed { node_id, .. } if node_id.as_str() == "b"
        )));
    }

    #[tokio::test]
    async fn test_upload_keeps_record_when_every_node_fails() {
        let fx = fixture(vec![node("a", "eu", 0.1), node("b", "eu", 0.1)]);
        fx.nodes.take_down("a");
        fx.nodes.take_down("b");

        let path = fx.dir.path().join("blob.bin");
        tokio::fs::write(&path, b"bytes").await.unwrap();

        let err = fx.gateway.upload(&path, Vec::new(), 2).await.unwrap_err();
        let ClientError::UploadFailed { file_id, attempted } = err else {
            panic!("expected UploadFailed");
        };
        assert_eq!(attempted, 2);
        let record = fx.registry.file(file_id).unwrap();
        assert!(record.node_ids.is_empty());
    }

    #[tokio::test]
    async fn test_upload_without_nodes() {
        let fx = fixture(Vec::new());
        let path = fx.dir.path().join("a.txt");
        tokio::fs::write(&path, b"x").await.unwrap();

        let err = fx.gateway.upload(&path, Vec::new(), 2).await.unwrap_err();
        assert!(matches!(err, ClientError::NoNodesAvailable));
        assert!(matches!(
            fx.gateway.ensure_current().await,
            Err(ClientError::NoNodesAvailable)
        ));
    }

    #[tokio::test]
    async fn test_upload_rejects_empty_file() {
        let fx = fixture(vec![node("a", "eu", 0.1)]);
        let path = fx.dir.path().join("empty.txt");
        tokio::fs::write(&path, b"").await.unwrap();

        let err = fx.gateway.upload(&path, Vec::new(), 1).await.unwrap_err();
        assert!(matches!(err, ClientError::Validation(_)));
    }

    #[tokio::test]
    async fn test_download_fails_over_transparently() {
        let fx = fixture(vec![node("a", "eu", 0.1), node("b", "eu", 0.5)]);
        let file_id = seed_file(&fx, b"hello hive", &["a", "b"]);
        attach(&fx.gateway, "a");
        fx.nodes.take_down("a");
        let mut rx = fx.gateway.subscribe();

        let dest = fx.dir.path().join("out.txt");
        assert!(fx.gateway.download(file_id, &dest).await.unwrap());

        assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"hello hive");
        assert!(!partial_path(&dest).exists());
        assert_eq!(fx.registry.reassigns(), [ReassignReason::NodeFailure]);
        assert_eq!(fx.gateway.current_node().unwrap().id.as_str(), "b");
        assert_eq!(fx.gateway.token().as_deref(), Some("fresh-token"));

        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(
            e,
            GatewayEvent::Reassigned { previous: Some(prev), node_id, .. }
                if prev.as_str() == "a" && node_id.as_str() == "b"
        )));
    }

    #[tokio::test]
    async fn test_download_redirects_to_holder() {
        let fx = fixture(vec![node("a", "eu", 0.1), node("b", "eu", 0.5)]);
        let file_id = seed_file(&fx, b"only on b", &["b"]);
        attach(&fx.gateway, "a");

        let dest = fx.dir.path().join("out.txt");
        assert!(fx.gateway.download(file_id, &dest).await.unwrap());

        assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"only on b");
        assert!(fx.registry.reassigns().is_empty());
        assert_eq!(fx.gateway.current_node().unwrap().id.as_str(), "a");
    }

    #[tokio::test]
    async fn test_download_treats_checksum_mismatch_as_failure() {
        let fx = fixture(vec![node("a", "eu", 0.1), node("b", "eu", 0.5)]);
        let file_id = seed_file(&fx, b"intact", &["a", "b"]);
        attach(&fx.gateway, "a");
        fx.nodes.corrupt("a");

        let dest = fx.dir.path().join("out.txt");
        assert!(fx.gateway.download(file_id, &dest).await.unwrap());
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"intact");
        assert_eq!(fx.registry.reassigns(), [ReassignReason::NodeFailure]);
    }

    #[tokio::test]
    async fn test_download_gives_up_after_budget() {
        let fx = fixture(vec![node("a", "eu", 0.1), node("b", "eu", 0.5)]);
        let file_id = seed_file(&fx, b"unreachable", &["a", "b"]);
        attach(&fx.gateway, "a");
        fx.nodes.take_down("a");
        fx.nodes.take_down("b");

        let dest = fx.dir.path().join("out.txt");
        let err = fx.gateway.download(file_id, &dest).await.unwrap_err();
        assert!(matches!(err, ClientError::RetriesExhausted { attempts: 3, .. }));
        assert!(!dest.exists());
        assert!(!partial_path(&dest).exists());
    }

    #[tokio::test]
    async fn test_download_unknown_file() {
        let fx = fixture(vec![node("a", "eu", 0.1)]);
        let dest = fx.dir.path().join("out.txt");
        assert!(!fx.gateway.download(FileId::new(), &dest).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_fans_out() {
        let fx = fixture(vec![node("a", "eu", 0.1), node("b", "eu", 0.1)]);
        let file_id = seed_file(&fx, b"bye", &["a", "b"]);

        assert!(fx.gateway.delete(file_id).await.unwrap());
        assert!(!fx.nodes.holds("a", file_id));
        assert!(!fx.nodes.holds("b", file_id));
        assert!(fx.registry.file(file_id).is_none());
        assert!(!fx.gateway.delete(file_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_reports_partial_failure() {
        let fx = fixture(vec![node("a", "eu", 0.1), node("b", "eu", 0.1)]);
        let file_id = seed_file(&fx, b"bye", &["a", "b"]);
        fx.nodes.take_down("b");

        assert!(!fx.gateway.delete(file_id).await.unwrap());
        assert!(!fx.nodes.holds("a", file_id));
        assert!(fx.registry.file(file_id).is_none());
    }

    #[tokio::test]
    async fn test_concurrent_refreshes_collapse() {
        let fx = fixture(vec![node("a", "eu", 0.1)]);

        let (x, y, z) = tokio::join!(
            fx.gateway.active_nodes(),
            fx.gateway.active_nodes(),
            fx.gateway.active_nodes()
        );
        assert_eq!(x.unwrap().len(), 1);
        assert_eq!(y.unwrap().len(), 1);
        assert_eq!(z.unwrap().len(), 1);
        assert_eq!(fx.registry.active_calls(), 1);

        fx.gateway.invalidate_nodes();
        fx.gateway.active_nodes().await.unwrap();
        assert_eq!(fx.registry.active_calls(), 2);
    }

    #[tokio::test]
    async fn test_initial_node_prefers_region_then_load() {
        let registry = Arc::new(FakeRegistry::with_nodes(vec![
            node("a", "us", 0.1),
            node("b", "eu", 0.9),
            node("c", "eu", 0.2),
        ]));
        let config = GatewayConfig::new("http://registry", "alice").with_region("eu");
        let gateway = FailoverGateway::new(config, registry, Arc::new(FakeNodes::default()));

        assert_eq!(gateway.ensure_current().await.unwrap().id.as_str(), "c");
    }

    #[tokio::test]
    async fn test_shutdown_cancels_backoff() {
        let fx = fixture(vec![node("a", "eu", 0.1)]);
        let file_id = seed_file(&fx, b"x", &["a"]);
        attach(&fx.gateway, "a");
        fx.nodes.take_down("a");
        fx.gateway.shutdown();

        let dest = fx.dir.path().join("out.txt");
        let err = fx.gateway.download(file_id, &dest).await.unwrap_err();
        assert!(matches!(err, ClientError::Cancelled));
    }

    #[test]
    fn test_content_type_guess() {
        assert_eq!(content_type_for(Path::new("a/B.PNG")), "image/png");
        assert_eq!(content_type_for(Path::new("archive")), "application/octet-stream");
    }
}
