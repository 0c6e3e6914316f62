//! On-disk file bytes for a storage node.
//!
//! Layout under the storage directory:
//!
//! ```text
//! <fileId>             content
//! <fileId>.meta.json   StoredFileInfo sidecar (size, checksum, storedAt)
//! <fileId>.<uuid>.partial   in-flight write, renamed into place on commit
//! ```
//!
//! Capacity is enforced while bytes stream in: every chunk reserves space
//! against `total_storage` before it is written.

use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use hive_shared::protocol::StoredFileInfo;
use hive_shared::types::{utc_now_millis, FileId};

use crate::error::NodeError;

const META_SUFFIX: &str = ".meta.json";
const PARTIAL_SUFFIX: &str = ".partial";

/// Verify that a resolved path stays within the storage directory.
fn ensure_within(base: &Path, target: &Path) -> Result<PathBuf, NodeError> {
    let relative = target.strip_prefix(base).unwrap_or(target);
    let mut resolved = base.to_path_buf();
    for component in relative.components() {
        match component {
            Component::Normal(c) => resolved.push(c),
            Component::CurDir => {}
            _ => {
                return Err(NodeError::BadRequest("Path traversal detected".to_string()));
            }
        }
    }
    if resolved.parent() != Some(base) {
        return Err(NodeError::BadRequest("Path traversal detected".to_string()));
    }
    Ok(resolved)
}

#[derive(Debug, Default)]
struct Usage {
    committed: u64,
    reserved: u64,
}

#[derive(Debug)]
pub struct FileStore {
    base_path: PathBuf,
    total_storage: u64,
    max_file_size: u64,
    usage: Mutex<Usage>,
}

impl FileStore {
    /// Open (creating if needed) the storage directory, drop leftovers of
    /// interrupted uploads and account for the files already present.
    pub async fn open(
        base_path: PathBuf,
        total_storage: u64,
        max_file_size: u64,
    ) -> Result<Self, NodeError> {
        fs::create_dir_all(&base_path).await.map_err(|e| {
            NodeError::Storage(format!(
                "Failed to create storage directory '{}': {}",
                base_path.display(),
                e
            ))
        })?;

        let store = Self {
            base_path,
            total_storage,
            max_file_size,
            usage: Mutex::new(Usage::default()),
        };

        let mut committed = 0u64;
        let mut entries = fs::read_dir(&store.base_path)
            .await
            .map_err(|e| NodeError::Storage(format!("Failed to scan storage: {e}")))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| NodeError::Storage(format!("Failed to read directory entry: {e}")))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(PARTIAL_SUFFIX) {
                warn!(file = %name, "Removing interrupted upload");
                let _ = fs::remove_file(entry.path()).await;
            } else if name.ends_with(META_SUFFIX) {
                if let Ok(meta) = read_meta(&entry.path()).await {
                    committed += meta.size;
                }
            }
        }

        store.lock_usage()?.committed = committed;
        info!(
            path = %store.base_path.display(),
            used = committed,
            total = total_storage,
            "File store initialized"
        );
        Ok(store)
    }

    pub fn total_storage(&self) -> u64 {
        self.total_storage
    }

    pub fn used_space(&self) -> u64 {
        self.lock_usage().map(|u| u.committed).unwrap_or(self.total_storage)
    }

    /// Space not taken by stored files or in-flight uploads.
    pub fn available_space(&self) -> u64 {
        self.lock_usage()
            .map(|u| {
                self.total_storage
                    .saturating_sub(u.committed)
                    .saturating_sub(u.reserved)
            })
            .unwrap_or(0)
    }

    /// Start writing `id`. An existing file with the same id is replaced on
    /// commit. Concurrent writes of one id each get their own partial file.
    pub async fn begin_write(&self, id: FileId) -> Result<PendingFile<'_>, NodeError> {
        let partial = self.safe_path(&format!("{id}.{}{PARTIAL_SUFFIX}", uuid::Uuid::new_v4()))?;
        let out = fs::File::create(&partial)
            .await
            .map_err(|e| NodeError::Storage(format!("Failed to create {}: {}", id, e)))?;
        Ok(PendingFile {
            store: self,
            file_id: id,
            partial,
            out: Some(out),
            hasher: blake3::Hasher::new(),
            size: 0,
            reserved: 0,
            committed: false,
        })
    }

    /// Store a complete buffer in one go.
    pub async fn store_bytes(&self, id: FileId, data: &[u8]) -> Result<StoredFileInfo, NodeError> {
        let mut pending = self.begin_write(id).await?;
        pending.write(data).await?;
        pending.commit().await
    }

    pub async fn info(&self, id: FileId) -> Result<StoredFileInfo, NodeError> {
        let meta = self.meta_path(id)?;
        if !meta.exists() {
            return Err(NodeError::FileNotFound(id));
        }
        read_meta(&meta).await
    }

    /// Open the content for streaming.
    pub async fn open_content(&self, id: FileId) -> Result<(fs::File, StoredFileInfo), NodeError> {
        let info = self.info(id).await?;
        let file = fs::File::open(self.content_path(id)?)
            .await
            .map_err(|e| NodeError::Storage(format!("Failed to open {}: {}", id, e)))?;
        Ok((file, info))
    }

    pub async fn read(&self, id: FileId) -> Result<Vec<u8>, NodeError> {
        self.info(id).await?;
        fs::read(self.content_path(id)?)
            .await
            .map_err(|e| NodeError::Storage(format!("Failed to read {}: {}", id, e)))
    }

    pub async fn delete(&self, id: FileId) -> Result<(), NodeError> {
        let info = self.info(id).await?;

        fs::remove_file(self.content_path(id)?)
            .await
            .map_err(|e| NodeError::Storage(format!("Failed to delete {}: {}", id, e)))?;
        fs::remove_file(self.meta_path(id)?)
            .await
            .map_err(|e| NodeError::Storage(format!("Failed to delete metadata of {}: {}", id, e)))?;

        let mut usage = self.lock_usage()?;
        usage.committed = usage.committed.saturating_sub(info.size);
        drop(usage);

        debug!(file_id = %id, size = info.size, "Deleted file");
        Ok(())
    }

    /// Every stored file, ordered by id.
    pub async fn list(&self) -> Result<Vec<StoredFileInfo>, NodeError> {
        let mut files = Vec::new();
        let mut entries = fs::read_dir(&self.base_path)
            .await
            .map_err(|e| NodeError::Storage(format!("Failed to list files: {e}")))?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| NodeError::Storage(format!("Failed to read directory entry: {e}")))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(stem) = name.strip_suffix(META_SUFFIX) {
                if FileId::parse(stem).is_ok() {
                    files.push(read_meta(&entry.path()).await?);
                }
            }
        }

        files.sort_by_key(|f| f.file_id);
        Ok(files)
    }

    fn content_path(&self, id: FileId) -> Result<PathBuf, NodeError> {
        self.safe_path(&id.to_string())
    }

    fn meta_path(&self, id: FileId) -> Result<PathBuf, NodeError> {
        self.safe_path(&format!("{id}{META_SUFFIX}"))
    }

    fn safe_path(&self, name: &str) -> Result<PathBuf, NodeError> {
        ensure_within(&self.base_path, &self.base_path.join(name))
    }

    fn lock_usage(&self) -> Result<std::sync::MutexGuard<'_, Usage>, NodeError> {
        self.usage
            .lock()
            .map_err(|e| NodeError::Internal(format!("usage lock poisoned: {e}")))
    }
}

async fn read_meta(path: &Path) -> Result<StoredFileInfo, NodeError> {
    let raw = fs::read(path)
        .await
        .map_err(|e| NodeError::Storage(format!("Failed to read {}: {}", path.display(), e)))?;
    serde_json::from_slice(&raw)
        .map_err(|e| NodeError::Storage(format!("Corrupt metadata {}: {}", path.display(), e)))
}

/// An upload in progress. Dropping it without [`PendingFile::commit`]
/// discards the partial file and releases its reservation.
pub struct PendingFile<'a> {
    store: &'a FileStore,
    file_id: FileId,
    partial: PathBuf,
    out: Option<fs::File>,
    hasher: blake3::Hasher,
    size: u64,
    reserved: u64,
    committed: bool,
}

impl PendingFile<'_> {
    pub async fn write(&mut self, chunk: &[u8]) -> Result<(), NodeError> {
        let len = chunk.len() as u64;
        let new_size = self.size + len;
        if new_size > self.store.max_file_size {
            return Err(NodeError::FileTooLarge {
                size: new_size,
                max: self.store.max_file_size,
            });
        }

        {
            let mut usage = self.store.lock_usage()?;
            let available = self
                .store
                .total_storage
                .saturating_sub(usage.committed)
                .saturating_sub(usage.reserved);
            if len > available {
                return Err(NodeError::StorageFull {
                    needed: new_size,
                    available: available + self.reserved,
                });
            }
            usage.reserved += len;
            self.reserved += len;
        }

        let out = self
            .out
            .as_mut()
            .ok_or_else(|| NodeError::Internal("write after commit".into()))?;
        out.write_all(chunk)
            .await
            .map_err(|e| NodeError::Storage(format!("Failed to write {}: {}", self.file_id, e)))?;
        self.hasher.update(chunk);
        self.size = new_size;
        Ok(())
    }

    pub async fn commit(mut self) -> Result<StoredFileInfo, NodeError> {
        if self.size == 0 {
            return Err(NodeError::BadRequest("Empty file".to_string()));
        }

        if let Some(mut out) = self.out.take() {
            out.flush()
                .await
                .map_err(|e| NodeError::Storage(format!("Failed to flush {}: {}", self.file_id, e)))?;
        }

        let info = StoredFileInfo {
            file_id: self.file_id,
            size: self.size,
            checksum: self.hasher.finalize().to_hex().to_string(),
            stored_at: utc_now_millis(),
        };

        let replaced = match self.store.info(self.file_id).await {
            Ok(previous) => previous.size,
            Err(_) => 0,
        };

        let content = self.store.content_path(self.file_id)?;
        fs::rename(&self.partial, &content)
            .await
            .map_err(|e| NodeError::Storage(format!("Failed to finalize {}: {}", self.file_id, e)))?;

        let meta = serde_json::to_vec_pretty(&info)
            .map_err(|e| NodeError::Internal(format!("metadata encoding: {e}")))?;
        fs::write(self.store.meta_path(self.file_id)?, meta)
            .await
            .map_err(|e| NodeError::Storage(format!("Failed to write metadata {}: {}", self.file_id, e)))?;

        {
            let mut usage = self.store.lock_usage()?;
            usage.reserved = usage.reserved.saturating_sub(self.reserved);
            usage.committed = usage.committed.saturating_sub(replaced) + self.size;
        }
        self.reserved = 0;
        self.committed = true;

        debug!(
            file_id = %info.file_id,
            size = info.size,
            checksum = %info.checksum,
            "Stored file"
        );
        Ok(info)
    }
}

impl Drop for PendingFile<'_> {
    fn drop(&mut self) {
        if self.reserved > 0 {
            if let Ok(mut usage) = self.store.usage.lock() {
                usage.reserved = usage.reserved.saturating_sub(self.reserved);
            }
        }
        if !self.committed {
            let _ = std::fs::remove_file(&self.partial);
        }
    }
}
