//! Node-to-node file copy used by replication repair.
//!
//! The registry never buffers file bytes: the source node's content stream
//! is piped straight into a multipart upload to the target node.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use thiserror::Error;
use tracing::debug;

use hive_shared::constants::DEFAULT_CONNECT_TIMEOUT_SECS;
use hive_shared::models::{FileRecord, StorageNode};
use hive_shared::protocol::StoredFileInfo;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("source node {node} cannot serve the file: {reason}")]
    SourceUnavailable { node: String, reason: String },

    #[error("target node {node} rejected the file: {reason}")]
    TargetRejected { node: String, reason: String },

    #[error("target node {0} is out of space")]
    TargetFull(String),

    #[error("transfer timed out after {0:?}")]
    Timeout(Duration),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

#[async_trait]
pub trait NodeTransfer: Send + Sync {
    /// Copy `file` from `source` to `target`, returning the bytes stored.
    async fn copy_file(
        &self,
        file: &FileRecord,
        source: &StorageNode,
        target: &StorageNode,
    ) -> Result<u64, TransferError>;
}

/// Streams file content between nodes over their HTTP surfaces.
pub struct HttpNodeTransfer {
    http: reqwest::Client,
    access_token: Option<String>,
    timeout: Duration,
}

impl HttpNodeTransfer {
    pub fn new(access_token: Option<String>, timeout: Duration) -> Result<Self, TransferError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            http,
            access_token,
            timeout,
        })
    }

    fn authorized(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.access_token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn stream_copy(
        &self,
        file: &FileRecord,
        source: &StorageNode,
        target: &StorageNode,
    ) -> Result<u64, TransferError> {
        let source_url = format!(
            "{}/files/{}/content",
            source.endpoint.trim_end_matches('/'),
            file.file_id
        );
        let download = self
            .authorized(self.http.get(&source_url))
            .send()
            .await
            .map_err(|e| TransferError::SourceUnavailable {
                node: source.id.to_string(),
                reason: e.to_string(),
            })?;
        if !download.status().is_success() {
            return Err(TransferError::SourceUnavailable {
                node: source.id.to_string(),
                reason: format!("HTTP {}", download.status()),
            });
        }

        let body = reqwest::Body::wrap_stream(download.bytes_stream());
        let part = Part::stream_with_length(body, file.size).file_name(file.filename.clone());
        let form = Form::new()
            .text("fileId", file.file_id.to_string())
            .part("file", part);

        let target_url = format!("{}/files", target.endpoint.trim_end_matches('/'));
        let upload = self
            .authorized(self.http.post(&target_url))
            .multipart(form)
            .send()
            .await?;

        let status = upload.status();
        if status.as_u16() == 507 {
            return Err(TransferError::TargetFull(target.id.to_string()));
        }
        if !status.is_success() {
            return Err(TransferError::TargetRejected {
                node: target.id.to_string(),
                reason: format!("HTTP {status}"),
            });
        }

        let stored: StoredFileInfo = upload.json().await?;
        if !stored.checksum.eq_ignore_ascii_case(&file.checksum) {
            return Err(TransferError::TargetRejected {
                node: target.id.to_string(),
                reason: format!(
                    "checksum mismatch: expected {}, stored {}",
                    file.checksum, stored.checksum
                ),
            });
        }

        Ok(stored.size)
    }
}

#[async_trait]
impl NodeTransfer for HttpNodeTransfer {
    async fn copy_file(
        &self,
        file: &FileRecord,
        source: &StorageNode,
        target: &StorageNode,
    ) -> Result<u64, TransferError> {
        debug!(
            file_id = %file.file_id,
            source = %source.id,
            target = %target.id,
            size = file.size,
            "Starting node-to-node copy"
        );
        match tokio::time::timeout(self.timeout, self.stream_copy(file, source, target)).await {
            Ok(result) => result,
            Err(_) => Err(TransferError::Timeout(self.timeout)),
        }
    }
}
