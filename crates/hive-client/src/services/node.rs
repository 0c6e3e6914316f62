use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::multipart::{Form, Part};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;

use hive_shared::constants::DEFAULT_CONNECT_TIMEOUT_SECS;
use hive_shared::protocol::StoredFileInfo;
use hive_shared::types::FileId;
use hive_shared::ErrorKind;

use crate::config::GatewayConfig;
use crate::error::ClientError;

/// Result of one call against a storage node.
///
/// Remote failures are values so retry loops branch on the tag; local
/// failures (unreadable source, unwritable destination) are `Err`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeOutcome<T> {
    Done(T),
    NotFound,
    Unauthorized,
    /// Network failure or 5xx.
    Failed(String),
}

impl<T> NodeOutcome<T> {
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            NodeOutcome::Done(_) => None,
            NodeOutcome::NotFound => Some(ErrorKind::NotFound),
            NodeOutcome::Unauthorized => Some(ErrorKind::AuthFailure),
            NodeOutcome::Failed(_) => Some(ErrorKind::NodeUnavailable),
        }
    }

    fn from_status(status: reqwest::StatusCode) -> Self {
        match ErrorKind::from_status(status.as_u16()) {
            Some(ErrorKind::NotFound) => NodeOutcome::NotFound,
            Some(ErrorKind::AuthFailure) => NodeOutcome::Unauthorized,
            _ => NodeOutcome::Failed(format!("HTTP {status}")),
        }
    }
}

/// What landed on disk after a download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Downloaded {
    pub size: u64,
    pub checksum: String,
}

#[async_trait]
pub trait NodeService: Send + Sync {
    async fn upload(
        &self,
        endpoint: &str,
        token: Option<&str>,
        file_id: FileId,
        filename: &str,
        source: &Path,
    ) -> Result<NodeOutcome<StoredFileInfo>, ClientError>;

    /// Stream the file into `dest`, hashing as it arrives.
    async fn download(
        &self,
        endpoint: &str,
        token: Option<&str>,
        file_id: FileId,
        dest: &Path,
    ) -> Result<NodeOutcome<Downloaded>, ClientError>;

    async fn delete(
        &self,
        endpoint: &str,
        token: Option<&str>,
        file_id: FileId,
    ) -> Result<NodeOutcome<()>, ClientError>;
}

pub struct HttpNodeService {
    http: reqwest::Client,
}

impl HttpNodeService {
    pub fn new(config: &GatewayConfig) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS))
            .timeout(config.transfer_timeout)
            .build()
            .map_err(|e| ClientError::Validation(format!("http client: {e}")))?;
        Ok(Self { http })
    }

    fn authorized(
        &self,
        req: reqwest::RequestBuilder,
        token: Option<&str>,
    ) -> reqwest::RequestBuilder {
        match token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }
}

fn files_url(endpoint: &str, rest: &str) -> String {
    format!("{}/files{}", endpoint.trim_end_matches('/'), rest)
}

#[async_trait]
impl NodeService for HttpNodeService {
    async fn upload(
        &self,
        endpoint: &str,
        token: Option<&str>,
        file_id: FileId,
        filename: &str,
        source: &Path,
    ) -> Result<NodeOutcome<StoredFileInfo>, ClientError> {
        let file = tokio::fs::File::open(source).await?;
        let size = file.metadata().await?.len();
        let body = reqwest::Body::wrap_stream(ReaderStream::new(file));
        let part = Part::stream_with_length(body, size).file_name(filename.to_string());
        let form = Form::new()
            .text("fileId", file_id.to_string())
            .part("file", part);

        let req = self.authorized(self.http.post(files_url(endpoint, "")), token);
        let resp = match req.multipart(form).send().await {
            Ok(resp) => resp,
            Err(e) => return Ok(NodeOutcome::Failed(e.to_string())),
        };
        if !resp.status().is_success() {
            return Ok(NodeOutcome::from_status(resp.status()));
        }
        match resp.json::<StoredFileInfo>().await {
            Ok(stored) => Ok(NodeOutcome::Done(stored)),
            Err(e) => Ok(NodeOutcome::Failed(format!("invalid response: {e}"))),
        }
    }

    async fn download(
        &self,
        endpoint: &str,
        token: Option<&str>,
        file_id: FileId,
        dest: &Path,
    ) -> Result<NodeOutcome<Downloaded>, ClientError> {
        let url = files_url(endpoint, &format!("/{file_id}/content"));
        let resp = match self.authorized(self.http.get(url), token).send().await {
            Ok(resp) => resp,
            Err(e) => return Ok(NodeOutcome::Failed(e.to_string())),
        };
        if !resp.status().is_success() {
            return Ok(NodeOutcome::from_status(resp.status()));
        }

        let mut out = tokio::fs::File::create(dest).await?;
        let mut hasher = blake3::Hasher::new();
        let mut size = 0u64;
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => return Ok(NodeOutcome::Failed(format!("stream interrupted: {e}"))),
            };
            out.write_all(&chunk).await?;
            hasher.update(&chunk);
            size += chunk.len() as u64;
        }
        out.flush().await?;

        Ok(NodeOutcome::Done(Downloaded {
            size,
            checksum: hasher.finalize().to_hex().to_string(),
        }))
    }

    async fn delete(
        &self,
        endpoint: &str,
        token: Option<&str>,
        file_id: FileId,
    ) -> Result<NodeOutcome<()>, ClientError> {
        let url = files_url(endpoint, &format!("/{file_id}"));
        let resp = match self.authorized(self.http.delete(url), token).send().await {
            Ok(resp) => resp,
            Err(e) => return Ok(NodeOutcome::Failed(e.to_string())),
        };
        if resp.status().is_success() {
            Ok(NodeOutcome::Done(()))
        } else {
            Ok(NodeOutcome::from_status(resp.status()))
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode as AxumStatus;
    use axum::routing::get;
    use axum::Router;

    use super::*;

    async fn spawn(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn service() -> HttpNodeService {
        HttpNodeService::new(&GatewayConfig::new("http://registry", "alice")).unwrap()
    }

    #[tokio::test]
    async fn test_download_hashes_content() {
        let app = Router::new().route("/files/:id/content", get(|| async { "payload" }));
        let endpoint = spawn(app).await;
        let dir = tempfile::TempDir::new().unwrap();
        let dest = dir.path().join("out.bin");

        let outcome = service()
            .download(&endpoint, None, FileId::new(), &dest)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            NodeOutcome::Done(Downloaded {
                size: 7,
                checksum: blake3::hash(b"payload").to_hex().to_string(),
            })
        );
        assert_eq!(std::fs::read(dest).unwrap(), b"payload");
    }

    #[tokio::test]
    async fn test_status_outcomes() {
        let app = Router::new()
            .route(
                "/files/:id/content",
                get(|| async { AxumStatus::SERVICE_UNAVAILABLE }),
            )
            .route(
                "/files/:id",
                axum::routing::delete(|| async { AxumStatus::UNAUTHORIZED }),
            );
        let endpoint = spawn(app).await;
        let dir = tempfile::TempDir::new().unwrap();

        let outcome = service()
            .download(&endpoint, None, FileId::new(), &dir.path().join("x"))
            .await
            .unwrap();
        assert_eq!(outcome.kind(), Some(ErrorKind::NodeUnavailable));

        let outcome = service().delete(&endpoint, None, FileId::new()).await.unwrap();
        assert_eq!(outcome, NodeOutcome::Unauthorized);
    }

    #[tokio::test]
    async fn test_unreachable_node_is_a_failure_not_an_error() {
        let outcome = service()
            .delete("http://127.0.0.1:9", None, FileId::new())
            .await
            .unwrap();
        assert!(matches!(outcome, NodeOutcome::Failed(_)));
    }
}
