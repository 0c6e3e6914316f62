use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;

use hive_shared::constants::DEFAULT_CONNECT_TIMEOUT_SECS;
use hive_shared::models::{FileRecord, StorageNode};
use hive_shared::protocol::{NodeIdList, ReassignmentRequest, ReassignmentResponse};
use hive_shared::types::{FileId, NodeId};

use crate::config::GatewayConfig;
use crate::error::ClientError;

#[async_trait]
pub trait RegistryService: Send + Sync {
    /// Healthy nodes only.
    async fn active_nodes(&self) -> Result<Vec<StorageNode>, ClientError>;

    async fn nodes_by_ids(&self, ids: &[NodeId]) -> Result<Vec<StorageNode>, ClientError>;

    async fn register_file(&self, record: &FileRecord) -> Result<FileRecord, ClientError>;

    async fn get_file(&self, id: FileId) -> Result<Option<FileRecord>, ClientError>;

    async fn add_file_location(
        &self,
        id: FileId,
        node_id: &NodeId,
    ) -> Result<FileRecord, ClientError>;

    /// Returns `false` if the registry did not know the file.
    async fn delete_file(&self, id: FileId) -> Result<bool, ClientError>;

    async fn list_files(
        &self,
        name_pattern: Option<&str>,
        tags: &[String],
    ) -> Result<Vec<FileRecord>, ClientError>;

    async fn reassign(
        &self,
        request: &ReassignmentRequest,
    ) -> Result<ReassignmentResponse, ClientError>;
}

#[derive(Deserialize)]
struct DeletedResponse {
    deleted: bool,
}

pub struct HttpRegistryService {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpRegistryService {
    pub fn new(config: &GatewayConfig) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS))
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ClientError::Registry(format!("http client: {e}")))?;
        Ok(Self {
            http,
            base_url: config.registry_url.clone(),
            token: config.registry_token.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<reqwest::Response, ClientError> {
        let req = match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        };
        req.send()
            .await
            .map_err(|e| ClientError::Registry(e.to_string()))
    }
}

async fn decode<T: serde::de::DeserializeOwned>(resp: reqwest::Response) -> Result<T, ClientError> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(ClientError::from_registry_status(status.as_u16(), &body));
    }
    resp.json()
        .await
        .map_err(|e| ClientError::Registry(format!("invalid response: {e}")))
}

#[async_trait]
impl RegistryService for HttpRegistryService {
    async fn active_nodes(&self) -> Result<Vec<StorageNode>, ClientError> {
        decode(self.send(self.http.get(self.url("/nodes"))).await?).await
    }

    async fn nodes_by_ids(&self, ids: &[NodeId]) -> Result<Vec<StorageNode>, ClientError> {
        let body = NodeIdList {
            node_ids: ids.to_vec(),
        };
        let resp = self
            .send(self.http.post(self.url("/nodes/by-ids")).json(&body))
            .await?;
        decode(resp).await
    }

    async fn register_file(&self, record: &FileRecord) -> Result<FileRecord, ClientError> {
        let resp = self
            .send(self.http.post(self.url("/files")).json(record))
            .await?;
        decode(resp).await
    }

    async fn get_file(&self, id: FileId) -> Result<Option<FileRecord>, ClientError> {
        let resp = self
            .send(self.http.get(self.url(&format!("/files/{id}"))))
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        decode(resp).await.map(Some)
    }

    async fn add_file_location(
        &self,
        id: FileId,
        node_id: &NodeId,
    ) -> Result<FileRecord, ClientError> {
        let url = self.url(&format!("/files/{id}/locations/{node_id}"));
        let resp = self.send(self.http.post(url)).await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(ClientError::FileNotFound(id));
        }
        decode(resp).await
    }

    async fn delete_file(&self, id: FileId) -> Result<bool, ClientError> {
        let resp = self
            .send(self.http.delete(self.url(&format!("/files/{id}"))))
            .await?;
        let deleted: DeletedResponse = decode(resp).await?;
        Ok(deleted.deleted)
    }

    async fn list_files(
        &self,
        name_pattern: Option<&str>,
        tags: &[String],
    ) -> Result<Vec<FileRecord>, ClientError> {
        let mut query: Vec<(&str, String)> = Vec::new();
        if let Some(pattern) = name_pattern {
            query.push(("name", pattern.to_string()));
        }
        if !tags.is_empty() {
            query.push(("tags", tags.join(",")));
        }
        let resp = self
            .send(self.http.get(self.url("/files")).query(&query))
            .await?;
        decode(resp).await
    }

    async fn reassign(
        &self,
        request: &ReassignmentRequest,
    ) -> Result<ReassignmentResponse, ClientError> {
        let resp = self
            .send(self.http.post(self.url("/gateway/reassign")).json(request))
            .await?;
        decode(resp).await
    }
}

#[cfg(test)]
mod tests {
    use axum::extract::Query;
    use axum::http::StatusCode as AxumStatus;
    use axum::routing::get;
    use axum::{Json, Router};

    use super::*;

    async fn spawn(app: Router) -> GatewayConfig {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        GatewayConfig::new(format!("http://{addr}"), "alice")
    }

    #[tokio::test]
    async fn test_missing_file_is_none() {
        let app = Router::new().route("/files/:id", get(|| async { AxumStatus::NOT_FOUND }));
        let registry = HttpRegistryService::new(&spawn(app).await).unwrap();
        assert!(registry.get_file(FileId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_files_sends_filters() {
        #[derive(serde::Deserialize)]
        struct Params {
            name: Option<String>,
            tags: Option<String>,
        }

        let app = Router::new().route(
            "/files",
            get(|Query(p): Query<Params>| async move {
                assert_eq!(p.name.as_deref(), Some("*.png"));
                assert_eq!(p.tags.as_deref(), Some("a,b"));
                Json(Vec::<FileRecord>::new())
            }),
        );
        let registry = HttpRegistryService::new(&spawn(app).await).unwrap();
        let files = registry
            .list_files(Some("*.png"), &["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert!(files.is_empty());
    }

    #[tokio::test]
    async fn test_unauthorized_maps_to_auth_failure() {
        let app = Router::new().route("/nodes", get(|| async { AxumStatus::UNAUTHORIZED }));
        let registry = HttpRegistryService::new(&spawn(app).await).unwrap();
        let err = registry.active_nodes().await.unwrap_err();
        assert!(matches!(err, ClientError::AuthFailure(_)));
    }
}
