//! HTTP client for the registry API, as used by a storage node.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::StatusCode;

use hive_shared::constants::{DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_HTTP_TIMEOUT_SECS};
use hive_shared::models::{Channel, Message, NodeStatus, StorageNode, User};
use hive_shared::protocol::{Heartbeat, MessageSyncAck, MessageSyncEvent, UserStatusUpdate};
use hive_shared::types::{ChannelId, MessageId, NodeId, UserId};

use crate::error::NodeError;
use crate::hub::upstream::HubUpstream;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    Accepted,
    /// The registry no longer knows this node; it must register again.
    UnknownNode,
}

#[derive(Clone)]
pub struct RegistryClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl RegistryClient {
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self, NodeError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS))
            .timeout(Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS))
            .build()
            .map_err(|e| NodeError::Internal(format!("http client: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    pub async fn register_node(&self, node: &StorageNode) -> Result<StorageNode, NodeError> {
        let resp = self.send(self.http.post(self.url("/nodes")).json(node)).await?;
        decode(resp).await
    }

    pub async fn heartbeat(
        &self,
        node_id: &NodeId,
        status: &NodeStatus,
    ) -> Result<HeartbeatOutcome, NodeError> {
        let body = Heartbeat {
            status: status.clone(),
        };
        let url = self.url(&format!("/nodes/{node_id}/heartbeat"));
        let resp = self.send(self.http.post(url).json(&body)).await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(HeartbeatOutcome::UnknownNode),
            s if s.is_success() => Ok(HeartbeatOutcome::Accepted),
            s => Err(NodeError::Registry(format!("heartbeat rejected: HTTP {s}"))),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<reqwest::Response, NodeError> {
        let req = match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        };
        req.send()
            .await
            .map_err(|e| NodeError::Registry(e.to_string()))
    }
}

async fn decode<T: serde::de::DeserializeOwned>(resp: reqwest::Response) -> Result<T, NodeError> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(NodeError::Registry(format!("HTTP {status}: {body}")));
    }
    resp.json()
        .await
        .map_err(|e| NodeError::Registry(format!("invalid response: {e}")))
}

#[async_trait]
impl HubUpstream for RegistryClient {
    async fn get_channel(&self, id: ChannelId) -> Result<Option<Channel>, NodeError> {
        let resp = self.send(self.http.get(self.url(&format!("/channels/{id}")))).await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        decode(resp).await.map(Some)
    }

    async fn channels_for_user(&self, user_id: &UserId) -> Result<Vec<Channel>, NodeError> {
        let resp = self
            .send(self.http.get(self.url(&format!("/users/{user_id}/channels"))))
            .await?;
        decode(resp).await
    }

    async fn get_user(&self, user_id: &UserId) -> Result<Option<User>, NodeError> {
        let resp = self.send(self.http.get(self.url(&format!("/users/{user_id}")))).await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        decode(resp).await.map(Some)
    }

    async fn set_user_status(
        &self,
        user_id: &UserId,
        update: &UserStatusUpdate,
    ) -> Result<(), NodeError> {
        let url = self.url(&format!("/users/{user_id}/status"));
        let resp = self.send(self.http.put(url).json(update)).await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(NodeError::Registry(format!("status update rejected: HTTP {status}")));
        }
        Ok(())
    }

    async fn sync_message(&self, event: &MessageSyncEvent) -> Result<MessageSyncAck, NodeError> {
        let resp = self
            .send(self.http.post(self.url("/messages/sync")).json(event))
            .await?;
        let status = resp.status();
        // a rejected message will be rejected again; only auth may recover
        if status.is_client_error() && status != StatusCode::UNAUTHORIZED {
            let body = resp.text().await.unwrap_or_default();
            return Err(NodeError::BadRequest(format!(
                "registry rejected message: HTTP {status}: {body}"
            )));
        }
        decode(resp).await
    }

    async fn messages_since(
        &self,
        channel_id: ChannelId,
        since: DateTime<Utc>,
        after: Option<MessageId>,
        limit: u32,
    ) -> Result<Vec<Message>, NodeError> {
        let url = self.url(&format!("/channels/{channel_id}/messages"));
        let mut query = vec![
            ("since", since.to_rfc3339_opts(SecondsFormat::Millis, true)),
            ("limit", limit.to_string()),
        ];
        if let Some(id) = after {
            query.push(("afterId", id.to_string()));
        }
        let resp = self.send(self.http.get(url).query(&query)).await?;
        decode(resp).await
    }
}
