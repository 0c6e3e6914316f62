//! Websocket transport to a node's hub.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;

use hive_shared::protocol::{ClientRequest, ServerEvent};
use hive_shared::types::UserId;

use crate::error::ClientError;

/// One open connection to a hub.
#[async_trait]
pub trait HubLink: Send {
    async fn send(&mut self, request: &ClientRequest) -> Result<(), ClientError>;

    /// Next event from the hub; `None` once the connection is gone.
    async fn next_event(&mut self) -> Option<Result<ServerEvent, ClientError>>;

    async fn close(&mut self);
}

#[async_trait]
pub trait HubConnector: Send + Sync {
    async fn connect(
        &self,
        endpoint: &str,
        token: Option<&str>,
        user_id: &UserId,
        failover: bool,
    ) -> Result<Box<dyn HubLink>, ClientError>;
}

/// Plain `ws://` connector; an `https` endpoint maps to `wss://`.
#[derive(Debug, Default, Clone)]
pub struct WsConnector;

/// `http://host:port` -> `ws://host:port/hub?userId=..&failover=..`
pub fn hub_url(endpoint: &str, user_id: &UserId, failover: bool) -> Result<String, ClientError> {
    let mut url = reqwest::Url::parse(&format!("{}/hub", endpoint.trim_end_matches('/')))
        .map_err(|e| ClientError::Validation(format!("bad node endpoint {endpoint}: {e}")))?;
    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        _ => "ws",
    };
    url.set_scheme(scheme)
        .map_err(|_| ClientError::Validation(format!("cannot use {endpoint} as a hub endpoint")))?;
    url.query_pairs_mut()
        .append_pair("userId", user_id.as_str())
        .append_pair("failover", if failover { "true" } else { "false" });
    Ok(url.to_string())
}

#[async_trait]
impl HubConnector for WsConnector {
    async fn connect(
        &self,
        endpoint: &str,
        token: Option<&str>,
        user_id: &UserId,
        failover: bool,
    ) -> Result<Box<dyn HubLink>, ClientError> {
        let url = hub_url(endpoint, user_id, failover)?;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| ClientError::Realtime(e.to_string()))?;
        if let Some(token) = token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| ClientError::Validation(format!("token is not a valid header: {e}")))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (stream, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| ClientError::Realtime(format!("connect to {endpoint}: {e}")))?;
        debug!(endpoint, failover, "Hub connection open");
        Ok(Box::new(WsLink { stream }))
    }
}

struct WsLink {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl HubLink for WsLink {
    async fn send(&mut self, request: &ClientRequest) -> Result<(), ClientError> {
        let text = request
            .to_json()
            .map_err(|e| ClientError::Validation(e.to_string()))?;
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|e| ClientError::Realtime(e.to_string()))
    }

    async fn next_event(&mut self) -> Option<Result<ServerEvent, ClientError>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => {
                    return Some(
                        ServerEvent::from_json(&text)
                            .map_err(|e| ClientError::Realtime(format!("bad hub frame: {e}"))),
                    )
                }
                Ok(Message::Close(_)) => return None,
                Ok(_) => continue,
                Err(e) => return Some(Err(ClientError::Realtime(e.to_string()))),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            debug!(error = %e, "Hub connection did not close cleanly");
        }
    }
}
