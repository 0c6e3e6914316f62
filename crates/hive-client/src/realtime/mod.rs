//! Realtime chat session that follows the gateway across nodes.
//!
//! A [`RealtimeSession`] owns the websocket to the current node's hub. When
//! the gateway is reassigned, or the link dies, the session tells the old
//! hub it is leaving, reconnects to the new node as a failover reconnection
//! and asks it for whatever was missed since the last message seen.

mod link;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use hive_shared::models::Presence;
use hive_shared::protocol::{ClientRequest, ReassignReason, ServerEvent};
use hive_shared::types::{utc_now_millis, ChannelId, NodeId};

use crate::error::ClientError;
use crate::events::GatewayEvent;
use crate::gateway::{CurrentNode, FailoverGateway};

pub use link::{hub_url, HubConnector, HubLink, WsConnector};

const CHANNEL_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    FailoverReconnecting,
}

/// Application side of a session: issue hub operations, watch state.
#[derive(Clone)]
pub struct SessionHandle {
    requests: mpsc::Sender<ClientRequest>,
    state: watch::Receiver<SessionState>,
}

impl SessionHandle {
    pub async fn request(&self, request: ClientRequest) -> Result<(), ClientError> {
        self.requests
            .send(request)
            .await
            .map_err(|_| ClientError::Realtime("session has stopped".to_string()))
    }

    pub async fn join_channel(&self, channel_id: ChannelId) -> Result<(), ClientError> {
        self.request(ClientRequest::JoinChannel { channel_id }).await
    }

    pub async fn leave_channel(&self, channel_id: ChannelId) -> Result<(), ClientError> {
        self.request(ClientRequest::LeaveChannel { channel_id }).await
    }

    pub async fn send_message(
        &self,
        channel_id: ChannelId,
        content: impl Into<String>,
    ) -> Result<(), ClientError> {
        self.request(ClientRequest::SendMessage {
            channel_id,
            content: content.into(),
            attachments: Vec::new(),
        })
        .await
    }

    pub async fn set_typing(&self, channel_id: ChannelId, is_typing: bool) -> Result<(), ClientError> {
        self.request(ClientRequest::SendTypingNotification {
            channel_id,
            is_typing,
        })
        .await
    }

    pub async fn update_status(&self, presence: Presence) -> Result<(), ClientError> {
        self.request(ClientRequest::UpdateStatus { presence }).await
    }

    pub async fn sync_channel(
        &self,
        channel_id: ChannelId,
        since: DateTime<Utc>,
    ) -> Result<(), ClientError> {
        self.request(ClientRequest::SyncChannelMessages { channel_id, since })
            .await
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }
}

enum Step {
    Shutdown,
    Gateway(Result<GatewayEvent, broadcast::error::RecvError>),
    Request(Option<ClientRequest>),
    Link(Option<Result<ServerEvent, ClientError>>),
}

pub struct RealtimeSession {
    gateway: Arc<FailoverGateway>,
    connector: Arc<dyn HubConnector>,
    gateway_events: broadcast::Receiver<GatewayEvent>,
    requests: mpsc::Receiver<ClientRequest>,
    inbound: mpsc::Sender<ServerEvent>,
    state: watch::Sender<SessionState>,
    link: Option<Box<dyn HubLink>>,
    node: Option<CurrentNode>,
    connected_at: DateTime<Utc>,
    last_message_at: Option<DateTime<Utc>>,
}

impl RealtimeSession {
    /// Returns the session (drive it with [`RealtimeSession::run`]), a
    /// handle for issuing operations and the stream of hub events.
    pub fn new(
        gateway: Arc<FailoverGateway>,
        connector: Arc<dyn HubConnector>,
    ) -> (Self, SessionHandle, mpsc::Receiver<ServerEvent>) {
        let (request_tx, request_rx) = mpsc::channel(CHANNEL_BUFFER);
        let (inbound_tx, inbound_rx) = mpsc::channel(CHANNEL_BUFFER);
        let (state_tx, state_rx) = watch::channel(SessionState::Disconnected);

        let session = Self {
            gateway_events: gateway.subscribe(),
            gateway,
            connector,
            requests: request_rx,
            inbound: inbound_tx,
            state: state_tx,
            link: None,
            node: None,
            connected_at: utc_now_millis(),
            last_message_at: None,
        };
        let handle = SessionHandle {
            requests: request_tx,
            state: state_rx,
        };
        (session, handle, inbound_rx)
    }

    /// Drive the session until `shutdown` fires or every handle is dropped.
    /// Fails only when the node cannot be reached and reassignment keeps
    /// failing past the gateway's retry budget.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<(), ClientError> {
        self.set_state(SessionState::Connecting);
        let first = self.gateway.ensure_current().await?;
        if let Err(e) = self.attach(&first, false).await {
            warn!(node_id = %first.id, error = %e, "Initial hub connection failed");
            self.reattach(None, &shutdown).await?;
        }

        loop {
            let step = tokio::select! {
                biased;
                _ = shutdown.cancelled() => Step::Shutdown,
                event = self.gateway_events.recv() => Step::Gateway(event),
                request = self.requests.recv() => Step::Request(request),
                event = next_event(self.link.as_mut()) => Step::Link(event),
            };

            match step {
                Step::Shutdown | Step::Request(None) => break,
                Step::Gateway(Ok(GatewayEvent::Reassigned {
                    node_id,
                    endpoint,
                    reason,
                    ..
                })) => {
                    if self.is_attached_to(&node_id) {
                        continue;
                    }
                    if let Err(e) = self.migrate(node_id, endpoint, reason).await {
                        warn!(error = %e, "Could not follow reassignment");
                        self.reattach(None, &shutdown).await?;
                    }
                }
                Step::Gateway(Ok(GatewayEvent::NodeFailed { .. })) => {}
                Step::Gateway(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                    debug!(skipped, "Missed gateway events, checking current node");
                    if let Some(current) = self.gateway.current_node() {
                        if !self.is_attached_to(&current.id) {
                            self.reattach(
                                Some((current.id, current.endpoint, ReassignReason::Manual)),
                                &shutdown,
                            )
                            .await?;
                        }
                    }
                }
                Step::Gateway(Err(broadcast::error::RecvError::Closed)) => break,
                Step::Request(Some(request)) => self.forward(request, &shutdown).await?,
                Step::Link(Some(Ok(event))) => self.deliver(event).await,
                Step::Link(Some(Err(e))) => {
                    warn!(error = %e, "Hub connection failed");
                    self.reattach(None, &shutdown).await?;
                }
                Step::Link(None) => {
                    warn!("Hub connection closed");
                    self.reattach(None, &shutdown).await?;
                }
            }
        }

        if let Some(mut link) = self.link.take() {
            link.close().await;
        }
        self.set_state(SessionState::Disconnected);
        info!("Realtime session stopped");
        Ok(())
    }

    fn set_state(&self, state: SessionState) {
        self.state.send_replace(state);
    }

    fn is_attached_to(&self, node_id: &NodeId) -> bool {
        self.link.is_some() && self.node.as_ref().is_some_and(|n| &n.id == node_id)
    }

    async fn attach(&mut self, node: &CurrentNode, failover: bool) -> Result<(), ClientError> {
        let token = self.gateway.token();
        let user_id = &self.gateway.config().user_id;
        let link = self
            .connector
            .connect(&node.endpoint, token.as_deref(), user_id, failover)
            .await?;
        self.link = Some(link);
        self.node = Some(node.clone());
        self.set_state(SessionState::Connected);
        info!(node_id = %node.id, failover, "Connected to hub");
        Ok(())
    }

    /// Leave the current hub and reattach to `node_id`, then ask for the gap.
    async fn migrate(
        &mut self,
        node_id: NodeId,
        endpoint: String,
        reason: ReassignReason,
    ) -> Result<(), ClientError> {
        self.set_state(SessionState::FailoverReconnecting);

        if let Some(mut old) = self.link.take() {
            let notice = ClientRequest::NotifyRedirecting {
                new_node_id: Some(node_id.clone()),
                reason,
            };
            // the old node may already be gone
            if let Err(e) = old.send(&notice).await {
                debug!(error = %e, "Could not notify old hub");
            }
            old.close().await;
        }

        let region = self
            .gateway
            .current_node()
            .filter(|c| c.id == node_id)
            .map(|c| c.region)
            .unwrap_or_default();
        let target = CurrentNode {
            id: node_id,
            endpoint,
            region,
        };
        self.attach(&target, true).await?;

        let since = self.last_message_at.unwrap_or(self.connected_at);
        if let Some(link) = self.link.as_mut() {
            link.send(&ClientRequest::SyncAfterNodeMigration {
                last_message_at: since,
            })
            .await?;
        }
        info!(node_id = %target.id, ?reason, %since, "Migrated hub connection");
        Ok(())
    }

    /// Get back onto some hub: follow `target` if given, otherwise ask the
    /// gateway for a replacement node. Bounded by the retry budget.
    async fn reattach(
        &mut self,
        mut target: Option<(NodeId, String, ReassignReason)>,
        shutdown: &CancellationToken,
    ) -> Result<(), ClientError> {
        self.set_state(SessionState::FailoverReconnecting);
        let budget = self.gateway.config().retry_budget;
        let mut last = String::new();

        for attempt in 1..=budget {
            let next = match target.take() {
                Some(next) => Ok(next),
                None => self
                    .gateway
                    .reassign(ReassignReason::NodeFailure, Vec::new())
                    .await
                    .map(|n| (n.id, n.endpoint, ReassignReason::NodeFailure)),
            };
            let result = match next {
                Ok((node_id, endpoint, reason)) => self.migrate(node_id, endpoint, reason).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(attempt, error = %e, "Hub reattach failed");
                    last = e.to_string();
                }
            }

            if attempt < budget {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => return Err(ClientError::Cancelled),
                    _ = tokio::time::sleep(self.gateway.config().backoff(attempt)) => {}
                }
            }
        }

        self.set_state(SessionState::Disconnected);
        Err(ClientError::RetriesExhausted {
            attempts: budget,
            last,
        })
    }

    async fn forward(
        &mut self,
        request: ClientRequest,
        shutdown: &CancellationToken,
    ) -> Result<(), ClientError> {
        let operation = request.operation();
        let sent = match self.link.as_mut() {
            Some(link) => link.send(&request).await,
            None => Err(ClientError::Realtime("not connected".to_string())),
        };
        if let Err(e) = sent {
            warn!(operation, error = %e, "Could not send to hub");
            self.deliver(ServerEvent::ConnectionError {
                operation: operation.to_string(),
                error: e.to_string(),
            })
            .await;
            self.reattach(None, shutdown).await?;
        }
        Ok(())
    }

    async fn deliver(&mut self, event: ServerEvent) {
        let newest = match &event {
            ServerEvent::ReceiveMessage { message } => Some(message.sent_at),
            ServerEvent::StateSyncData { messages, .. } => messages.iter().map(|m| m.sent_at).max(),
            _ => None,
        };
        if let Some(at) = newest {
            if self.last_message_at.map_or(true, |seen| at > seen) {
                self.last_message_at = Some(at);
            }
        }

        if self.inbound.send(event).await.is_err() {
            debug!("Hub event dropped (no receiver)");
        }
    }
}

async fn next_event(link: Option<&mut Box<dyn HubLink>>) -> Option<Result<ServerEvent, ClientError>> {
    match link {
        Some(link) => link.next_event().await,
        None => std::future::pending().await,
    }
}
