use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::MAX_MESSAGE_SIZE;
use crate::error::HiveError;
use crate::models::{Attachment, Message, NodeStatus, Presence};
use crate::types::{ChannelId, FileId, NodeId, UserId};

// ---------------------------------------------------------------------------
// Registry API payloads
// ---------------------------------------------------------------------------

/// Why a client asks the registry for a different node.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReassignReason {
    NodeFailure,
    LoadBalancing,
    RegionPreference,
    Manual,
    AuthFailure,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReassignmentRequest {
    pub current_node_id: Option<NodeId>,
    pub reason: ReassignReason,
    pub preferred_region: Option<String>,
    #[serde(default)]
    pub required_file_access: Vec<FileId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReassignmentResponse {
    pub node_endpoint: String,
    pub node_id: NodeId,
    pub region: String,
    pub token: Option<String>,
    pub token_expires_at: Option<DateTime<Utc>>,
}

/// Filter for `POST /nodes/query`. Every supplied criterion must hold.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NodeQuery {
    pub region: Option<String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    pub min_available_storage: Option<u64>,
    #[serde(default)]
    pub healthy_only: bool,
}

/// Body of `POST /nodes/{id}/heartbeat`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
    pub status: NodeStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NodeIdList {
    pub node_ids: Vec<NodeId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LocationsUpdate {
    pub node_ids: BTreeSet<NodeId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationCheck {
    pub file_id: FileId,
    pub min_replication_factor: usize,
    pub healthy_locations: usize,
    pub satisfied: bool,
}

/// A locally created message forwarded to the registry by the node that
/// accepted it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MessageSyncEvent {
    pub message: Message,
    pub origin_node_id: NodeId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MessageSyncAck {
    /// `false` when the registry already held the message.
    pub inserted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserStatusUpdate {
    pub presence: Presence,
    pub node_id: Option<NodeId>,
}

/// Byte-level facts a storage node reports about a file it holds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StoredFileInfo {
    pub file_id: FileId,
    pub size: u64,
    pub checksum: String,
    pub stored_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Realtime hub frames
// ---------------------------------------------------------------------------

/// Operations a realtime client invokes on its hub.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "data", rename_all_fields = "camelCase")]
pub enum ClientRequest {
    JoinChannel {
        channel_id: ChannelId,
    },
    LeaveChannel {
        channel_id: ChannelId,
    },
    SendMessage {
        channel_id: ChannelId,
        content: String,
        #[serde(default)]
        attachments: Vec<Attachment>,
    },
    SendTypingNotification {
        channel_id: ChannelId,
        is_typing: bool,
    },
    UpdateStatus {
        presence: Presence,
    },
    /// Fill the gap created by moving to another node.
    SyncAfterNodeMigration {
        last_message_at: DateTime<Utc>,
    },
    SyncChannelMessages {
        channel_id: ChannelId,
        since: DateTime<Utc>,
    },
    /// The client is about to leave this node.
    NotifyRedirecting {
        new_node_id: Option<NodeId>,
        reason: ReassignReason,
    },
}

impl ClientRequest {
    /// Operation name used in `ConnectionError` reports.
    pub fn operation(&self) -> &'static str {
        match self {
            ClientRequest::JoinChannel { .. } => "JoinChannel",
            ClientRequest::LeaveChannel { .. } => "LeaveChannel",
            ClientRequest::SendMessage { .. } => "SendMessage",
            ClientRequest::SendTypingNotification { .. } => "SendTypingNotification",
            ClientRequest::UpdateStatus { .. } => "UpdateStatus",
            ClientRequest::SyncAfterNodeMigration { .. } => "SyncAfterNodeMigration",
            ClientRequest::SyncChannelMessages { .. } => "SyncChannelMessages",
            ClientRequest::NotifyRedirecting { .. } => "NotifyRedirecting",
        }
    }

    pub fn to_json(&self) -> Result<String, HiveError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self, HiveError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Events pushed from a hub to its connected clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "data", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    ReceiveMessage {
        message: Message,
    },
    UserStatusChanged {
        user_id: UserId,
        channel_id: ChannelId,
        presence: Presence,
    },
    UserTyping {
        user_id: UserId,
        channel_id: ChannelId,
        is_typing: bool,
    },
    StateSyncData {
        messages: Vec<Message>,
        server_time: DateTime<Utc>,
    },
    ReconnectionComplete {
        node_id: NodeId,
        channels: Vec<ChannelId>,
    },
    ConnectionError {
        operation: String,
        error: String,
    },
    RedirectAcknowledged {
        node_id: NodeId,
    },
}

impl ServerEvent {
    pub fn to_json(&self) -> Result<String, HiveError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self, HiveError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Reject empty or oversized chat content before it is persisted.
pub fn validate_message_content(content: &str) -> Result<(), HiveError> {
    if content.trim().is_empty() {
        return Err(HiveError::Validation("message content is empty".into()));
    }
    if content.len() > MAX_MESSAGE_SIZE {
        return Err(HiveError::Validation(format!(
            "message too large: {} bytes (max {})",
            content.len(),
            MAX_MESSAGE_SIZE
        )));
    }
    Ok(())
}
