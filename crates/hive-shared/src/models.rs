//! Registry data model.
//!
//! Every struct serializes with camelCase field names; the same shapes are
//! persisted by `hive-store`, served by the registry API and consumed by the
//! client gateway.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ChannelId, FileId, MessageId, NodeId, UserId};

// ---------------------------------------------------------------------------
// Storage nodes
// ---------------------------------------------------------------------------

/// Live status reported by a node on every heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    pub is_healthy: bool,
    /// Load in the range 0.0 (idle) ..= 1.0 (saturated).
    pub current_load: f64,
    pub available_space: u64,
    pub used_space: u64,
    pub active_connections: u32,
    pub active_transfers: u32,
    /// Advertised network capacity in bytes per second.
    pub network_capacity: u64,
    pub last_updated: DateTime<Utc>,
}

impl NodeStatus {
    /// Status of a freshly registered, empty node.
    pub fn initial(total_storage: u64, now: DateTime<Utc>) -> Self {
        Self {
            is_healthy: true,
            current_load: 0.0,
            available_space: total_storage,
            used_space: 0,
            active_connections: 0,
            active_transfers: 0,
            network_capacity: 0,
            last_updated: now,
        }
    }
}

/// A storage node as known to the registry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StorageNode {
    pub id: NodeId,
    /// Base URL of the node's HTTP surface, e.g. `http://10.0.0.5:8080`.
    pub endpoint: String,
    pub hostname: String,
    pub region: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    pub total_storage: u64,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub last_seen: DateTime<Utc>,
    pub status: NodeStatus,
}

impl StorageNode {
    pub fn is_healthy(&self) -> bool {
        self.status.is_healthy
    }

    pub fn available_space(&self) -> u64 {
        self.status.available_space
    }
}

// ---------------------------------------------------------------------------
// Files
// ---------------------------------------------------------------------------

/// Registry record of a file and the nodes holding its bytes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    pub file_id: FileId,
    pub filename: String,
    pub content_type: String,
    pub size: u64,
    /// BLAKE3 hash of the content, hex encoded.
    pub checksum: String,
    /// Nodes believed to hold a copy. Healthy or not.
    #[serde(default)]
    pub node_ids: BTreeSet<NodeId>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub owner_id: UserId,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl FileRecord {
    pub fn is_on(&self, node_id: &NodeId) -> bool {
        self.node_ids.contains(node_id)
    }
}

/// BLAKE3 checksum of `data`, hex encoded.
pub fn content_checksum(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}

// ---------------------------------------------------------------------------
// Users
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Presence {
    Online,
    Offline,
}

impl Presence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Presence::Online => "Online",
            Presence::Offline => "Offline",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Online" => Some(Presence::Online),
            "Offline" => Some(Presence::Offline),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: UserId,
    pub display_name: Option<String>,
    pub presence: Presence,
    /// Node the user was last attached to, if any.
    pub node_id: Option<NodeId>,
    pub last_seen: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Channels & messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ChannelType {
    Public,
    Private,
    DirectMessage,
}

impl ChannelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelType::Public => "Public",
            ChannelType::Private => "Private",
            ChannelType::DirectMessage => "DirectMessage",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Public" => Some(ChannelType::Public),
            "Private" => Some(ChannelType::Private),
            "DirectMessage" => Some(ChannelType::DirectMessage),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    pub id: ChannelId,
    pub name: String,
    pub channel_type: ChannelType,
    #[serde(default)]
    pub member_ids: BTreeSet<UserId>,
    pub created_at: DateTime<Utc>,
}

impl Channel {
    pub fn has_member(&self, user_id: &UserId) -> bool {
        self.member_ids.contains(user_id)
    }
}

/// Reference to an uploaded file carried by a message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub file_id: FileId,
    pub filename: String,
    pub size: u64,
}

/// A chat message. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub channel_id: ChannelId,
    pub sender_id: UserId,
    pub content: String,
    pub sent_at: DateTime<Utc>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::utc_now_millis;

    #[test]
    fn test_storage_node_json_shape() {
        let now = utc_now_millis();
        let node = StorageNode {
            id: NodeId::from("node-1"),
            endpoint: "http://10.0.0.1:8080".into(),
            hostname: "storage-1".into(),
            region: "eu-west".into(),
            tags: BTreeSet::from(["ssd".to_string()]),
            total_storage: 1_000,
            metadata: BTreeMap::new(),
            last_seen: now,
            status: NodeStatus::initial(1_000, now),
        };

        let value = serde_json::to_value(&node).unwrap();
        assert_eq!(value["id"], "node-1");
        assert_eq!(value["status"]["isHealthy"], true);
        assert_eq!(value["status"]["availableSpace"], 1_000);

        let back: StorageNode = serde_json::from_value(value).unwrap();
        assert_eq!(back, node);
    }

    #[test]
    fn test_checksum_is_blake3_hex() {
        let sum = content_checksum(b"hello");
        assert_eq!(sum.len(), 64);
        assert_eq!(sum, blake3::hash(b"hello").to_hex().to_string());
    }

    #[test]
    fn test_enum_string_forms() {
        assert_eq!(Presence::parse(Presence::Online.as_str()), Some(Presence::Online));
        assert_eq!(
            ChannelType::parse(ChannelType::DirectMessage.as_str()),
            Some(ChannelType::DirectMessage)
        );
        assert_eq!(ChannelType::parse("Guild"), None);
    }
}
