//! Channels, memberships, presence and the message log nodes sync against.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use hive_shared::constants::SYNC_PAGE_SIZE;
use hive_shared::models::{Channel, ChannelType, Message, User};
use hive_shared::protocol::{validate_message_content, MessageSyncAck, MessageSyncEvent, UserStatusUpdate};
use hive_shared::types::{utc_now_millis, ChannelId, MessageId, UserId};

use crate::db::SharedDb;
use crate::error::RegistryError;

/// Body of `POST /channels`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewChannel {
    /// Caller-chosen id; a fresh one is generated when absent.
    pub id: Option<ChannelId>,
    pub name: String,
    pub channel_type: ChannelType,
    #[serde(default)]
    pub member_ids: BTreeSet<UserId>,
}

#[derive(Clone)]
pub struct ChatRegistry {
    db: SharedDb,
}

impl ChatRegistry {
    pub fn new(db: SharedDb) -> Self {
        Self { db }
    }

    pub fn create_channel(&self, new: NewChannel) -> Result<Channel, RegistryError> {
        if new.name.trim().is_empty() {
            return Err(RegistryError::BadRequest("channel name must not be empty".into()));
        }
        if new.channel_type == ChannelType::DirectMessage && new.member_ids.len() != 2 {
            return Err(RegistryError::BadRequest(
                "a direct message channel has exactly two members".into(),
            ));
        }

        let channel = Channel {
            id: new.id.unwrap_or_default(),
            name: new.name,
            channel_type: new.channel_type,
            member_ids: new.member_ids,
            created_at: utc_now_millis(),
        };
        self.db.with(|db| db.upsert_channel(&channel))?;
        info!(
            channel_id = %channel.id,
            name = %channel.name,
            members = channel.member_ids.len(),
            "Channel created"
        );
        Ok(channel)
    }

    pub fn get_channel(&self, id: ChannelId) -> Result<Option<Channel>, RegistryError> {
        self.db.with(|db| db.get_channel(id))
    }

    /// Messages after the `(since, after)` keyset position, ordered by
    /// `(sent_at, id)`, at most one sync page.
    pub fn messages_since(
        &self,
        channel_id: ChannelId,
        since: DateTime<Utc>,
        after: Option<MessageId>,
        limit: Option<u32>,
    ) -> Result<Vec<Message>, RegistryError> {
        let limit = limit.unwrap_or(SYNC_PAGE_SIZE).clamp(1, SYNC_PAGE_SIZE);
        self.db.with(|db| db.messages_since(channel_id, since, after, limit))
    }

    /// Accept a message forwarded by the node that created it. Replays of an
    /// already stored message are acknowledged without effect.
    pub fn sync_message(&self, event: MessageSyncEvent) -> Result<MessageSyncAck, RegistryError> {
        validate_message_content(&event.message.content)
            .map_err(|e| RegistryError::BadRequest(e.to_string()))?;

        let channel_id = event.message.channel_id;
        if self.get_channel(channel_id)?.is_none() {
            return Err(RegistryError::ChannelNotFound(channel_id));
        }

        let inserted = self.db.with(|db| {
            let inserted = db.insert_message(&event.message)?;
            db.record_message_location(event.message.id, &event.origin_node_id)?;
            db.record_channel_node(channel_id, &event.origin_node_id)?;
            Ok(inserted)
        })?;

        debug!(
            message_id = %event.message.id,
            channel_id = %channel_id,
            origin = %event.origin_node_id,
            inserted,
            "Message synced"
        );
        Ok(MessageSyncAck { inserted })
    }

    pub fn set_user_status(
        &self,
        user_id: &UserId,
        update: &UserStatusUpdate,
    ) -> Result<(), RegistryError> {
        self.db.with(|db| {
            db.set_user_presence(
                user_id,
                update.presence,
                update.node_id.as_ref(),
                utc_now_millis(),
            )
        })?;
        debug!(user_id = %user_id, presence = ?update.presence, "User status updated");
        Ok(())
    }

    pub fn get_user(&self, user_id: &UserId) -> Result<Option<User>, RegistryError> {
        self.db.with(|db| db.get_user(user_id))
    }

    pub fn channels_for_user(&self, user_id: &UserId) -> Result<Vec<Channel>, RegistryError> {
        self.db.with(|db| db.channels_for_user(user_id))
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use hive_shared::models::Presence;
    use hive_shared::types::{MessageId, NodeId};

    use super::*;

    fn chat() -> (SharedDb, ChatRegistry) {
        let db = SharedDb::in_memory().unwrap();
        (db.clone(), ChatRegistry::new(db))
    }

    fn general(chat: &ChatRegistry) -> Channel {
        chat.create_channel(NewChannel {
            id: None,
            name: "general".into(),
            channel_type: ChannelType::Public,
            member_ids: [UserId::from("alice"), UserId::from("bob")].into(),
        })
        .unwrap()
    }

    fn event(channel_id: ChannelId, sent_at: DateTime<Utc>) -> MessageSyncEvent {
        MessageSyncEvent {
            message: Message {
                id: MessageId::new(),
                channel_id,
                sender_id: UserId::from("alice"),
                content: "hi".into(),
                sent_at,
                attachments: Vec::new(),
            },
            origin_node_id: NodeId::from("n1"),
        }
    }

    #[test]
    fn test_sync_is_idempotent_and_records_locations() {
        let (db, chat) = chat();
        let ch = general(&chat);
        let ev = event(ch.id, utc_now_millis());

        assert!(chat.sync_message(ev.clone()).unwrap().inserted);
        assert!(!chat.sync_message(ev.clone()).unwrap().inserted);

        let nodes = db.with(|db| db.channel_nodes(ch.id)).unwrap();
        assert!(nodes.contains(&NodeId::from("n1")));
    }

    #[test]
    fn test_sync_to_unknown_channel_is_rejected() {
        let (_, chat) = chat();
        let err = chat
            .sync_message(event(ChannelId::new(), utc_now_millis()))
            .unwrap_err();
        assert!(matches!(err, RegistryError::ChannelNotFound(_)));
    }

    #[test]
    fn test_sync_rejects_empty_content() {
        let (_, chat) = chat();
        let ch = general(&chat);
        let mut ev = event(ch.id, utc_now_millis());
        ev.message.content = "   ".into();
        assert!(matches!(
            chat.sync_message(ev),
            Err(RegistryError::BadRequest(_))
        ));
    }

    #[test]
    fn test_messages_since_returns_only_newer() {
        let (_, chat) = chat();
        let ch = general(&chat);
        let base = utc_now_millis();
        for i in 0..3 {
            chat.sync_message(event(ch.id, base + Duration::seconds(i)))
                .unwrap();
        }

        let newer = chat.messages_since(ch.id, base, None, None).unwrap();
        assert_eq!(newer.len(), 2);
        assert!(newer.iter().all(|m| m.sent_at > base));

        let one = chat.messages_since(ch.id, base - Duration::seconds(1), None, Some(1)).unwrap();
        assert_eq!(one.len(), 1);
    }

    #[test]
    fn test_direct_message_needs_two_members() {
        let (_, chat) = chat();
        let err = chat
            .create_channel(NewChannel {
                id: None,
                name: "dm".into(),
                channel_type: ChannelType::DirectMessage,
                member_ids: [UserId::from("alice")].into(),
            })
            .unwrap_err();
        assert!(matches!(err, RegistryError::BadRequest(_)));
    }

    #[test]
    fn test_status_and_membership_queries() {
        let (_, chat) = chat();
        let ch = general(&chat);
        let alice = UserId::from("alice");

        chat.set_user_status(
            &alice,
            &UserStatusUpdate {
                presence: Presence::Online,
                node_id: Some(NodeId::from("n1")),
            },
        )
        .unwrap();
        let user = chat.get_user(&alice).unwrap().unwrap();
        assert_eq!(user.presence, Presence::Online);
        assert_eq!(user.node_id, Some(NodeId::from("n1")));
        assert!(chat.get_user(&UserId::from("carol")).unwrap().is_none());

        let channels = chat.channels_for_user(&alice).unwrap();
        assert_eq!(channels.len(), 1);
        assert_eq!(channels[0].id, ch.id);
        assert!(chat.channels_for_user(&UserId::from("carol")).unwrap().is_empty());
    }

    #[test]
    fn test_messages_since_resumes_inside_a_timestamp() {
        let (_, chat) = chat();
        let ch = general(&chat);
        let at = utc_now_millis();
        for _ in 0..3 {
            chat.sync_message(event(ch.id, at)).unwrap();
        }

        let first = chat.messages_since(ch.id, at - Duration::seconds(1), None, Some(2)).unwrap();
        assert_eq!(first.len(), 2);
        let rest = chat
            .messages_since(ch.id, at, Some(first[1].id), None)
            .unwrap();
        assert_eq!(rest.len(), 1);
        assert!(first.iter().all(|m| m.id != rest[0].id));
    }
}
