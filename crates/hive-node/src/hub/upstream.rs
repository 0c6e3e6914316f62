use async_trait::async_trait;
use chrono::{DateTime, Utc};

use hive_shared::models::{Channel, Message, User};
use hive_shared::protocol::{MessageSyncAck, MessageSyncEvent, UserStatusUpdate};
use hive_shared::types::{ChannelId, MessageId, UserId};

use crate::error::NodeError;

/// What the hub needs from the registry.
#[async_trait]
pub trait HubUpstream: Send + Sync {
    async fn get_channel(&self, id: ChannelId) -> Result<Option<Channel>, NodeError>;

    async fn channels_for_user(&self, user_id: &UserId) -> Result<Vec<Channel>, NodeError>;

    /// The registry's presence record for a user, `None` if unknown.
    async fn get_user(&self, user_id: &UserId) -> Result<Option<User>, NodeError>;

    async fn set_user_status(
        &self,
        user_id: &UserId,
        update: &UserStatusUpdate,
    ) -> Result<(), NodeError>;

    async fn sync_message(&self, event: &MessageSyncEvent) -> Result<MessageSyncAck, NodeError>;

    /// Messages after the `(since, after)` keyset position, ordered by
    /// `(sent_at, id)`.
    async fn messages_since(
        &self,
        channel_id: ChannelId,
        since: DateTime<Utc>,
        after: Option<MessageId>,
        limit: u32,
    ) -> Result<Vec<Message>, NodeError>;
}
