use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use hive_shared::models::Message;
use hive_shared::types::{ChannelId, MessageId, NodeId, UserId};

use crate::columns::{json_column, millis, timestamp, to_json, uuid_column};
use crate::database::Database;
use crate::error::Result;

impl Database {
    /// Insert a message unless one with the same id is already stored.
    ///
    /// Returns `true` when the message was new.
    pub fn insert_message(&self, message: &Message) -> Result<bool> {
        self.insert_with_state(message, true)
    }

    /// Insert a locally created message that the registry has not yet
    /// acknowledged. It stays in [`Database::pending_messages`] until
    /// [`Database::mark_message_forwarded`] is called.
    pub fn insert_pending_message(&self, message: &Message) -> Result<bool> {
        self.insert_with_state(message, false)
    }

    fn insert_with_state(&self, message: &Message, forwarded: bool) -> Result<bool> {
        let inserted = self.conn().execute(
            "INSERT OR IGNORE INTO messages
                 (id, channel_id, sender_id, content, sent_at, attachments, forwarded)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                message.id.to_string(),
                message.channel_id.to_string(),
                message.sender_id.as_str(),
                message.content,
                millis(&message.sent_at),
                to_json(&message.attachments)?,
                forwarded,
            ],
        )?;
        Ok(inserted > 0)
    }

    pub fn mark_message_forwarded(&self, id: MessageId) -> Result<()> {
        self.conn().execute(
            "UPDATE messages SET forwarded = 1 WHERE id = ?1",
            params![id.to_string()],
        )?;
        Ok(())
    }

    /// Messages still waiting for a registry acknowledgement, oldest first.
    pub fn pending_messages(&self, limit: u32) -> Result<Vec<Message>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, channel_id, sender_id, content, sent_at, attachments
             FROM messages
             WHERE forwarded = 0
             ORDER BY sent_at ASC, id ASC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], row_to_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    pub fn has_message(&self, id: MessageId) -> Result<bool> {
        let found = self
            .conn()
            .query_row(
                "SELECT 1 FROM messages WHERE id = ?1",
                params![id.to_string()],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn get_message(&self, id: MessageId) -> Result<Option<Message>> {
        let message = self
            .conn()
            .query_row(
                "SELECT id, channel_id, sender_id, content, sent_at, attachments
                 FROM messages WHERE id = ?1",
                params![id.to_string()],
                row_to_message,
            )
            .optional()?;
        Ok(message)
    }

    /// Messages in `channel_id` after the `(since, after)` keyset position,
    /// ordered by `(sent_at, id)`, at most `limit` of them.
    ///
    /// With `after == None` every message at `since` is excluded; with an id,
    /// messages sharing the timestamp `since` but ordered after that id are
    /// included.
    pub fn messages_since(
        &self,
        channel_id: ChannelId,
        since: DateTime<Utc>,
        after: Option<MessageId>,
        limit: u32,
    ) -> Result<Vec<Message>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, channel_id, sender_id, content, sent_at, attachments
             FROM messages
             WHERE channel_id = ?1
               AND (sent_at > ?2 OR (?3 IS NOT NULL AND sent_at = ?2 AND id > ?3))
             ORDER BY sent_at ASC, id ASC
             LIMIT ?4",
        )?;

        let rows = stmt.query_map(
            params![
                channel_id.to_string(),
                millis(&since),
                after.map(|id| id.to_string()),
                limit
            ],
            row_to_message,
        )?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    /// Timestamp of the newest stored message in a channel.
    pub fn latest_message_at(&self, channel_id: ChannelId) -> Result<Option<DateTime<Utc>>> {
        let latest: Option<i64> = self.conn().query_row(
            "SELECT MAX(sent_at) FROM messages WHERE channel_id = ?1",
            params![channel_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(latest.map(timestamp))
    }

    /// Record which node originated or holds a message. Idempotent.
    pub fn record_message_location(&self, message_id: MessageId, node_id: &NodeId) -> Result<()> {
        self.conn().execute(
            "INSERT OR IGNORE INTO message_locations (message_id, node_id) VALUES (?1, ?2)",
            params![message_id.to_string(), node_id.as_str()],
        )?;
        Ok(())
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let id_str: String = row.get(0)?;
    let channel_str: String = row.get(1)?;
    let sender: String = row.get(2)?;
    let sent_at: i64 = row.get(4)?;
    let attachments_json: String = row.get(5)?;

    Ok(Message {
        id: MessageId(uuid_column(0, &id_str)?),
        channel_id: ChannelId(uuid_column(1, &channel_str)?),
        sender_id: UserId(sender),
        content: row.get(3)?,
        sent_at: timestamp(sent_at),
        attachments: json_column(5, &attachments_json)?,
    })
}
