//! CRUD operations for [`Channel`] records, memberships and the nodes that
//! serve each channel.

use std::collections::BTreeSet;

use rusqlite::{params, OptionalExtension};

use hive_shared::models::{Channel, ChannelType};
use hive_shared::types::{ChannelId, NodeId, UserId};

use crate::columns::{enum_column, millis, timestamp, uuid_column};
use crate::database::Database;
use crate::error::Result;

impl Database {
    // ------------------------------------------------------------------
    // Write
    // ------------------------------------------------------------------

    /// Create or overwrite a channel together with its member set.
    pub fn upsert_channel(&self, channel: &Channel) -> Result<()> {
        let tx = self.conn().unchecked_transaction()?;

        tx.execute(
            "INSERT INTO channels (id, name, channel_type, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                channel_type = excluded.channel_type,
                created_at = excluded.created_at",
            params![
                channel.id.to_string(),
                channel.name,
                channel.channel_type.as_str(),
                millis(&channel.created_at),
            ],
        )?;

        tx.execute(
            "DELETE FROM user_channels WHERE channel_id = ?1",
            params![channel.id.to_string()],
        )?;
        for member in &channel.member_ids {
            tx.execute(
                "INSERT INTO user_channels (user_id, channel_id) VALUES (?1, ?2)",
                params![member.as_str(), channel.id.to_string()],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    /// Returns `false` if the channel does not exist.
    pub fn add_channel_member(&self, channel_id: ChannelId, user_id: &UserId) -> Result<bool> {
        if self.get_channel_row(channel_id)?.is_none() {
            return Ok(false);
        }
        self.conn().execute(
            "INSERT OR IGNORE INTO user_channels (user_id, channel_id) VALUES (?1, ?2)",
            params![user_id.as_str(), channel_id.to_string()],
        )?;
        Ok(true)
    }

    pub fn remove_channel_member(&self, channel_id: ChannelId, user_id: &UserId) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM user_channels WHERE user_id = ?1 AND channel_id = ?2",
            params![user_id.as_str(), channel_id.to_string()],
        )?;
        Ok(affected > 0)
    }

    /// Record that `node_id` serves `channel_id`. Idempotent.
    pub fn record_channel_node(&self, channel_id: ChannelId, node_id: &NodeId) -> Result<()> {
        self.conn().execute(
            "INSERT OR IGNORE INTO channel_nodes (channel_id, node_id) VALUES (?1, ?2)",
            params![channel_id.to_string(), node_id.as_str()],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    pub fn get_channel(&self, id: ChannelId) -> Result<Option<Channel>> {
        match self.get_channel_row(id)? {
            Some(mut channel) => {
                channel.member_ids = self.channel_members(id)?;
                Ok(Some(channel))
            }
            None => Ok(None),
        }
    }

    /// Channels `user_id` is a member of, ordered by name.
    pub fn channels_for_user(&self, user_id: &UserId) -> Result<Vec<Channel>> {
        let mut stmt = self.conn().prepare(
            "SELECT c.id, c.name, c.channel_type, c.created_at
             FROM channels c
             JOIN user_channels uc ON uc.channel_id = c.id
             WHERE uc.user_id = ?1
             ORDER BY c.name ASC, c.id ASC",
        )?;
        let rows = stmt.query_map(params![user_id.as_str()], row_to_channel)?;

        let mut channels = Vec::new();
        for row in rows {
            channels.push(row?);
        }
        for channel in &mut channels {
            channel.member_ids = self.channel_members(channel.id)?;
        }
        Ok(channels)
    }

    /// Ids of every channel held in this database.
    pub fn list_channel_ids(&self) -> Result<Vec<ChannelId>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT id FROM channels ORDER BY id ASC")?;
        let rows = stmt.query_map([], |row| {
            let id: String = row.get(0)?;
            uuid_column(0, &id).map(ChannelId)
        })?;

        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }

    pub fn channel_nodes(&self, channel_id: ChannelId) -> Result<BTreeSet<NodeId>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT node_id FROM channel_nodes WHERE channel_id = ?1")?;
        let rows = stmt.query_map(params![channel_id.to_string()], |row| row.get::<_, String>(0))?;

        let mut nodes = BTreeSet::new();
        for row in rows {
            nodes.insert(NodeId(row?));
        }
        Ok(nodes)
    }

    fn channel_members(&self, channel_id: ChannelId) -> Result<BTreeSet<UserId>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT user_id FROM user_channels WHERE channel_id = ?1")?;
        let rows = stmt.query_map(params![channel_id.to_string()], |row| row.get::<_, String>(0))?;

        let mut members = BTreeSet::new();
        for row in rows {
            members.insert(UserId(row?));
        }
        Ok(members)
    }

    fn get_channel_row(&self, id: ChannelId) -> Result<Option<Channel>> {
        let channel = self
            .conn()
            .query_row(
                "SELECT id, name, channel_type, created_at FROM channels WHERE id = ?1",
                params![id.to_string()],
                row_to_channel,
            )
            .optional()?;
        Ok(channel)
    }
}

/// Map a row to a [`Channel`] with an empty member set.
fn row_to_channel(row: &rusqlite::Row<'_>) -> rusqlite::Result<Channel> {
    let id_str: String = row.get(0)?;
    let type_str: String = row.get(2)?;
    let created_at: i64 = row.get(3)?;

    Ok(Channel {
        id: ChannelId(uuid_column(0, &id_str)?),
        name: row.get(1)?,
        channel_type: enum_column(2, &type_str, ChannelType::parse)?,
        member_ids: BTreeSet::new(),
        created_at: timestamp(created_at),
    })
}

#[cfg(test)]
mod tests {
    use hive_shared::types::utc_now_millis;

    use super::*;

    fn channel(name: &str, members: &[&str]) -> Channel {
        Channel {
            id: ChannelId::new(),
            name: name.into(),
            channel_type: ChannelType::Public,
            member_ids: members.iter().map(|m| UserId::from(*m)).collect(),
            created_at: utc_now_millis(),
        }
    }

    #[test]
    fn test_upsert_and_get_with_members() {
        let db = Database::open_in_memory().unwrap();
        let ch = channel("general", &["alice", "bob"]);
        db.upsert_channel(&ch).unwrap();
        assert_eq!(db.get_channel(ch.id).unwrap(), Some(ch));
    }

    #[test]
    fn test_channels_for_user_filters_membership() {
        let db = Database::open_in_memory().unwrap();
        let general = channel("general", &["alice", "bob"]);
        let random = channel("random", &["bob"]);
        db.upsert_channel(&general).unwrap();
        db.upsert_channel(&random).unwrap();

        let alice = db.channels_for_user(&UserId::from("alice")).unwrap();
        assert_eq!(alice.len(), 1);
        assert_eq!(alice[0].id, general.id);

        let bob = db.channels_for_user(&UserId::from("bob")).unwrap();
        assert_eq!(bob.len(), 2);
    }

    #[test]
    fn test_membership_changes() {
        let db = Database::open_in_memory().unwrap();
        let ch = channel("general", &[]);
        db.upsert_channel(&ch).unwrap();

        let carol = UserId::from("carol");
        assert!(db.add_channel_member(ch.id, &carol).unwrap());
        assert!(db.add_channel_member(ch.id, &carol).unwrap());
        assert!(db.get_channel(ch.id).unwrap().unwrap().has_member(&carol));

        assert!(db.remove_channel_member(ch.id, &carol).unwrap());
        assert!(!db.remove_channel_member(ch.id, &carol).unwrap());
        assert!(!db.add_channel_member(ChannelId::new(), &carol).unwrap());
    }

    #[test]
    fn test_channel_nodes_are_a_set() {
        let db = Database::open_in_memory().unwrap();
        let ch = channel("general", &[]);
        db.upsert_channel(&ch).unwrap();

        let n = NodeId::from("n1");
        db.record_channel_node(ch.id, &n).unwrap();
        db.record_channel_node(ch.id, &n).unwrap();
        assert_eq!(db.channel_nodes(ch.id).unwrap().len(), 1);
        assert_eq!(db.list_channel_ids().unwrap(), vec![ch.id]);
    }
}
