use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use hive_shared::models::{Presence, User};
use hive_shared::types::{NodeId, UserId};

use crate::columns::{enum_column, millis, timestamp};
use crate::database::Database;
use crate::error::Result;

impl Database {
    pub fn upsert_user(&self, user: &User) -> Result<()> {
        self.conn().execute(
            "INSERT INTO users (id, display_name, presence, node_id, last_seen)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                display_name = excluded.display_name,
                presence = excluded.presence,
                node_id = excluded.node_id,
                last_seen = excluded.last_seen",
            params![
                user.id.as_str(),
                user.display_name,
                user.presence.as_str(),
                user.node_id.as_ref().map(|n| n.as_str()),
                millis(&user.last_seen),
            ],
        )?;
        Ok(())
    }

    /// Set a user's presence, creating the user on first sight.
    pub fn set_user_presence(
        &self,
        id: &UserId,
        presence: Presence,
        node_id: Option<&NodeId>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.conn().execute(
            "INSERT INTO users (id, display_name, presence, node_id, last_seen)
             VALUES (?1, NULL, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                presence = excluded.presence,
                node_id = COALESCE(excluded.node_id, users.node_id),
                last_seen = excluded.last_seen",
            params![
                id.as_str(),
                presence.as_str(),
                node_id.map(|n| n.as_str()),
                millis(&now),
            ],
        )?;
        Ok(())
    }

    pub fn get_user(&self, id: &UserId) -> Result<Option<User>> {
        let user = self
            .conn()
            .query_row(
                "SELECT id, display_name, presence, node_id, last_seen FROM users WHERE id = ?1",
                params![id.as_str()],
                row_to_user,
            )
            .optional()?;
        Ok(user)
    }
}

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    let id: String = row.get(0)?;
    let presence: String = row.get(2)?;
    let node_id: Option<String> = row.get(3)?;
    let last_seen: i64 = row.get(4)?;

    Ok(User {
        id: UserId(id),
        display_name: row.get(1)?,
        presence: enum_column(2, &presence, Presence::parse)?,
        node_id: node_id.map(NodeId),
        last_seen: timestamp(last_seen),
    })
}
