//! v002 -- Track messages not yet acknowledged by the registry.
//!
//! Rows default to forwarded so messages pulled from the registry, and every
//! message stored before this version, are never re-sent.

use rusqlite::Connection;

const UP_SQL: &str = r#"
ALTER TABLE messages ADD COLUMN forwarded INTEGER NOT NULL DEFAULT 1;  -- boolean 0/1

CREATE INDEX IF NOT EXISTS idx_messages_pending
    ON messages(sent_at, id) WHERE forwarded = 0;
"#;

pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
