//! v001 -- Initial schema creation.
//!
//! Entity tables `nodes`, `files`, `users`, `channels`, `messages` and the
//! relations `file_locations`, `user_channels`, `channel_nodes` and
//! `message_locations`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Storage nodes (status embedded)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS nodes (
    id                 TEXT PRIMARY KEY NOT NULL,
    endpoint           TEXT NOT NULL,
    hostname           TEXT NOT NULL,
    region             TEXT NOT NULL,
    tags               TEXT NOT NULL DEFAULT '[]',  -- JSON array
    total_storage      INTEGER NOT NULL,
    metadata           TEXT NOT NULL DEFAULT '{}',  -- JSON object
    last_seen          INTEGER NOT NULL,            -- epoch millis
    is_healthy         INTEGER NOT NULL,            -- boolean 0/1
    current_load       REAL NOT NULL,
    available_space    INTEGER NOT NULL,
    used_space         INTEGER NOT NULL,
    active_connections INTEGER NOT NULL,
    active_transfers   INTEGER NOT NULL,
    network_capacity   INTEGER NOT NULL,
    status_updated     INTEGER NOT NULL             -- epoch millis
);

CREATE INDEX IF NOT EXISTS idx_nodes_region ON nodes(region);

-- ----------------------------------------------------------------
-- Files and their locations
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS files (
    file_id      TEXT PRIMARY KEY NOT NULL,       -- UUID v4
    filename     TEXT NOT NULL,
    content_type TEXT NOT NULL,
    size         INTEGER NOT NULL,
    checksum     TEXT NOT NULL,                   -- BLAKE3 hex
    tags         TEXT NOT NULL DEFAULT '[]',
    metadata     TEXT NOT NULL DEFAULT '{}',
    owner_id     TEXT NOT NULL,
    created_at   INTEGER NOT NULL,
    modified_at  INTEGER NOT NULL
);

-- No FK to nodes: locations may outlive the node they point at.
CREATE TABLE IF NOT EXISTS file_locations (
    file_id  TEXT NOT NULL,
    node_id  TEXT NOT NULL,
    added_at INTEGER NOT NULL,

    PRIMARY KEY (file_id, node_id),
    FOREIGN KEY (file_id) REFERENCES files(file_id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_file_locations_node ON file_locations(node_id);

-- ----------------------------------------------------------------
-- Users
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS users (
    id           TEXT PRIMARY KEY NOT NULL,
    display_name TEXT,
    presence     TEXT NOT NULL,                   -- Online / Offline
    node_id      TEXT,
    last_seen    INTEGER NOT NULL
);

-- ----------------------------------------------------------------
-- Channels and memberships
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS channels (
    id           TEXT PRIMARY KEY NOT NULL,       -- UUID v4
    name         TEXT NOT NULL,
    channel_type TEXT NOT NULL,                   -- Public / Private / DirectMessage
    created_at   INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS user_channels (
    user_id    TEXT NOT NULL,
    channel_id TEXT NOT NULL,

    PRIMARY KEY (user_id, channel_id),
    FOREIGN KEY (channel_id) REFERENCES channels(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_user_channels_channel ON user_channels(channel_id);

CREATE TABLE IF NOT EXISTS channel_nodes (
    channel_id TEXT NOT NULL,
    node_id    TEXT NOT NULL,

    PRIMARY KEY (channel_id, node_id),
    FOREIGN KEY (channel_id) REFERENCES channels(id) ON DELETE CASCADE
);

-- ----------------------------------------------------------------
-- Messages
-- ----------------------------------------------------------------
-- No FK to channels: pulled messages may arrive before channel metadata.
CREATE TABLE IF NOT EXISTS messages (
    id          TEXT PRIMARY KEY NOT NULL,        -- UUID v4
    channel_id  TEXT NOT NULL,
    sender_id   TEXT NOT NULL,
    content     TEXT NOT NULL,
    sent_at     INTEGER NOT NULL,                 -- epoch millis
    attachments TEXT NOT NULL DEFAULT '[]'        -- JSON array
);

CREATE INDEX IF NOT EXISTS idx_messages_channel_sent
    ON messages(channel_id, sent_at);

CREATE TABLE IF NOT EXISTS message_locations (
    message_id TEXT NOT NULL,
    node_id    TEXT NOT NULL,

    PRIMARY KEY (message_id, node_id),
    FOREIGN KEY (message_id) REFERENCES messages(id) ON DELETE CASCADE
);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
