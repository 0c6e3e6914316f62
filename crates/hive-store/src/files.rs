//! CRUD operations for [`FileRecord`] records and their node locations.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use hive_shared::models::FileRecord;
use hive_shared::types::{FileId, NodeId, UserId};

use crate::columns::{json_column, millis, timestamp, to_json, uuid_column};
use crate::database::Database;
use crate::error::Result;

const FILE_COLUMNS: &str = "file_id, filename, content_type, size, checksum, tags, metadata,
     owner_id, created_at, modified_at";

impl Database {
    // ------------------------------------------------------------------
    // Write
    // ------------------------------------------------------------------

    /// Create or overwrite a file record, replacing its location set.
    pub fn upsert_file(&self, file: &FileRecord) -> Result<()> {
        let tx = self.conn().unchecked_transaction()?;

        tx.execute(
            "INSERT INTO files (file_id, filename, content_type, size, checksum, tags, metadata,
                                owner_id, created_at, modified_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(file_id) DO UPDATE SET
                filename = excluded.filename,
                content_type = excluded.content_type,
                size = excluded.size,
                checksum = excluded.checksum,
                tags = excluded.tags,
                metadata = excluded.metadata,
                owner_id = excluded.owner_id,
                created_at = excluded.created_at,
                modified_at = excluded.modified_at",
            params![
                file.file_id.to_string(),
                file.filename,
                file.content_type,
                file.size as i64,
                file.checksum,
                to_json(&file.tags)?,
                to_json(&file.metadata)?,
                file.owner_id.as_str(),
                millis(&file.created_at),
                millis(&file.modified_at),
            ],
        )?;

        tx.execute(
            "DELETE FROM file_locations WHERE file_id = ?1",
            params![file.file_id.to_string()],
        )?;
        for node_id in &file.node_ids {
            tx.execute(
                "INSERT INTO file_locations (file_id, node_id, added_at) VALUES (?1, ?2, ?3)",
                params![file.file_id.to_string(), node_id.as_str(), millis(&file.modified_at)],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    /// Replace the full location set. Returns `false` for an unknown file.
    pub fn replace_file_locations(
        &self,
        id: FileId,
        node_ids: &BTreeSet<NodeId>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let tx = self.conn().unchecked_transaction()?;

        let touched = tx.execute(
            "UPDATE files SET modified_at = ?2 WHERE file_id = ?1",
            params![id.to_string(), millis(&now)],
        )?;
        if touched == 0 {
            return Ok(false);
        }

        tx.execute(
            "DELETE FROM file_locations WHERE file_id = ?1",
            params![id.to_string()],
        )?;
        for node_id in node_ids {
            tx.execute(
                "INSERT INTO file_locations (file_id, node_id, added_at) VALUES (?1, ?2, ?3)",
                params![id.to_string(), node_id.as_str(), millis(&now)],
            )?;
        }

        tx.commit()?;
        Ok(true)
    }

    /// Add one location. Adding an existing location is a no-op.
    ///
    /// Returns `false` for an unknown file.
    pub fn add_file_location(&self, id: FileId, node_id: &NodeId, now: DateTime<Utc>) -> Result<bool> {
        if !self.file_exists(id)? {
            return Ok(false);
        }
        let inserted = self.conn().execute(
            "INSERT OR IGNORE INTO file_locations (file_id, node_id, added_at) VALUES (?1, ?2, ?3)",
            params![id.to_string(), node_id.as_str(), millis(&now)],
        )?;
        if inserted > 0 {
            self.touch_file(id, now)?;
        }
        Ok(true)
    }

    /// Remove one location. Removing an absent location is a no-op.
    ///
    /// Returns `false` for an unknown file.
    pub fn remove_file_location(
        &self,
        id: FileId,
        node_id: &NodeId,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        if !self.file_exists(id)? {
            return Ok(false);
        }
        let removed = self.conn().execute(
            "DELETE FROM file_locations WHERE file_id = ?1 AND node_id = ?2",
            params![id.to_string(), node_id.as_str()],
        )?;
        if removed > 0 {
            self.touch_file(id, now)?;
        }
        Ok(true)
    }

    // locations cascade with the record
    pub fn delete_file(&self, id: FileId) -> Result<bool> {
        let affected = self
            .conn()
            .execute("DELETE FROM files WHERE file_id = ?1", params![id.to_string()])?;
        Ok(affected > 0)
    }

    fn touch_file(&self, id: FileId, now: DateTime<Utc>) -> Result<()> {
        self.conn().execute(
            "UPDATE files SET modified_at = ?2 WHERE file_id = ?1",
            params![id.to_string(), millis(&now)],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    pub fn file_exists(&self, id: FileId) -> Result<bool> {
        let found = self
            .conn()
            .query_row(
                "SELECT 1 FROM files WHERE file_id = ?1",
                params![id.to_string()],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn get_file(&self, id: FileId) -> Result<Option<FileRecord>> {
        let file = self
            .conn()
            .query_row(
                &format!("SELECT {FILE_COLUMNS} FROM files WHERE file_id = ?1"),
                params![id.to_string()],
                row_to_file,
            )
            .optional()?;

        match file {
            Some(mut file) => {
                file.node_ids = self.file_locations(id)?;
                Ok(Some(file))
            }
            None => Ok(None),
        }
    }

    /// All files ordered by filename, then id.
    pub fn list_files(&self) -> Result<Vec<FileRecord>> {
        self.query_files(
            &format!("SELECT {FILE_COLUMNS} FROM files ORDER BY filename ASC, file_id ASC"),
            [],
        )
    }

    /// Keyset page of files ordered by id, starting after `after`.
    pub fn list_files_after(&self, after: Option<FileId>, limit: usize) -> Result<Vec<FileRecord>> {
        let after = after.map(|id| id.to_string()).unwrap_or_default();
        self.query_files(
            &format!(
                "SELECT {FILE_COLUMNS} FROM files WHERE file_id > ?1
                 ORDER BY file_id ASC LIMIT ?2"
            ),
            params![after, limit as i64],
        )
    }

    /// Reverse index: every file with a location on `node_id`.
    pub fn files_on_node(&self, node_id: &NodeId) -> Result<Vec<FileRecord>> {
        self.query_files(
            &format!(
                "SELECT {FILE_COLUMNS} FROM files
                 WHERE file_id IN (SELECT file_id FROM file_locations WHERE node_id = ?1)
                 ORDER BY file_id ASC"
            ),
            params![node_id.as_str()],
        )
    }

    pub fn file_locations(&self, id: FileId) -> Result<BTreeSet<NodeId>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT node_id FROM file_locations WHERE file_id = ?1")?;
        let rows = stmt.query_map(params![id.to_string()], |row| row.get::<_, String>(0))?;

        let mut nodes = BTreeSet::new();
        for row in rows {
            nodes.insert(NodeId(row?));
        }
        Ok(nodes)
    }

    fn query_files<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<Vec<FileRecord>> {
        let mut stmt = self.conn().prepare(sql)?;
        let rows = stmt.query_map(params, row_to_file)?;

        let mut files = Vec::new();
        for row in rows {
            files.push(row?);
        }
        for file in &mut files {
            file.node_ids = self.file_locations(file.file_id)?;
        }
        Ok(files)
    }
}

/// Map a row to a [`FileRecord`] with an empty location set.
fn row_to_file(row: &rusqlite::Row<'_>) -> rusqlite::Result<FileRecord> {
    let id_str: String = row.get(0)?;
    let size: i64 = row.get(3)?;
    let tags_json: String = row.get(5)?;
    let metadata_json: String = row.get(6)?;
    let owner: String = row.get(7)?;
    let created_at: i64 = row.get(8)?;
    let modified_at: i64 = row.get(9)?;

    Ok(FileRecord {
        file_id: FileId(uuid_column(0, &id_str)?),
        filename: row.get(1)?,
        content_type: row.get(2)?,
        size: size as u64,
        checksum: row.get(4)?,
        node_ids: BTreeSet::new(),
        tags: json_column(5, &tags_json)?,
        metadata: json_column(6, &metadata_json)?,
        owner_id: UserId(owner),
        created_at: timestamp(created_at),
        modified_at: timestamp(modified_at),
    })
}
