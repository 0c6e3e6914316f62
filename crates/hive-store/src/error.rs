use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Creating the database directory failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Schema migration v{version} failed: {reason}")]
    Migration { version: u32, reason: String },

    /// Encoding a JSON column (tags, metadata, attachments, members).
    #[error("Cannot encode column: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;
