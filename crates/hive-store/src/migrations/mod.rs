//! Schema migrations, keyed on SQLite's `user_version` pragma.
//!
//! Each step runs inside its own transaction together with the version bump,
//! so a crash mid-migration leaves the previous version intact.

pub mod v001_initial;
pub mod v002_pending_forward;

use rusqlite::Connection;

use crate::error::{Result, StoreError};

type Step = fn(&Connection) -> rusqlite::Result<()>;

/// Ordered list of (version, name, step).
const MIGRATIONS: &[(u32, &str, Step)] = &[
    (1, "initial", v001_initial::up),
    (2, "pending_forward", v002_pending_forward::up),
];

/// Version a fully migrated database reports.
pub const CURRENT_VERSION: u32 = 2;

pub fn run_migrations(conn: &Connection) -> Result<()> {
    let found: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    if found > CURRENT_VERSION {
        return Err(StoreError::Migration {
            version: found,
            reason: format!("database is newer than this build (v{CURRENT_VERSION})"),
        });
    }

    for &(version, name, step) in MIGRATIONS.iter().filter(|(v, _, _)| *v > found) {
        tracing::info!(version, name, "applying schema migration");
        let tx = conn.unchecked_transaction()?;
        step(&tx).map_err(|e| StoreError::Migration {
            version,
            reason: e.to_string(),
        })?;
        tx.pragma_update(None, "user_version", version)?;
        tx.commit()?;
    }

    Ok(())
}
