use std::sync::{Arc, Mutex};

use hive_store::Database;

use crate::error::RegistryError;

/// The registry's single SQLite handle, shared by every component.
///
/// Access goes through [`SharedDb::with`], whose closure is synchronous, so
/// the lock can never be held across an `.await`.
#[derive(Clone)]
pub struct SharedDb {
    inner: Arc<Mutex<Database>>,
}

impl SharedDb {
    pub fn new(db: Database) -> Self {
        Self {
            inner: Arc::new(Mutex::new(db)),
        }
    }

    pub fn with<T>(
        &self,
        f: impl FnOnce(&Database) -> hive_store::Result<T>,
    ) -> Result<T, RegistryError> {
        let guard = self
            .inner
            .lock()
            .map_err(|e| RegistryError::Internal(format!("database lock poisoned: {e}")))?;
        Ok(f(&guard)?)
    }

    /// Fresh in-memory database, for tests.
    pub fn in_memory() -> Result<Self, RegistryError> {
        Ok(Self::new(Database::open_in_memory()?))
    }
}
