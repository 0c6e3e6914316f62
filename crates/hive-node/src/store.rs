use std::sync::{Arc, Mutex};

use hive_store::Database;

use crate::error::NodeError;

/// The node's local channel and message cache.
///
/// Closures passed to [`LocalStore::with`] are synchronous; the lock is
/// never held across an `.await`.
#[derive(Clone)]
pub struct LocalStore {
    inner: Arc<Mutex<Database>>,
}

impl LocalStore {
    pub fn new(db: Database) -> Self {
        Self {
            inner: Arc::new(Mutex::new(db)),
        }
    }

    pub fn with<T>(
        &self,
        f: impl FnOnce(&Database) -> hive_store::Result<T>,
    ) -> Result<T, NodeError> {
        let guard = self
            .inner
            .lock()
            .map_err(|e| NodeError::Internal(format!("local store lock poisoned: {e}")))?;
        Ok(f(&guard)?)
    }

    pub fn in_memory() -> Result<Self, NodeError> {
        Ok(Self::new(Database::open_in_memory()?))
    }
}
