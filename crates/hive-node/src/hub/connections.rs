use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use hive_shared::types::{ConnectionId, UserId};

/// Live connection ids per user, behind one lock.
///
/// A user is online while at least one connection is tracked.
#[derive(Default)]
pub struct ConnectionRegistry {
    inner: Mutex<HashMap<UserId, HashSet<ConnectionId>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` when this is the user's first live connection.
    pub fn track(&self, user_id: &UserId, conn: ConnectionId) -> bool {
        let mut users = self.lock();
        let conns = users.entry(user_id.clone()).or_default();
        let first = conns.is_empty();
        conns.insert(conn);
        first
    }

    /// Returns `true` exactly when the user's last connection went away.
    pub fn remove(&self, user_id: &UserId, conn: ConnectionId) -> bool {
        let mut users = self.lock();
        let Some(conns) = users.get_mut(user_id) else {
            return false;
        };
        if !conns.remove(&conn) {
            return false;
        }
        if conns.is_empty() {
            users.remove(user_id);
            return true;
        }
        false
    }

    pub fn is_online(&self, user_id: &UserId) -> bool {
        self.lock().contains_key(user_id)
    }

    pub fn connections_of(&self, user_id: &UserId) -> usize {
        self.lock().get(user_id).map_or(0, HashSet::len)
    }

    /// Total live connections on this node.
    pub fn connection_count(&self) -> usize {
        self.lock().values().map(HashSet::len).sum()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<UserId, HashSet<ConnectionId>>> {
        // The map stays consistent even if a holder panicked.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}
