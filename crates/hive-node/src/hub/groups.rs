//! Channel groups: which live connections receive which channel's events.

use std::collections::{HashMap, HashSet};

use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};

use hive_shared::protocol::ServerEvent;
use hive_shared::types::{ChannelId, ConnectionId, UserId};

struct Member {
    user_id: UserId,
    tx: mpsc::Sender<ServerEvent>,
    redirecting: bool,
    channels: HashSet<ChannelId>,
}

#[derive(Default)]
struct Groups {
    members: HashMap<ConnectionId, Member>,
    rooms: HashMap<ChannelId, HashSet<ConnectionId>>,
}

impl Groups {
    fn leave(&mut self, conn: ConnectionId, channel_id: ChannelId) {
        let should_remove = match self.rooms.get_mut(&channel_id) {
            Some(room) => {
                room.remove(&conn);
                room.is_empty()
            }
            None => false,
        };
        if should_remove {
            self.rooms.remove(&channel_id);
            debug!(channel = %channel_id, "Removed empty channel group");
        }
    }
}

/// What remained of a connection when it was unregistered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departed {
    pub user_id: UserId,
    pub redirecting: bool,
    pub channels: Vec<ChannelId>,
}

#[derive(Default)]
pub struct GroupRegistry {
    inner: RwLock<Groups>,
}

impl GroupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, conn: ConnectionId, user_id: UserId, tx: mpsc::Sender<ServerEvent>) {
        self.inner.write().await.members.insert(
            conn,
            Member {
                user_id,
                tx,
                redirecting: false,
                channels: HashSet::new(),
            },
        );
    }

    /// Drop a connection from every group it joined.
    pub async fn unregister(&self, conn: ConnectionId) -> Option<Departed> {
        let mut groups = self.inner.write().await;
        let member = groups.members.remove(&conn)?;
        let mut channels: Vec<ChannelId> = member.channels.into_iter().collect();
        channels.sort();
        for channel_id in &channels {
            groups.leave(conn, *channel_id);
        }
        Some(Departed {
            user_id: member.user_id,
            redirecting: member.redirecting,
            channels,
        })
    }

    /// Returns `false` if the connection is unknown.
    pub async fn join(&self, conn: ConnectionId, channel_id: ChannelId) -> bool {
        let mut groups = self.inner.write().await;
        let Some(member) = groups.members.get_mut(&conn) else {
            return false;
        };
        member.channels.insert(channel_id);
        let room = groups.rooms.entry(channel_id).or_default();
        room.insert(conn);

        debug!(
            channel = %channel_id,
            conn = %conn,
            members = room.len(),
            "Connection joined channel group"
        );
        true
    }

    pub async fn leave(&self, conn: ConnectionId, channel_id: ChannelId) {
        let mut groups = self.inner.write().await;
        if let Some(member) = groups.members.get_mut(&conn) {
            member.channels.remove(&channel_id);
        }
        groups.leave(conn, channel_id);
    }

    /// Drop every group membership of the connection and flag it as moving
    /// to another node.
    pub async fn mark_redirecting(&self, conn: ConnectionId) -> Vec<ChannelId> {
        let mut groups = self.inner.write().await;
        let Some(member) = groups.members.get_mut(&conn) else {
            return Vec::new();
        };
        member.redirecting = true;
        let channels: Vec<ChannelId> = member.channels.drain().collect();
        for channel_id in &channels {
            groups.leave(conn, *channel_id);
        }
        info!(conn = %conn, channels = channels.len(), "Connection is redirecting");
        channels
    }

    pub async fn is_member(&self, conn: ConnectionId, channel_id: ChannelId) -> bool {
        self.inner
            .read()
            .await
            .rooms
            .get(&channel_id)
            .is_some_and(|room| room.contains(&conn))
    }

    /// Deliver `event` to every connection in the group except `except`.
    /// Slow receivers drop the event. Returns the number delivered.
    pub async fn broadcast(
        &self,
        channel_id: ChannelId,
        event: &ServerEvent,
        except: Option<ConnectionId>,
    ) -> usize {
        let groups = self.inner.read().await;
        let Some(room) = groups.rooms.get(&channel_id) else {
            return 0;
        };

        let mut delivered = 0;
        for conn in room {
            if Some(*conn) == except {
                continue;
            }
            let Some(member) = groups.members.get(conn) else {
                continue;
            };
            if member.tx.try_send(event.clone()).is_ok() {
                delivered += 1;
            } else {
                debug!(channel = %channel_id, target = %conn, "Dropping event for slow connection");
            }
        }
        delivered
    }

    pub async fn send_to(&self, conn: ConnectionId, event: ServerEvent) -> bool {
        let groups = self.inner.read().await;
        groups
            .members
            .get(&conn)
            .is_some_and(|member| member.tx.try_send(event).is_ok())
    }

    pub async fn memberships(&self, conn: ConnectionId) -> Vec<ChannelId> {
        let groups = self.inner.read().await;
        let mut channels: Vec<ChannelId> = groups
            .members
            .get(&conn)
            .map(|m| m.channels.iter().copied().collect())
            .unwrap_or_default();
        channels.sort();
        channels
    }

    /// Channels with at least one local member.
    pub async fn served_channels(&self) -> Vec<ChannelId> {
        let mut channels: Vec<ChannelId> = self.inner.read().await.rooms.keys().copied().collect();
        channels.sort();
        channels
    }

    pub async fn member_count(&self, channel_id: ChannelId) -> usize {
        self.inner
            .read()
            .await
            .rooms
            .get(&channel_id)
            .map_or(0, HashSet::len)
    }
}
