//! Hub operations invoked by websocket sessions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use hive_shared::constants::{
    DEFAULT_REDIRECT_GRACE_SECS, DEFAULT_SYNC_LOOKBACK_SECS, SYNC_PAGE_SIZE,
};
use hive_shared::models::{Attachment, Channel, ChannelType, Message, Presence};
use hive_shared::protocol::{
    validate_message_content, ClientRequest, MessageSyncEvent, ServerEvent, UserStatusUpdate,
};
use hive_shared::types::{utc_now_millis, ChannelId, ConnectionId, MessageId, NodeId, UserId};
use hive_shared::ErrorKind;

use crate::error::NodeError;
use crate::hub::connections::ConnectionRegistry;
use crate::hub::groups::GroupRegistry;
use crate::hub::upstream::HubUpstream;
use crate::store::LocalStore;

/// Upper bound on pages pulled for one channel in one pass.
const MAX_PULL_PAGES: usize = 10;

/// Position in a channel's `(sent_at, id)` order.
///
/// Without an id the position lies after every message at `sent_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SyncCursor {
    sent_at: DateTime<Utc>,
    id: Option<MessageId>,
}

impl SyncCursor {
    fn at(sent_at: DateTime<Utc>) -> Self {
        Self { sent_at, id: None }
    }

    fn after(message: &Message) -> Self {
        Self {
            sent_at: message.sent_at,
            id: Some(message.id),
        }
    }

    fn is_behind(&self, other: &SyncCursor) -> bool {
        match (self.sent_at.cmp(&other.sent_at), self.id, other.id) {
            (std::cmp::Ordering::Equal, Some(a), Some(b)) => a < b,
            (std::cmp::Ordering::Equal, Some(_), None) => true,
            (std::cmp::Ordering::Equal, None, _) => false,
            (ord, _, _) => ord.is_lt(),
        }
    }
}

pub struct Hub {
    node_id: NodeId,
    store: LocalStore,
    upstream: Arc<dyn HubUpstream>,
    connections: ConnectionRegistry,
    groups: GroupRegistry,
    /// Pull position in the registry's message log, per served channel.
    cursors: Mutex<HashMap<ChannelId, SyncCursor>>,
    sync_lookback: chrono::Duration,
    redirect_grace: Duration,
}

impl Hub {
    pub fn new(
        node_id: NodeId,
        store: LocalStore,
        connections: ConnectionRegistry,
        upstream: Arc<dyn HubUpstream>,
    ) -> Self {
        Self {
            node_id,
            store,
            upstream,
            connections,
            groups: GroupRegistry::new(),
            cursors: Mutex::new(HashMap::new()),
            sync_lookback: chrono::Duration::seconds(DEFAULT_SYNC_LOOKBACK_SECS as i64),
            redirect_grace: Duration::from_secs(DEFAULT_REDIRECT_GRACE_SECS),
        }
    }

    /// How far behind its cursor each pull re-reads for late arrivals.
    pub fn with_sync_lookback(mut self, lookback: Duration) -> Self {
        self.sync_lookback =
            chrono::Duration::from_std(lookback).unwrap_or_else(|_| chrono::Duration::zero());
        self
    }

    /// How long to wait for a redirected user before announcing Offline.
    pub fn with_redirect_grace(mut self, grace: Duration) -> Self {
        self.redirect_grace = grace;
        self
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn connection_count(&self) -> usize {
        self.connections.connection_count()
    }

    pub fn is_online(&self, user_id: &UserId) -> bool {
        self.connections.is_online(user_id)
    }

    pub fn groups(&self) -> &GroupRegistry {
        &self.groups
    }

    // ------------------------------------------------------------------
    // Connection lifecycle
    // ------------------------------------------------------------------

    /// Attach a new connection and join it to every channel of the user.
    ///
    /// Presence is broadcast Online only for the user's first connection,
    /// and never for a failover reconnection. A failover reconnection still
    /// tells the registry which node now holds the user.
    pub async fn connect(
        &self,
        user_id: UserId,
        failover: bool,
        tx: mpsc::Sender<ServerEvent>,
    ) -> ConnectionId {
        let conn = ConnectionId::new();
        self.groups.register(conn, user_id.clone(), tx).await;
        let first = self.connections.track(&user_id, conn);

        let channels = self.user_channels(&user_id).await;
        for channel in &channels {
            self.groups.join(conn, channel.id).await;
        }

        info!(
            user = %user_id,
            conn = %conn,
            failover,
            channels = channels.len(),
            "Hub connection established"
        );

        if first && failover {
            self.record_presence(&user_id, Presence::Online).await;
        } else if first {
            let ids: Vec<ChannelId> = channels.iter().map(|c| c.id).collect();
            self.announce_presence(&user_id, Presence::Online, &ids, Some(conn))
                .await;
        }
        conn
    }

    /// Detach a connection. Returns `true` when the user went offline.
    ///
    /// After a NotifyRedirecting the Offline announcement is held back for
    /// the redirect grace period and dropped if the user reappeared, here or
    /// on another node.
    pub async fn disconnect(&self, conn: ConnectionId, user_id: &UserId) -> bool {
        let departed = self.groups.unregister(conn).await;
        let last = self.connections.remove(user_id, conn);
        let redirecting = departed.as_ref().is_some_and(|d| d.redirecting);

        info!(user = %user_id, conn = %conn, last, redirecting, "Hub connection closed");

        if !last {
            return false;
        }

        let channels = if redirecting {
            if !self.failover_missed(user_id).await {
                return false;
            }
            // the redirect already dropped the group memberships
            self.store
                .with(|db| db.channels_for_user(user_id))
                .unwrap_or_default()
                .into_iter()
                .map(|c| c.id)
                .collect()
        } else {
            departed.map(|d| d.channels).unwrap_or_default()
        };

        self.announce_presence(user_id, Presence::Offline, &channels, None)
            .await;
        true
    }

    /// Wait out the redirect grace period. Returns `true` when the user
    /// neither reconnected here nor shows up online on another node.
    async fn failover_missed(&self, user_id: &UserId) -> bool {
        tokio::time::sleep(self.redirect_grace).await;

        if self.connections.is_online(user_id) {
            debug!(user = %user_id, "Redirected user reconnected to this node");
            return false;
        }

        match self.upstream.get_user(user_id).await {
            Ok(Some(user))
                if user.presence == Presence::Online
                    && user.node_id.as_ref().is_some_and(|n| *n != self.node_id) =>
            {
                debug!(user = %user_id, node = ?user.node_id, "Redirected user is online elsewhere");
                false
            }
            Ok(_) => {
                info!(user = %user_id, "Redirected user never reconnected");
                true
            }
            Err(e) => {
                warn!(user = %user_id, error = %e, "Cannot confirm redirect target, treating user as offline");
                true
            }
        }
    }

    // ------------------------------------------------------------------
    // Requests
    // ------------------------------------------------------------------

    /// Handle one raw frame. Failures come back as a `ConnectionError`
    /// event; the connection stays open.
    pub async fn dispatch(&self, conn: ConnectionId, user_id: &UserId, text: &str) -> Vec<ServerEvent> {
        let request = match ClientRequest::from_json(text) {
            Ok(r) => r,
            Err(e) => {
                return vec![ServerEvent::ConnectionError {
                    operation: "Unknown".to_string(),
                    error: e.to_string(),
                }]
            }
        };

        let operation = request.operation();
        match self.handle(conn, user_id, request).await {
            Ok(events) => events,
            Err(e) => {
                warn!(user = %user_id, operation, error = %e, "Hub request failed");
                vec![ServerEvent::ConnectionError {
                    operation: operation.to_string(),
                    error: e.to_string(),
                }]
            }
        }
    }

    /// Execute a request; the returned events go to the caller only.
    pub async fn handle(
        &self,
        conn: ConnectionId,
        user_id: &UserId,
        request: ClientRequest,
    ) -> Result<Vec<ServerEvent>, NodeError> {
        match request {
            ClientRequest::JoinChannel { channel_id } => {
                let channel = self.resolve_channel(channel_id).await?;
                ensure_access(&channel, user_id)?;
                self.groups.join(conn, channel_id).await;
                Ok(Vec::new())
            }
            ClientRequest::LeaveChannel { channel_id } => {
                self.groups.leave(conn, channel_id).await;
                Ok(Vec::new())
            }
            ClientRequest::SendMessage {
                channel_id,
                content,
                attachments,
            } => {
                self.send_message(conn, user_id, channel_id, content, attachments)
                    .await?;
                Ok(Vec::new())
            }
            ClientRequest::SendTypingNotification {
                channel_id,
                is_typing,
            } => {
                if !self.groups.is_member(conn, channel_id).await {
                    return Err(NodeError::Forbidden(format!(
                        "not a member of channel {channel_id}"
                    )));
                }
                let event = ServerEvent::UserTyping {
                    user_id: user_id.clone(),
                    channel_id,
                    is_typing,
                };
                self.groups.broadcast(channel_id, &event, Some(conn)).await;
                Ok(Vec::new())
            }
            ClientRequest::UpdateStatus { presence } => {
                let channels = self.groups.memberships(conn).await;
                self.announce_presence(user_id, presence, &channels, Some(conn))
                    .await;
                Ok(Vec::new())
            }
            ClientRequest::SyncAfterNodeMigration { last_message_at } => {
                let channels = self.groups.memberships(conn).await;
                let mut messages = Vec::new();
                for channel_id in &channels {
                    messages.extend(self.channel_messages_since(*channel_id, last_message_at).await?);
                }
                messages.sort_by(|a, b| a.sent_at.cmp(&b.sent_at).then(a.id.cmp(&b.id)));

                debug!(
                    user = %user_id,
                    channels = channels.len(),
                    messages = messages.len(),
                    "Failover resync"
                );
                Ok(vec![
                    ServerEvent::StateSyncData {
                        messages,
                        server_time: utc_now_millis(),
                    },
                    ServerEvent::ReconnectionComplete {
                        node_id: self.node_id.clone(),
                        channels,
                    },
                ])
            }
            ClientRequest::SyncChannelMessages { channel_id, since } => {
                let channel = self.resolve_channel(channel_id).await?;
                ensure_access(&channel, user_id)?;
                let messages = self.channel_messages_since(channel_id, since).await?;
                Ok(vec![ServerEvent::StateSyncData {
                    messages,
                    server_time: utc_now_millis(),
                }])
            }
            ClientRequest::NotifyRedirecting {
                new_node_id,
                reason,
            } => {
                let dropped = self.groups.mark_redirecting(conn).await;
                info!(
                    user = %user_id,
                    new_node = ?new_node_id,
                    ?reason,
                    groups = dropped.len(),
                    "Client redirecting to another node"
                );
                Ok(vec![ServerEvent::RedirectAcknowledged {
                    node_id: self.node_id.clone(),
                }])
            }
        }
    }

    async fn send_message(
        &self,
        conn: ConnectionId,
        user_id: &UserId,
        channel_id: ChannelId,
        content: String,
        attachments: Vec<Attachment>,
    ) -> Result<Message, NodeError> {
        validate_message_content(&content)?;
        let channel = self.resolve_channel(channel_id).await?;
        ensure_access(&channel, user_id)?;

        let message = Message {
            id: MessageId::new(),
            channel_id,
            sender_id: user_id.clone(),
            content,
            sent_at: utc_now_millis(),
            attachments,
        };

        let node_id = self.node_id.clone();
        self.store.with(|db| {
            db.insert_pending_message(&message)?;
            db.record_message_location(message.id, &node_id)
        })?;

        let event = ServerEvent::ReceiveMessage {
            message: message.clone(),
        };
        let delivered = self.groups.broadcast(channel_id, &event, None).await;
        debug!(
            channel = %channel_id,
            message = %message.id,
            conn = %conn,
            delivered,
            "Message broadcast"
        );

        if let Err(e) = self.forward(&message).await {
            warn!(message = %message.id, error = %e, "Failed to forward message to registry, will retry");
        }

        Ok(message)
    }

    /// Send a locally created message to the registry. The pending marker
    /// is cleared once the registry accepted or permanently rejected it;
    /// any other failure leaves it queued for the next sync pass.
    async fn forward(&self, message: &Message) -> Result<(), NodeError> {
        let sync = MessageSyncEvent {
            message: message.clone(),
            origin_node_id: self.node_id.clone(),
        };
        match self.upstream.sync_message(&sync).await {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::Validation => {
                warn!(message = %message.id, error = %e, "Registry rejected message, not retrying");
            }
            Err(e) => return Err(e),
        }
        self.store.with(|db| db.mark_message_forwarded(message.id))
    }

    /// Re-send messages whose forward failed earlier, oldest first. Stops
    /// at the first failure. Returns how many were forwarded.
    pub async fn forward_pending(&self) -> usize {
        let pending = match self.store.with(|db| db.pending_messages(SYNC_PAGE_SIZE)) {
            Ok(pending) => pending,
            Err(e) => {
                warn!(error = %e, "Cannot read pending messages");
                return 0;
            }
        };

        let mut forwarded = 0;
        for message in &pending {
            if let Err(e) = self.forward(message).await {
                debug!(
                    message = %message.id,
                    remaining = pending.len() - forwarded,
                    error = %e,
                    "Registry still unavailable for pending messages"
                );
                break;
            }
            forwarded += 1;
        }
        if forwarded > 0 {
            info!(forwarded, "Forwarded pending messages to registry");
        }
        forwarded
    }

    // ------------------------------------------------------------------
    // Pull sync
    // ------------------------------------------------------------------

    /// Flush pending forwards, then pull registry messages for every
    /// locally served channel and deliver the unseen ones to the channel's
    /// group. Returns the number of messages delivered.
    pub async fn sync_served_channels(&self) -> usize {
        self.forward_pending().await;

        let mut delivered = 0;
        for channel_id in self.groups.served_channels().await {
            let cursor = match self.cursor(channel_id) {
                Ok(c) => c,
                Err(e) => {
                    warn!(channel = %channel_id, error = %e, "Cannot read sync cursor");
                    continue;
                }
            };

            let fresh = match self.pull_channel(channel_id, cursor).await {
                Ok(fresh) => fresh,
                Err(e) => {
                    warn!(channel = %channel_id, error = %e, "Channel pull failed");
                    continue;
                }
            };

            for message in fresh {
                let event = ServerEvent::ReceiveMessage { message };
                self.groups.broadcast(channel_id, &event, None).await;
                delivered += 1;
            }
        }
        delivered
    }

    fn cursor(&self, channel_id: ChannelId) -> Result<SyncCursor, NodeError> {
        if let Some(c) = self.lock_cursors().get(&channel_id) {
            return Ok(*c);
        }
        let latest = self.store.with(|db| db.latest_message_at(channel_id))?;
        Ok(SyncCursor::at(latest.unwrap_or_else(utc_now_millis)))
    }

    /// Pull forward from `cursor`, then re-read the lookback window behind
    /// it for messages that reached the registry late. Returns the messages
    /// newly stored, in `(sent_at, id)` order.
    async fn pull_channel(
        &self,
        channel_id: ChannelId,
        cursor: SyncCursor,
    ) -> Result<Vec<Message>, NodeError> {
        let (mut fresh, end) = self.pull_range(channel_id, cursor, None).await?;
        self.advance_cursor(channel_id, end);

        if self.sync_lookback > chrono::Duration::zero() {
            let window = SyncCursor::at(cursor.sent_at - self.sync_lookback);
            let (late, _) = self
                .pull_range(channel_id, window, Some(cursor.sent_at))
                .await?;
            if !late.is_empty() {
                debug!(channel = %channel_id, late = late.len(), "Pulled late-arriving messages");
            }
            fresh.extend(late);
        }

        fresh.sort_by(|a, b| a.sent_at.cmp(&b.sent_at).then(a.id.cmp(&b.id)));
        Ok(fresh)
    }

    /// Page through the registry log from `from`, storing messages not held
    /// locally. Stops early once a page reaches `until`. Returns the newly
    /// stored messages and the position after the last message read.
    async fn pull_range(
        &self,
        channel_id: ChannelId,
        from: SyncCursor,
        until: Option<DateTime<Utc>>,
    ) -> Result<(Vec<Message>, SyncCursor), NodeError> {
        let mut cursor = from;
        let mut fresh = Vec::new();

        for _ in 0..MAX_PULL_PAGES {
            let page = self
                .upstream
                .messages_since(channel_id, cursor.sent_at, cursor.id, SYNC_PAGE_SIZE)
                .await?;
            let full = page.len() >= SYNC_PAGE_SIZE as usize;
            let Some(last) = page.last() else {
                break;
            };
            cursor = SyncCursor::after(last);

            let node_id = self.node_id.clone();
            let inserted = self.store.with(|db| {
                let mut inserted = Vec::new();
                for message in page {
                    if db.insert_message(&message)? {
                        db.record_message_location(message.id, &node_id)?;
                        inserted.push(message);
                    }
                }
                Ok(inserted)
            })?;
            fresh.extend(inserted);

            if !full || until.is_some_and(|u| cursor.sent_at >= u) {
                break;
            }
        }
        Ok((fresh, cursor))
    }

    fn advance_cursor(&self, channel_id: ChannelId, to: SyncCursor) {
        let mut cursors = self.lock_cursors();
        let entry = cursors.entry(channel_id).or_insert(to);
        if entry.is_behind(&to) {
            *entry = to;
        }
    }

    /// Local messages newer than `since` after topping up from the
    /// registry. Falls back to the local cache if the registry is down.
    async fn channel_messages_since(
        &self,
        channel_id: ChannelId,
        since: DateTime<Utc>,
    ) -> Result<Vec<Message>, NodeError> {
        if let Err(e) = self.pull_range(channel_id, SyncCursor::at(since), None).await {
            warn!(channel = %channel_id, error = %e, "Registry pull failed, serving local messages");
        }
        self.store
            .with(|db| db.messages_since(channel_id, since, None, SYNC_PAGE_SIZE))
    }

    // ------------------------------------------------------------------
    // Channels & presence
    // ------------------------------------------------------------------

    /// Channel metadata from the local cache, fetched from the registry on
    /// a miss.
    async fn resolve_channel(&self, channel_id: ChannelId) -> Result<Channel, NodeError> {
        if let Some(channel) = self.store.with(|db| db.get_channel(channel_id))? {
            return Ok(channel);
        }
        let channel = self
            .upstream
            .get_channel(channel_id)
            .await?
            .ok_or(NodeError::ChannelNotFound(channel_id))?;
        self.cache_channel(&channel)?;
        Ok(channel)
    }

    async fn user_channels(&self, user_id: &UserId) -> Vec<Channel> {
        match self.upstream.channels_for_user(user_id).await {
            Ok(channels) => {
                for channel in &channels {
                    if let Err(e) = self.cache_channel(channel) {
                        warn!(channel = %channel.id, error = %e, "Failed to cache channel");
                    }
                }
                channels
            }
            Err(e) => {
                warn!(user = %user_id, error = %e, "Registry unavailable, using cached channels");
                self.store
                    .with(|db| db.channels_for_user(user_id))
                    .unwrap_or_default()
            }
        }
    }

    fn cache_channel(&self, channel: &Channel) -> Result<(), NodeError> {
        let node_id = self.node_id.clone();
        self.store.with(|db| {
            db.upsert_channel(channel)?;
            db.record_channel_node(channel.id, &node_id)
        })
    }

    async fn announce_presence(
        &self,
        user_id: &UserId,
        presence: Presence,
        channels: &[ChannelId],
        except: Option<ConnectionId>,
    ) {
        for channel_id in channels {
            let event = ServerEvent::UserStatusChanged {
                user_id: user_id.clone(),
                channel_id: *channel_id,
                presence,
            };
            self.groups.broadcast(*channel_id, &event, except).await;
        }

        self.record_presence(user_id, presence).await;
    }

    /// Store presence locally and report it to the registry, without
    /// telling any channel.
    async fn record_presence(&self, user_id: &UserId, presence: Presence) {
        let node_id = (presence == Presence::Online).then(|| self.node_id.clone());
        let now = utc_now_millis();
        if let Err(e) = self
            .store
            .with(|db| db.set_user_presence(user_id, presence, node_id.as_ref(), now))
        {
            warn!(user = %user_id, error = %e, "Failed to record presence locally");
        }

        let update = UserStatusUpdate { presence, node_id };
        if let Err(e) = self.upstream.set_user_status(user_id, &update).await {
            warn!(user = %user_id, error = %e, "Failed to report presence to registry");
        }
    }

    fn lock_cursors(&self) -> std::sync::MutexGuard<'_, HashMap<ChannelId, SyncCursor>> {
        self.cursors.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn ensure_access(channel: &Channel, user_id: &UserId) -> Result<(), NodeError> {
    match channel.channel_type {
        ChannelType::Public => Ok(()),
        ChannelType::Private | ChannelType::DirectMessage if channel.has_member(user_id) => Ok(()),
        _ => Err(NodeError::Forbidden(format!(
            "{} is not a member of channel {}",
            user_id, channel.id
        ))),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use async_trait::async_trait;
    use chrono::Duration;

    use hive_shared::models::User;
    use hive_shared::protocol::MessageSyncAck;

    use super::*;

    #[derive(Default)]
    struct FakeState {
        channels: HashMap<ChannelId, Channel>,
        messages: Vec<Message>,
        statuses: Vec<(UserId, Presence)>,
        users: HashMap<UserId, User>,
        synced: Vec<MessageSyncEvent>,
        offline: bool,
    }

    #[derive(Default)]
    struct FakeUpstream {
        state: Mutex<FakeState>,
    }

    impl FakeUpstream {
        fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
            self.state.lock().unwrap()
        }

        fn check(&self) -> Result<(), NodeError> {
            if self.state().offline {
                Err(NodeError::Registry("registry offline".into()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl HubUpstream for FakeUpstream {
        async fn get_channel(&self, id: ChannelId) -> Result<Option<Channel>, NodeError> {
            self.check()?;
            Ok(self.state().channels.get(&id).cloned())
        }

        async fn channels_for_user(&self, user_id: &UserId) -> Result<Vec<Channel>, NodeError> {
            self.check()?;
            let mut channels: Vec<Channel> = self
                .state()
                .channels
                .values()
                .filter(|c| c.has_member(user_id))
                .cloned()
                .collect();
            channels.sort_by_key(|c| c.id);
            Ok(channels)
        }

        async fn set_user_status(
            &self,
            user_id: &UserId,
            update: &UserStatusUpdate,
        ) -> Result<(), NodeError> {
            self.check()?;
            let mut state = self.state();
            state.statuses.push((user_id.clone(), update.presence));
            state.users.insert(
                user_id.clone(),
                User {
                    id: user_id.clone(),
                    display_name: None,
                    presence: update.presence,
                    node_id: update.node_id.clone(),
                    last_seen: utc_now_millis(),
                },
            );
            Ok(())
        }

        async fn get_user(&self, user_id: &UserId) -> Result<Option<User>, NodeError> {
            self.check()?;
            Ok(self.state().users.get(user_id).cloned())
        }

        async fn sync_message(&self, event: &MessageSyncEvent) -> Result<MessageSyncAck, NodeError> {
            self.check()?;
            let mut state = self.state();
            state.synced.push(event.clone());
            state.messages.push(event.message.clone());
            Ok(MessageSyncAck { inserted: true })
        }

        async fn messages_since(
            &self,
            channel_id: ChannelId,
            since: DateTime<Utc>,
            after: Option<MessageId>,
            limit: u32,
        ) -> Result<Vec<Message>, NodeError> {
            self.check()?;
            let mut messages: Vec<Message> = self
                .state()
                .messages
                .iter()
                .filter(|m| m.channel_id == channel_id)
                .filter(|m| {
                    m.sent_at > since || (m.sent_at == since && after.is_some_and(|a| m.id > a))
                })
                .cloned()
                .collect();
            messages.sort_by(|a, b| a.sent_at.cmp(&b.sent_at).then(a.id.cmp(&b.id)));
            messages.truncate(limit as usize);
            Ok(messages)
        }
    }

    fn channel(kind: ChannelType, members: &[&str]) -> Channel {
        Channel {
            id: ChannelId::new(),
            name: "general".into(),
            channel_type: kind,
            member_ids: members.iter().map(|m| UserId::from(*m)).collect::<BTreeSet<_>>(),
            created_at: utc_now_millis(),
        }
    }

    fn message(channel_id: ChannelId, sender: &str, sent_at: DateTime<Utc>) -> Message {
        Message {
            id: MessageId::new(),
            channel_id,
            sender_id: UserId::from(sender),
            content: "hi".into(),
            sent_at,
            attachments: Vec::new(),
        }
    }

    fn hub_with(channels: Vec<Channel>) -> (Hub, Arc<FakeUpstream>) {
        let upstream = Arc::new(FakeUpstream::default());
        for c in channels {
            upstream.state().channels.insert(c.id, c);
        }
        let hub = Hub::new(
            NodeId::from("node-1"),
            LocalStore::in_memory().unwrap(),
            ConnectionRegistry::new(),
            upstream.clone(),
        )
        .with_redirect_grace(std::time::Duration::from_millis(20));
        (hub, upstream)
    }

    fn drain(rx: &mut mpsc::Receiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(e) = rx.try_recv() {
            events.push(e);
        }
        events
    }

    fn offline_count(events: &[ServerEvent]) -> usize {
        events
            .iter()
            .filter(|e| {
                matches!(
                    e,
                    ServerEvent::UserStatusChanged {
                        presence: Presence::Offline,
                        ..
                    }
                )
            })
            .count()
    }

    #[tokio::test]
    async fn test_offline_only_after_last_connection() {
        let room = channel(ChannelType::Public, &["alice", "bob"]);
        let (hub, upstream) = hub_with(vec![room.clone()]);
        let alice = UserId::from("alice");
        let bob = UserId::from("bob");

        let (bob_tx, mut bob_rx) = mpsc::channel(32);
        let _bob_conn = hub.connect(bob.clone(), false, bob_tx).await;

        let (a1_tx, _a1_rx) = mpsc::channel(32);
        let (a2_tx, _a2_rx) = mpsc::channel(32);
        let a1 = hub.connect(alice.clone(), false, a1_tx).await;
        let a2 = hub.connect(alice.clone(), false, a2_tx).await;
        drain(&mut bob_rx);

        assert!(!hub.disconnect(a1, &alice).await);
        assert!(hub.is_online(&alice));
        assert_eq!(offline_count(&drain(&mut bob_rx)), 0);

        assert!(hub.disconnect(a2, &alice).await);
        assert!(!hub.is_online(&alice));
        assert_eq!(offline_count(&drain(&mut bob_rx)), 1);

        let statuses = upstream.state().statuses.clone();
        let alice_updates: Vec<Presence> = statuses
            .into_iter()
            .filter(|(u, _)| *u == alice)
            .map(|(_, p)| p)
            .collect();
        assert_eq!(alice_updates, vec![Presence::Online, Presence::Offline]);
    }

    #[tokio::test]
    async fn test_failover_connect_is_silent_to_peers() {
        let room = channel(ChannelType::Public, &["alice", "bob"]);
        let (hub, upstream) = hub_with(vec![room]);

        let (bob_tx, mut bob_rx) = mpsc::channel(32);
        hub.connect(UserId::from("bob"), false, bob_tx).await;
        drain(&mut bob_rx);
        upstream.state().statuses.clear();

        let (tx, _rx) = mpsc::channel(32);
        hub.connect(UserId::from("alice"), true, tx).await;

        assert!(drain(&mut bob_rx).is_empty());
        // the registry still learns where alice is now attached
        let alice = upstream.state().users.get(&UserId::from("alice")).cloned().unwrap();
        assert_eq!(alice.presence, Presence::Online);
        assert_eq!(alice.node_id, Some(NodeId::from("node-1")));
    }

    #[tokio::test]
    async fn test_send_message_persists_broadcasts_and_forwards() {
        let room = channel(ChannelType::Public, &["alice", "bob"]);
        let (hub, upstream) = hub_with(vec![room.clone()]);
        let alice = UserId::from("alice");

        let (a_tx, mut a_rx) = mpsc::channel(32);
        let (b_tx, mut b_rx) = mpsc::channel(32);
        let a = hub.connect(alice.clone(), false, a_tx).await;
        hub.connect(UserId::from("bob"), false, b_tx).await;
        drain(&mut a_rx);
        drain(&mut b_rx);

        let frame = ClientRequest::SendMessage {
            channel_id: room.id,
            content: "hello".into(),
            attachments: Vec::new(),
        }
        .to_json()
        .unwrap();
        assert!(hub.dispatch(a, &alice, &frame).await.is_empty());

        for rx in [&mut a_rx, &mut b_rx] {
            let events = drain(rx);
            assert!(matches!(
                events.as_slice(),
                [ServerEvent::ReceiveMessage { message }] if message.content == "hello"
            ));
        }

        let synced = upstream.state().synced.clone();
        assert_eq!(synced.len(), 1);
        assert_eq!(synced[0].origin_node_id, NodeId::from("node-1"));

        let stored = hub
            .store
            .with(|db| db.get_message(synced[0].message.id))
            .unwrap();
        assert!(stored.is_some());
    }

    #[tokio::test]
    async fn test_registry_failure_does_not_fail_send() {
        let room = channel(ChannelType::Public, &["alice"]);
        let (hub, upstream) = hub_with(vec![room.clone()]);
        let alice = UserId::from("alice");
        let (tx, mut rx) = mpsc::channel(32);
        let conn = hub.connect(alice.clone(), false, tx).await;
        drain(&mut rx);

        upstream.state().offline = true;
        let events = hub
            .handle(
                conn,
                &alice,
                ClientRequest::SendMessage {
                    channel_id: room.id,
                    content: "still works".into(),
                    attachments: Vec::new(),
                },
            )
            .await
            .unwrap();
        assert!(events.is_empty());
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[tokio::test]
    async fn test_private_channel_requires_membership() {
        let secret = channel(ChannelType::Private, &["alice"]);
        let (hub, _upstream) = hub_with(vec![secret.clone()]);
        let mallory = UserId::from("mallory");
        let (tx, _rx) = mpsc::channel(32);
        let conn = hub.connect(mallory.clone(), false, tx).await;

        let frame = ClientRequest::JoinChannel {
            channel_id: secret.id,
        }
        .to_json()
        .unwrap();
        let events = hub.dispatch(conn, &mallory, &frame).await;
        assert!(matches!(
            events.as_slice(),
            [ServerEvent::ConnectionError { operation, .. }] if operation == "JoinChannel"
        ));
    }

    #[tokio::test]
    async fn test_unknown_channel_and_bad_frame_report_errors() {
        let (hub, _upstream) = hub_with(Vec::new());
        let alice = UserId::from("alice");
        let (tx, _rx) = mpsc::channel(32);
        let conn = hub.connect(alice.clone(), false, tx).await;

        let result = hub
            .handle(
                conn,
                &alice,
                ClientRequest::JoinChannel {
                    channel_id: ChannelId::new(),
                },
            )
            .await;
        assert!(matches!(result, Err(NodeError::ChannelNotFound(_))));

        let events = hub.dispatch(conn, &alice, "not json").await;
        assert!(matches!(events.as_slice(), [ServerEvent::ConnectionError { .. }]));
    }

    #[tokio::test]
    async fn test_migration_resync_returns_gap_then_completion() {
        let room = channel(ChannelType::Public, &["alice"]);
        let (hub, upstream) = hub_with(vec![room.clone()]);
        let cutoff = utc_now_millis() - Duration::minutes(10);
        {
            let mut state = upstream.state();
            state.messages.push(message(room.id, "bob", cutoff - Duration::minutes(1)));
            state.messages.push(message(room.id, "bob", cutoff + Duration::minutes(1)));
            state.messages.push(message(room.id, "bob", cutoff + Duration::minutes(2)));
        }

        let alice = UserId::from("alice");
        let (tx, _rx) = mpsc::channel(32);
        let conn = hub.connect(alice.clone(), true, tx).await;

        let events = hub
            .handle(
                conn,
                &alice,
                ClientRequest::SyncAfterNodeMigration {
                    last_message_at: cutoff,
                },
            )
            .await
            .unwrap();

        match events.as_slice() {
            [ServerEvent::StateSyncData { messages, .. }, ServerEvent::ReconnectionComplete { node_id, channels }] =>
            {
                assert_eq!(messages.len(), 2);
                assert!(messages[0].sent_at < messages[1].sent_at);
                assert_eq!(node_id, &NodeId::from("node-1"));
                assert_eq!(channels, &vec![room.id]);
            }
            other => panic!("unexpected events: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_sync_channel_messages_dedupes() {
        let room = channel(ChannelType::Public, &["alice"]);
        let (hub, upstream) = hub_with(vec![room.clone()]);
        let since = utc_now_millis() - Duration::minutes(5);
        let remote = message(room.id, "bob", since + Duration::minutes(1));
        upstream.state().messages.push(remote.clone());
        hub.store.with(|db| db.insert_message(&remote).map(|_| ())).unwrap();

        let alice = UserId::from("alice");
        let (tx, _rx) = mpsc::channel(32);
        let conn = hub.connect(alice.clone(), false, tx).await;
        let events = hub
            .handle(
                conn,
                &alice,
                ClientRequest::SyncChannelMessages {
                    channel_id: room.id,
                    since,
                },
            )
            .await
            .unwrap();

        match events.as_slice() {
            [ServerEvent::StateSyncData { messages, .. }] => {
                assert_eq!(messages, &vec![remote]);
            }
            other => panic!("unexpected events: {other:?}"),
        }
    }

    async fn redirect(hub: &Hub, conn: ConnectionId, user: &UserId) {
        let events = hub
            .handle(
                conn,
                user,
                ClientRequest::NotifyRedirecting {
                    new_node_id: Some(NodeId::from("node-2")),
                    reason: hive_shared::protocol::ReassignReason::NodeFailure,
                },
            )
            .await
            .unwrap();
        assert_eq!(
            events,
            vec![ServerEvent::RedirectAcknowledged {
                node_id: NodeId::from("node-1")
            }]
        );
        assert!(hub.groups().memberships(conn).await.is_empty());
    }

    #[tokio::test]
    async fn test_redirect_suppresses_offline_when_user_moved() {
        let room = channel(ChannelType::Public, &["alice", "bob"]);
        let (hub, upstream) = hub_with(vec![room]);
        let alice = UserId::from("alice");

        let (bob_tx, mut bob_rx) = mpsc::channel(32);
        hub.connect(UserId::from("bob"), false, bob_tx).await;
        let (tx, _rx) = mpsc::channel(32);
        let conn = hub.connect(alice.clone(), false, tx).await;
        drain(&mut bob_rx);

        redirect(&hub, conn, &alice).await;
        // the failover connect on the other node reports in
        upstream
            .set_user_status(
                &alice,
                &UserStatusUpdate {
                    presence: Presence::Online,
                    node_id: Some(NodeId::from("node-2")),
                },
            )
            .await
            .unwrap();

        assert!(!hub.disconnect(conn, &alice).await);
        assert_eq!(offline_count(&drain(&mut bob_rx)), 0);
        let user = upstream.state().users.get(&alice).cloned().unwrap();
        assert_eq!(user.node_id, Some(NodeId::from("node-2")));
    }

    #[tokio::test]
    async fn test_redirect_without_reconnect_goes_offline() {
        let room = channel(ChannelType::Public, &["alice", "bob"]);
        let (hub, upstream) = hub_with(vec![room]);
        let alice = UserId::from("alice");

        let (bob_tx, mut bob_rx) = mpsc::channel(32);
        hub.connect(UserId::from("bob"), false, bob_tx).await;
        let (tx, _rx) = mpsc::channel(32);
        let conn = hub.connect(alice.clone(), false, tx).await;
        drain(&mut bob_rx);

        redirect(&hub, conn, &alice).await;

        assert!(hub.disconnect(conn, &alice).await);
        assert_eq!(offline_count(&drain(&mut bob_rx)), 1);
        let user = upstream.state().users.get(&alice).cloned().unwrap();
        assert_eq!(user.presence, Presence::Offline);
    }

    #[tokio::test]
    async fn test_typing_skips_sender() {
        let room = channel(ChannelType::Public, &["alice", "bob"]);
        let (hub, _upstream) = hub_with(vec![room.clone()]);
        let alice = UserId::from("alice");
        let (a_tx, mut a_rx) = mpsc::channel(32);
        let (b_tx, mut b_rx) = mpsc::channel(32);
        let a = hub.connect(alice.clone(), false, a_tx).await;
        hub.connect(UserId::from("bob"), false, b_tx).await;
        drain(&mut a_rx);
        drain(&mut b_rx);

        hub.handle(
            a,
            &alice,
            ClientRequest::SendTypingNotification {
                channel_id: room.id,
                is_typing: true,
            },
        )
        .await
        .unwrap();

        assert!(drain(&mut a_rx).is_empty());
        assert!(matches!(
            drain(&mut b_rx).as_slice(),
            [ServerEvent::UserTyping { is_typing: true, .. }]
        ));
    }

    #[tokio::test]
    async fn test_pull_sync_delivers_unseen_once() {
        let room = channel(ChannelType::Public, &["alice"]);
        let (hub, upstream) = hub_with(vec![room.clone()]);
        let (tx, mut rx) = mpsc::channel(32);
        hub.connect(UserId::from("alice"), false, tx).await;
        drain(&mut rx);

        // seed the cursor before remote traffic arrives
        hub.advance_cursor(room.id, SyncCursor::at(utc_now_millis() - Duration::minutes(1)));
        upstream
            .state()
            .messages
            .push(message(room.id, "bob", utc_now_millis()));

        assert_eq!(hub.sync_served_channels().await, 1);
        assert_eq!(drain(&mut rx).len(), 1);

        assert_eq!(hub.sync_served_channels().await, 0);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_message_sent_during_outage_is_forwarded_later() {
        let room = channel(ChannelType::Public, &["alice"]);
        let (hub, upstream) = hub_with(vec![room.clone()]);
        let alice = UserId::from("alice");
        let (tx, mut rx) = mpsc::channel(32);
        let conn = hub.connect(alice.clone(), false, tx).await;
        drain(&mut rx);

        upstream.state().offline = true;
        hub.handle(
            conn,
            &alice,
            ClientRequest::SendMessage {
                channel_id: room.id,
                content: "during outage".into(),
                attachments: Vec::new(),
            },
        )
        .await
        .unwrap();
        assert!(upstream.state().synced.is_empty());

        // still down: the message stays queued
        hub.sync_served_channels().await;
        assert!(upstream.state().synced.is_empty());

        upstream.state().offline = false;
        hub.sync_served_channels().await;
        let synced = upstream.state().synced.clone();
        assert_eq!(synced.len(), 1);
        assert_eq!(synced[0].message.content, "during outage");

        // acknowledged messages are not sent again
        hub.sync_served_channels().await;
        assert_eq!(upstream.state().synced.len(), 1);
        assert!(hub.store.with(|db| db.pending_messages(10)).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pull_picks_up_late_arrival_behind_cursor() {
        let room = channel(ChannelType::Public, &["alice"]);
        let (hub, upstream) = hub_with(vec![room.clone()]);
        let (tx, mut rx) = mpsc::channel(32);
        hub.connect(UserId::from("alice"), false, tx).await;
        drain(&mut rx);

        let t = utc_now_millis() - Duration::minutes(1);
        hub.advance_cursor(room.id, SyncCursor::at(t));
        upstream
            .state()
            .messages
            .push(message(room.id, "bob", t + Duration::seconds(2)));
        assert_eq!(hub.sync_served_channels().await, 1);
        drain(&mut rx);

        // older timestamp, reaches the registry after the newer one
        let late = message(room.id, "carol", t + Duration::seconds(1));
        upstream.state().messages.push(late.clone());

        assert_eq!(hub.sync_served_channels().await, 1);
        assert!(matches!(
            drain(&mut rx).as_slice(),
            [ServerEvent::ReceiveMessage { message }] if message.id == late.id
        ));
        assert!(hub.store.with(|db| db.has_message(late.id)).unwrap());

        assert_eq!(hub.sync_served_channels().await, 0);
    }

    #[tokio::test]
    async fn test_pull_pages_through_messages_sharing_a_timestamp() {
        let room = channel(ChannelType::Public, &["alice"]);
        let (hub, upstream) = hub_with(vec![room.clone()]);
        let (tx, mut rx) = mpsc::channel(512);
        hub.connect(UserId::from("alice"), false, tx).await;
        drain(&mut rx);

        let t = utc_now_millis() - Duration::minutes(1);
        hub.advance_cursor(room.id, SyncCursor::at(t - Duration::seconds(1)));
        {
            let mut state = upstream.state();
            for _ in 0..(SYNC_PAGE_SIZE as usize + 50) {
                state.messages.push(message(room.id, "bob", t));
            }
        }

        assert_eq!(hub.sync_served_channels().await, SYNC_PAGE_SIZE as usize + 50);
        assert_eq!(drain(&mut rx).len(), SYNC_PAGE_SIZE as usize + 50);
    }

    #[test]
    fn test_cursor_ordering() {
        let t = utc_now_millis();
        let (a, b) = {
            let (x, y) = (MessageId::new(), MessageId::new());
            if x < y { (x, y) } else { (y, x) }
        };
        let at_a = SyncCursor { sent_at: t, id: Some(a) };
        let at_b = SyncCursor { sent_at: t, id: Some(b) };

        assert!(at_a.is_behind(&at_b));
        assert!(!at_b.is_behind(&at_a));
        assert!(at_b.is_behind(&SyncCursor::at(t)));
        assert!(!SyncCursor::at(t).is_behind(&at_b));
        assert!(SyncCursor::at(t).is_behind(&SyncCursor::at(t + Duration::milliseconds(1))));
    }
}
