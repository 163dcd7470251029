//! Live connection registry.
//!
//! Tracks every authenticated connection, the users behind them and the
//! channel rooms they subscribe to. Fan-out never blocks: each connection
//! owns a bounded outbound queue, and a connection whose queue is full is
//! asked to disconnect through its overflow signal.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Notify, RwLock};
use tracing::{debug, info, warn};

use murmur_shared::protocol::ServerEvent;
use murmur_shared::types::{ChannelId, UserId};

use crate::auth::Identity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Who to leave out of a broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Skip {
    Nobody,
    Connection(ConnectionId),
    /// Every connection of this user.
    User(UserId),
}

impl Skip {
    fn excludes(&self, id: ConnectionId, user: UserId) -> bool {
        match self {
            Skip::Nobody => false,
            Skip::Connection(c) => *c == id,
            Skip::User(u) => *u == user,
        }
    }
}

/// Handed to the transport when a connection registers.
pub struct Registration {
    pub id: ConnectionId,
    pub outbound: mpsc::Receiver<ServerEvent>,
    /// Fires when the outbound queue overflowed and the connection must close.
    pub overflow: Arc<Notify>,
    /// `true` when no other connection of this user was live.
    pub first_for_user: bool,
}

/// What was torn down when a connection left.
#[derive(Debug)]
pub struct Unregistered {
    pub identity: Identity,
    pub rooms: Vec<ChannelId>,
    /// `true` when this was the user's last live connection.
    pub last_for_user: bool,
}

struct Connection {
    identity: Identity,
    tx: mpsc::Sender<ServerEvent>,
    overflow: Arc<Notify>,
    rooms: HashSet<ChannelId>,
}

impl Connection {
    fn deliver(&self, id: ConnectionId, event: ServerEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                warn!(
                    conn = %id,
                    user = %self.identity.user_id,
                    event = event.name(),
                    "Outbound queue full, disconnecting slow consumer"
                );
                self.overflow.notify_one();
            }
            Err(TrySendError::Closed(_)) => {
                debug!(conn = %id, "Dropping event for closed connection");
            }
        }
    }
}

#[derive(Default)]
struct RegistryState {
    connections: HashMap<ConnectionId, Connection>,
    by_user: HashMap<UserId, HashSet<ConnectionId>>,
    rooms: HashMap<ChannelId, HashSet<ConnectionId>>,
}

#[derive(Clone)]
pub struct ConnectionRegistry {
    state: Arc<RwLock<RegistryState>>,
    next_id: Arc<AtomicU64>,
    queue_capacity: usize,
}

impl ConnectionRegistry {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            state: Arc::new(RwLock::new(RegistryState::default())),
            next_id: Arc::new(AtomicU64::new(1)),
            queue_capacity: queue_capacity.max(1),
        }
    }

    pub async fn register(&self, identity: Identity) -> Registration {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, outbound) = mpsc::channel(self.queue_capacity);
        let overflow = Arc::new(Notify::new());

        let mut state = self.state.write().await;
        let user_id = identity.user_id;
        let sessions = state.by_user.entry(user_id).or_default();
        let first_for_user = sessions.is_empty();
        sessions.insert(id);
        let sessions = sessions.len();

        state.connections.insert(
            id,
            Connection {
                identity,
                tx,
                overflow: overflow.clone(),
                rooms: HashSet::new(),
            },
        );

        info!(conn = %id, user = %user_id, sessions, "Connection registered");

        Registration {
            id,
            outbound,
            overflow,
            first_for_user,
        }
    }

    /// Remove a connection from every room and from its user's group.
    /// Returns `None` when the connection was already gone.
    pub async fn unregister(&self, id: ConnectionId) -> Option<Unregistered> {
        let mut state = self.state.write().await;
        let connection = state.connections.remove(&id)?;

        for channel in &connection.rooms {
            let now_empty = match state.rooms.get_mut(channel) {
                Some(members) => {
                    members.remove(&id);
                    members.is_empty()
                }
                None => false,
            };
            if now_empty {
                state.rooms.remove(channel);
            }
        }

        let user_id = connection.identity.user_id;
        let last_for_user = match state.by_user.get_mut(&user_id) {
            Some(sessions) => {
                sessions.remove(&id);
                sessions.is_empty()
            }
            None => true,
        };
        if last_for_user {
            state.by_user.remove(&user_id);
        }

        info!(conn = %id, user = %user_id, last_for_user, "Connection unregistered");

        Some(Unregistered {
            identity: connection.identity,
            rooms: connection.rooms.into_iter().collect(),
            last_for_user,
        })
    }

    /// Subscribe a connection to a channel room. Returns `true` when newly joined.
    pub async fn join_room(&self, id: ConnectionId, channel: ChannelId) -> bool {
        let mut state = self.state.write().await;
        let Some(connection) = state.connections.get_mut(&id) else {
            return false;
        };
        if !connection.rooms.insert(channel) {
            return false;
        }
        state.rooms.entry(channel).or_default().insert(id);
        debug!(conn = %id, channel = %channel, "Joined room");
        true
    }

    /// Returns `true` when the connection was subscribed.
    pub async fn leave_room(&self, id: ConnectionId, channel: ChannelId) -> bool {
        let mut state = self.state.write().await;
        let Some(connection) = state.connections.get_mut(&id) else {
            return false;
        };
        if !connection.rooms.remove(&channel) {
            return false;
        }
        let now_empty = match state.rooms.get_mut(&channel) {
            Some(members) => {
                members.remove(&id);
                members.is_empty()
            }
            None => false,
        };
        if now_empty {
            state.rooms.remove(&channel);
        }
        debug!(conn = %id, channel = %channel, "Left room");
        true
    }

    pub async fn identity_of(&self, id: ConnectionId) -> Option<Identity> {
        let state = self.state.read().await;
        state.connections.get(&id).map(|c| c.identity.clone())
    }

    pub async fn is_online(&self, user_id: UserId) -> bool {
        let state = self.state.read().await;
        state
            .by_user
            .get(&user_id)
            .is_some_and(|sessions| !sessions.is_empty())
    }

    #[cfg(test)]
    pub async fn room_members(&self, channel: ChannelId) -> Vec<ConnectionId> {
        let state = self.state.read().await;
        let mut members: Vec<ConnectionId> = state
            .rooms
            .get(&channel)
            .map(|m| m.iter().copied().collect())
            .unwrap_or_default();
        members.sort();
        members
    }

    pub async fn connection_count(&self) -> usize {
        self.state.read().await.connections.len()
    }

    pub async fn send_to(&self, id: ConnectionId, event: ServerEvent) {
        let state = self.state.read().await;
        if let Some(connection) = state.connections.get(&id) {
            connection.deliver(id, event);
        }
    }

    /// Deliver to every connection of one user.
    pub async fn send_to_user(&self, user_id: UserId, event: ServerEvent) {
        let state = self.state.read().await;
        let Some(sessions) = state.by_user.get(&user_id) else {
            return;
        };
        for id in sessions {
            if let Some(connection) = state.connections.get(id) {
                connection.deliver(*id, event.clone());
            }
        }
    }

    /// Deliver to every subscriber of a room. Returns the number of recipients.
    pub async fn broadcast_room(&self, channel: ChannelId, event: ServerEvent, skip: Skip) -> usize {
        let state = self.state.read().await;
        let Some(members) = state.rooms.get(&channel) else {
            return 0;
        };

        let mut delivered = 0;
        for id in members {
            let Some(connection) = state.connections.get(id) else {
                continue;
            };
            if skip.excludes(*id, connection.identity.user_id) {
                continue;
            }
            connection.deliver(*id, event.clone());
            delivered += 1;
        }
        delivered
    }

    /// Deliver to every live connection process-wide.
    pub async fn broadcast_all(&self, event: ServerEvent, skip: Skip) -> usize {
        let state = self.state.read().await;
        let mut delivered = 0;
        for (id, connection) in &state.connections {
            if skip.excludes(*id, connection.identity.user_id) {
                continue;
            }
            connection.deliver(*id, event.clone());
            delivered += 1;
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use murmur_shared::protocol::{ErrorKind, ServerEvent};

    fn identity(name: &str) -> Identity {
        Identity {
            user_id: UserId::new(),
            display_name: name.to_string(),
        }
    }

    fn ping() -> ServerEvent {
        ServerEvent::error(ErrorKind::NotFound, "ping")
    }

    #[tokio::test]
    async fn test_register_and_unregister_tracks_user_sessions() {
        let registry = ConnectionRegistry::new(8);
        let alice = identity("alice");

        let first = registry.register(alice.clone()).await;
        let second = registry.register(alice.clone()).await;
        assert!(first.first_for_user);
        assert!(!second.first_for_user);
        assert!(registry.is_online(alice.user_id).await);

        let gone = registry.unregister(first.id).await.unwrap();
        assert!(!gone.last_for_user);
        assert!(registry.is_online(alice.user_id).await);

        let gone = registry.unregister(second.id).await.unwrap();
        assert!(gone.last_for_user);
        assert!(!registry.is_online(alice.user_id).await);
        assert!(registry.unregister(second.id).await.is_none());
    }

    #[tokio::test]
    async fn test_unregister_leaves_all_rooms() {
        let registry = ConnectionRegistry::new(8);
        let conn = registry.register(identity("alice")).await;
        let general = ChannelId::new();
        let random = ChannelId::new();

        assert!(registry.join_room(conn.id, general).await);
        assert!(!registry.join_room(conn.id, general).await);
        registry.join_room(conn.id, random).await;

        let gone = registry.unregister(conn.id).await.unwrap();
        assert_eq!(gone.rooms.len(), 2);
        assert!(registry.room_members(general).await.is_empty());
        assert!(registry.room_members(random).await.is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_room_skips() {
        let registry = ConnectionRegistry::new(8);
        let alice = identity("alice");
        let mut a1 = registry.register(alice.clone()).await;
        let mut a2 = registry.register(alice.clone()).await;
        let mut bob = registry.register(identity("bob")).await;
        let channel = ChannelId::new();
        for id in [a1.id, a2.id, bob.id] {
            registry.join_room(id, channel).await;
        }

        assert_eq!(registry.broadcast_room(channel, ping(), Skip::Nobody).await, 3);
        assert_eq!(
            registry.broadcast_room(channel, ping(), Skip::Connection(a1.id)).await,
            2
        );
        assert_eq!(
            registry.broadcast_room(channel, ping(), Skip::User(alice.user_id)).await,
            1
        );

        let drain = |rx: &mut mpsc::Receiver<ServerEvent>| {
            let mut n = 0;
            while rx.try_recv().is_ok() {
                n += 1;
            }
            n
        };
        assert_eq!(drain(&mut a1.outbound), 1);
        assert_eq!(drain(&mut a2.outbound), 2);
        assert_eq!(drain(&mut bob.outbound), 3);
    }

    #[tokio::test]
    async fn test_send_to_user_reaches_every_session() {
        let registry = ConnectionRegistry::new(8);
        let alice = identity("alice");
        let mut a1 = registry.register(alice.clone()).await;
        let mut a2 = registry.register(alice.clone()).await;
        let mut bob = registry.register(identity("bob")).await;

        registry.send_to_user(alice.user_id, ping()).await;

        assert!(a1.outbound.try_recv().is_ok());
        assert!(a2.outbound.try_recv().is_ok());
        assert!(bob.outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_full_queue_signals_overflow() {
        let registry = ConnectionRegistry::new(1);
        let conn = registry.register(identity("alice")).await;

        registry.send_to(conn.id, ping()).await;
        registry.send_to(conn.id, ping()).await;

        // the permit stored by notify_one resolves immediately
        tokio::time::timeout(std::time::Duration::from_secs(1), conn.overflow.notified())
            .await
            .expect("overflow should be signalled");
    }

    #[tokio::test]
    async fn test_closed_receiver_is_ignored() {
        let registry = ConnectionRegistry::new(4);
        let conn = registry.register(identity("alice")).await;
        drop(conn.outbound);

        registry.send_to(conn.id, ping()).await;
        assert_eq!(registry.connection_count().await, 1);
    }
}
