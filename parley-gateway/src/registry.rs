//! Process-local connection registry.
//!
//! Tracks the connections attached to this process only: which user owns
//! each, which rooms it joined, when it was last active, and the outbound
//! queue that feeds its socket writer. Cluster-wide facts live in the
//! presence store; this registry is what the bus handlers consult to turn
//! a topic message into socket writes.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;

use crate::model::{ChatId, ConnectionId, UserId};
use crate::protocol::{CloseReason, ServerEvent};

/// How long a deferred close frame waits for room in a full queue.
pub const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// What the socket writer of a connection receives.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Event(ServerEvent),
    Close(CloseReason),
}

struct ConnectionEntry {
    user_id: UserId,
    rooms: HashSet<ChatId>,
    last_activity: Instant,
    outbound: mpsc::Sender<Outbound>,
}

#[derive(Default)]
struct RegistryInner {
    connections: HashMap<ConnectionId, ConnectionEntry>,
    by_user: HashMap<UserId, HashSet<ConnectionId>>,
    by_room: HashMap<ChatId, HashSet<ConnectionId>>,
}

impl RegistryInner {
    fn detach_room(&mut self, room: &ChatId, conn: &ConnectionId) {
        if let Some(members) = self.by_room.get_mut(room) {
            members.remove(conn);
            if members.is_empty() {
                self.by_room.remove(room);
            }
        }
    }
}

/// A connection as it was when it left the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovedConnection {
    pub user_id: UserId,
    pub rooms: HashSet<ChatId>,
}

/// Point-in-time view of one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSnapshot {
    pub connection_id: ConnectionId,
    pub user_id: UserId,
    pub rooms: HashSet<ChatId>,
}

/// Shared handle; clones see the same state.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<RwLock<RegistryInner>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, conn: ConnectionId, user: UserId, outbound: mpsc::Sender<Outbound>) {
        let mut inner = self.inner.write().await;
        inner.by_user.entry(user.clone()).or_default().insert(conn);
        inner.connections.insert(
            conn,
            ConnectionEntry {
                user_id: user,
                rooms: HashSet::new(),
                last_activity: Instant::now(),
                outbound,
            },
        );
    }

    /// Remove a connection. Returns `None` if it was already gone, which
    /// makes repeated cleanup a no-op.
    pub async fn unregister(&self, conn: ConnectionId) -> Option<RemovedConnection> {
        let mut inner = self.inner.write().await;
        let entry = inner.connections.remove(&conn)?;

        if let Some(conns) = inner.by_user.get_mut(&entry.user_id) {
            conns.remove(&conn);
            if conns.is_empty() {
                inner.by_user.remove(&entry.user_id);
            }
        }
        for room in &entry.rooms {
            inner.detach_room(room, &conn);
        }
        Some(RemovedConnection {
            user_id: entry.user_id,
            rooms: entry.rooms,
        })
    }

    pub async fn lookup(&self, conn: ConnectionId) -> Option<UserId> {
        self.inner
            .read()
            .await
            .connections
            .get(&conn)
            .map(|e| e.user_id.clone())
    }

    pub async fn connections_of(&self, user: &UserId) -> Vec<ConnectionId> {
        self.inner
            .read()
            .await
            .by_user
            .get(user)
            .map(|c| c.iter().copied().collect())
            .unwrap_or_default()
    }

    pub async fn has_user(&self, user: &UserId) -> bool {
        self.inner.read().await.by_user.contains_key(user)
    }

    /// Returns `false` for an unknown connection. Joining twice is harmless.
    pub async fn join_room(&self, conn: ConnectionId, room: &ChatId) -> bool {
        let mut inner = self.inner.write().await;
        let Some(entry) = inner.connections.get_mut(&conn) else {
            return false;
        };
        entry.rooms.insert(room.clone());
        inner.by_room.entry(room.clone()).or_default().insert(conn);
        true
    }

    /// Returns whether the connection was in the room.
    pub async fn leave_room(&self, conn: ConnectionId, room: &ChatId) -> bool {
        let mut inner = self.inner.write().await;
        let removed = inner
            .connections
            .get_mut(&conn)
            .is_some_and(|entry| entry.rooms.remove(room));
        if removed {
            inner.detach_room(room, &conn);
        }
        removed
    }

    pub async fn members_of_room(&self, room: &ChatId) -> Vec<ConnectionId> {
        self.inner
            .read()
            .await
            .by_room
            .get(room)
            .map(|c| c.iter().copied().collect())
            .unwrap_or_default()
    }

    pub async fn has_room(&self, room: &ChatId) -> bool {
        self.inner.read().await.by_room.contains_key(room)
    }

    pub async fn rooms_of(&self, conn: ConnectionId) -> HashSet<ChatId> {
        self.inner
            .read()
            .await
            .connections
            .get(&conn)
            .map(|e| e.rooms.clone())
            .unwrap_or_default()
    }

    /// Record inbound activity. Returns `false` for an unknown connection.
    pub async fn touch(&self, conn: ConnectionId) -> bool {
        let mut inner = self.inner.write().await;
        match inner.connections.get_mut(&conn) {
            Some(entry) => {
                entry.last_activity = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Connections with no inbound activity for at least `timeout`.
    pub async fn idle_connections(&self, timeout: Duration) -> Vec<(ConnectionId, UserId)> {
        let now = Instant::now();
        self.inner
            .read()
            .await
            .connections
            .iter()
            .filter(|(_, e)| now.duration_since(e.last_activity) >= timeout)
            .map(|(id, e)| (*id, e.user_id.clone()))
            .collect()
    }

    pub async fn snapshot(&self) -> Vec<ConnectionSnapshot> {
        self.inner
            .read()
            .await
            .connections
            .iter()
            .map(|(id, e)| ConnectionSnapshot {
                connection_id: *id,
                user_id: e.user_id.clone(),
                rooms: e.rooms.clone(),
            })
            .collect()
    }

    /// Queue an event on each listed connection except `exclude`. Never
    /// blocks: a connection whose queue is full loses the frame. Returns how
    /// many connections accepted it.
    pub async fn deliver(&self, conns: &[ConnectionId], event: &ServerEvent, exclude: Option<ConnectionId>) -> usize {
        let inner = self.inner.read().await;
        let mut delivered = 0;
        for conn in conns {
            if Some(*conn) == exclude {
                continue;
            }
            let Some(entry) = inner.connections.get(conn) else {
                continue;
            };
            match entry.outbound.try_send(Outbound::Event(event.clone())) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    log::warn!("Registry: outbound queue full for {conn}, dropping event");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    log::debug!("Registry: outbound queue closed for {conn}");
                }
            }
        }
        delivered
    }

    pub async fn deliver_to_user(&self, user: &UserId, event: &ServerEvent) -> usize {
        let conns = self.connections_of(user).await;
        self.deliver(&conns, event, None).await
    }

    pub async fn deliver_to_room(&self, room: &ChatId, event: &ServerEvent, exclude: Option<ConnectionId>) -> usize {
        let conns = self.members_of_room(room).await;
        self.deliver(&conns, event, exclude).await
    }

    pub async fn broadcast_all(&self, event: &ServerEvent) -> usize {
        let conns: Vec<ConnectionId> = self.inner.read().await.connections.keys().copied().collect();
        self.deliver(&conns, event, None).await
    }

    /// Ask the socket writer to close. Returns `false` if the connection is
    /// unknown or its writer is gone.
    ///
    /// A full queue does not lose the close frame: it is queued behind the
    /// pending events from a background task, which keeps the writer's
    /// queue open until the frame is in or `CLOSE_GRACE` runs out.
    pub async fn signal_close(&self, conn: ConnectionId, reason: CloseReason) -> bool {
        let outbound = {
            let inner = self.inner.read().await;
            match inner.connections.get(&conn) {
                Some(entry) => entry.outbound.clone(),
                None => return false,
            }
        };
        match outbound.try_send(Outbound::Close(reason)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
            Err(mpsc::error::TrySendError::Full(frame)) => {
                log::debug!("Registry: outbound queue full for {conn}, close frame deferred");
                tokio::spawn(async move {
                    if outbound.send_timeout(frame, CLOSE_GRACE).await.is_err() {
                        log::warn!("Registry: close frame for {conn} not accepted within {CLOSE_GRACE:?}");
                    }
                });
                true
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.connections.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
