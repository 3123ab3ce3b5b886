//! In-process presence store.
//!
//! Used by single-process deployments and tests. All state sits behind one
//! `tokio::sync::RwLock`; writers hold the write lock for the whole
//! read-modify-write so connect/disconnect races on the same user serialize.

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap, HashSet};
use tokio::sync::RwLock;
use tokio::time::Instant;

use super::{PresenceConfig, PresenceRecord, PresenceResult, PresenceStatus, PresenceStore};
use crate::model::{now_millis, ChatId, ConnectionId, UserId};

struct ConnectionLease {
    rooms: HashSet<ChatId>,
    expires_at: Instant,
}

impl ConnectionLease {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

struct UserPresence {
    leases: HashMap<ConnectionId, ConnectionLease>,
    away: bool,
    last_seen: u64,
    /// Set when the lease set became empty; drives retention.
    offline_since: Option<Instant>,
}

impl UserPresence {
    fn new() -> Self {
        Self {
            leases: HashMap::new(),
            away: false,
            last_seen: now_millis(),
            offline_since: None,
        }
    }

    fn live_leases(&self, now: Instant) -> impl Iterator<Item = (&ConnectionId, &ConnectionLease)> {
        self.leases.iter().filter(move |(_, lease)| lease.is_live(now))
    }

    fn has_live(&self, now: Instant) -> bool {
        self.live_leases(now).next().is_some()
    }

    /// Drop lapsed leases. Emptying the set this way is a silent flip to
    /// offline: no explicit disconnect was observed.
    fn reap(&mut self, now: Instant) {
        let before = self.leases.len();
        self.leases.retain(|_, lease| lease.is_live(now));
        if before > 0 && self.leases.is_empty() {
            self.went_offline(now);
        }
    }

    fn went_offline(&mut self, now: Instant) {
        self.last_seen = now_millis();
        self.offline_since = Some(now);
    }

    fn is_retained(&self, now: Instant, config: &PresenceConfig) -> bool {
        if self.has_live(now) {
            return true;
        }
        match self.offline_since {
            Some(since) => since + config.offline_retention > now,
            // Every lease lapsed but nothing reaped yet.
            None => self
                .leases
                .values()
                .map(|l| l.expires_at)
                .max()
                .is_some_and(|last| last + config.offline_retention > now),
        }
    }

    fn record(&self, user: &UserId, now: Instant) -> PresenceRecord {
        let connections: BTreeSet<ConnectionId> =
            self.live_leases(now).map(|(id, _)| *id).collect();
        PresenceRecord {
            user_id: user.clone(),
            status: PresenceStatus::derive(!connections.is_empty(), self.away),
            last_seen: self.last_seen,
            connections,
        }
    }
}

/// In-memory [`PresenceStore`].
pub struct MemoryPresenceStore {
    users: RwLock<HashMap<UserId, UserPresence>>,
    config: PresenceConfig,
}

impl MemoryPresenceStore {
    pub fn new(config: PresenceConfig) -> Self {
        Self {
            users: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Number of retained records, online or not.
    pub async fn record_count(&self) -> usize {
        self.users.read().await.len()
    }
}

impl Default for MemoryPresenceStore {
    fn default() -> Self {
        Self::new(PresenceConfig::default())
    }
}

#[async_trait]
impl PresenceStore for MemoryPresenceStore {
    async fn mark_online(&self, user: &UserId, conn: ConnectionId) -> PresenceResult<bool> {
        let now = Instant::now();
        let expires_at = now + self.config.online_ttl;
        let mut users = self.users.write().await;
        let entry = users.entry(user.clone()).or_insert_with(UserPresence::new);
        entry.reap(now);

        let was_online = !entry.leases.is_empty();
        entry
            .leases
            .entry(conn)
            .and_modify(|lease| lease.expires_at = expires_at)
            .or_insert_with(|| ConnectionLease {
                rooms: HashSet::new(),
                expires_at,
            });
        entry.offline_since = None;

        if !was_online {
            entry.away = false;
            entry.last_seen = now_millis();
            log::debug!("Presence: {user} online via {conn}");
        }
        Ok(!was_online)
    }

    async fn mark_offline(&self, user: &UserId, conn: ConnectionId) -> PresenceResult<bool> {
        let now = Instant::now();
        let mut users = self.users.write().await;
        let Some(entry) = users.get_mut(user) else {
            return Ok(false);
        };

        let held = entry.leases.contains_key(&conn);
        entry.leases.remove(&conn);
        entry.reap(now);

        if held && entry.leases.is_empty() {
            entry.went_offline(now);
            log::debug!("Presence: {user} offline (last connection {conn} closed)");
            return Ok(true);
        }
        Ok(false)
    }

    async fn join_room(&self, user: &UserId, conn: ConnectionId, room: &ChatId) -> PresenceResult<()> {
        let now = Instant::now();
        let mut users = self.users.write().await;
        if let Some(entry) = users.get_mut(user) {
            entry.reap(now);
            if let Some(lease) = entry.leases.get_mut(&conn) {
                lease.rooms.insert(room.clone());
            }
        }
        Ok(())
    }

    async fn leave_room(&self, user: &UserId, conn: ConnectionId, room: &ChatId) -> PresenceResult<()> {
        let mut users = self.users.write().await;
        if let Some(lease) = users.get_mut(user).and_then(|e| e.leases.get_mut(&conn)) {
            lease.rooms.remove(room);
        }
        Ok(())
    }

    async fn set_away(&self, user: &UserId, away: bool) -> PresenceResult<PresenceStatus> {
        let now = Instant::now();
        let mut users = self.users.write().await;
        match users.get_mut(user) {
            Some(entry) => {
                entry.reap(now);
                entry.away = away;
                Ok(PresenceStatus::derive(!entry.leases.is_empty(), away))
            }
            None => Ok(PresenceStatus::Offline),
        }
    }

    async fn is_online(&self, user: &UserId) -> PresenceResult<bool> {
        let now = Instant::now();
        let users = self.users.read().await;
        Ok(users.get(user).is_some_and(|e| e.has_live(now)))
    }

    async fn is_reachable_in(&self, user: &UserId, room: &ChatId) -> PresenceResult<bool> {
        let now = Instant::now();
        let users = self.users.read().await;
        Ok(users.get(user).is_some_and(|e| {
            e.live_leases(now).any(|(_, lease)| lease.rooms.contains(room))
        }))
    }

    async fn list_online(&self) -> PresenceResult<BTreeSet<UserId>> {
        let now = Instant::now();
        let users = self.users.read().await;
        Ok(users
            .iter()
            .filter(|(_, e)| e.has_live(now))
            .map(|(id, _)| id.clone())
            .collect())
    }

    async fn get_presence(&self, user: &UserId) -> PresenceResult<Option<PresenceRecord>> {
        let now = Instant::now();
        let users = self.users.read().await;
        Ok(users
            .get(user)
            .filter(|e| e.is_retained(now, &self.config))
            .map(|e| e.record(user, now)))
    }

    async fn list_connections(&self, user: &UserId) -> PresenceResult<BTreeSet<ConnectionId>> {
        let now = Instant::now();
        let users = self.users.read().await;
        Ok(users
            .get(user)
            .map(|e| e.live_leases(now).map(|(id, _)| *id).collect())
            .unwrap_or_default())
    }

    async fn purge_expired(&self) -> PresenceResult<usize> {
        let now = Instant::now();
        let mut users = self.users.write().await;
        let before = users.len();
        users.retain(|_, entry| {
            entry.reap(now);
            entry.is_retained(now, &self.config)
        });
        Ok(before - users.len())
    }
}
