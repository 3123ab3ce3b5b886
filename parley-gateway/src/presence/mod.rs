//! Presence store: which users are reachable, on which connections.
//!
//! ## Architecture
//!
//! ```text
//!  process A                         process B
//!  Gateway ──┐                  ┌── Gateway
//!            │  mark_online /   │
//!            │  mark_offline    │
//!            ▼                  ▼
//!       ┌──────────────────────────────┐
//!       │        PresenceStore         │   one logical shared store
//!       │  user → { conn → lease }     │
//!       │  lease = { rooms, expiry }   │
//!       └──────────────────────────────┘
//! ```
//!
//! A user is online iff they hold at least one unexpired connection lease.
//! Leases are refreshed by gateway heartbeats; a lease that is not refreshed
//! before its TTL lapses is ignored by reads and reaped by the next write, so
//! a leaked connection cannot keep a user online forever. After going
//! offline a record is retained for `offline_retention`, then expires.
//!
//! Room membership is mirrored here per lease so that reachability "in a
//! room" is answered cluster-wide, never from one process's local registry.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

use crate::error::PresenceError;
use crate::model::{ChatId, ConnectionId, UserId};

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis_store;

pub use memory::MemoryPresenceStore;
#[cfg(feature = "redis")]
pub use redis_store::RedisPresenceStore;

pub type PresenceResult<T> = Result<T, PresenceError>;

/// User-visible presence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Away,
    Offline,
}

impl PresenceStatus {
    /// Away users still hold live connections.
    pub fn is_online(self) -> bool {
        !matches!(self, PresenceStatus::Offline)
    }

    /// Status derived from the connection set and the away flag.
    pub fn derive(has_connections: bool, away: bool) -> Self {
        match (has_connections, away) {
            (false, _) => PresenceStatus::Offline,
            (true, true) => PresenceStatus::Away,
            (true, false) => PresenceStatus::Online,
        }
    }
}

/// Snapshot of one user's presence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub user_id: UserId,
    pub status: PresenceStatus,
    /// Milliseconds since the Unix epoch; last connect or disconnect.
    pub last_seen: u64,
    pub connections: BTreeSet<ConnectionId>,
}

impl PresenceRecord {
    pub fn is_online(&self) -> bool {
        !self.connections.is_empty()
    }
}

/// Lease timings.
#[derive(Debug, Clone)]
pub struct PresenceConfig {
    /// How long a connection lease lives without a heartbeat.
    pub online_ttl: Duration,
    /// How long an offline record is retained before it expires.
    pub offline_retention: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            online_ttl: Duration::from_secs(5 * 60),
            offline_retention: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// The shared presence store.
///
/// Every mutating operation is atomic with respect to concurrent callers on
/// the same user, from any process.
#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// Add `conn` to the user's live set, or refresh its lease.
    /// Returns `true` when this call flipped the user offline → online.
    async fn mark_online(&self, user: &UserId, conn: ConnectionId) -> PresenceResult<bool>;

    /// Remove `conn`. Returns `true` when this call flipped the user offline.
    async fn mark_offline(&self, user: &UserId, conn: ConnectionId) -> PresenceResult<bool>;

    /// Record that `conn` joined `room`. No-op for an unknown connection.
    async fn join_room(&self, user: &UserId, conn: ConnectionId, room: &ChatId) -> PresenceResult<()>;

    async fn leave_room(&self, user: &UserId, conn: ConnectionId, room: &ChatId) -> PresenceResult<()>;

    /// Set or clear the away flag. Returns the resulting status.
    async fn set_away(&self, user: &UserId, away: bool) -> PresenceResult<PresenceStatus>;

    async fn is_online(&self, user: &UserId) -> PresenceResult<bool>;

    /// At least one live connection of `user` has joined `room`.
    async fn is_reachable_in(&self, user: &UserId, room: &ChatId) -> PresenceResult<bool>;

    async fn list_online(&self) -> PresenceResult<BTreeSet<UserId>>;

    async fn get_presence(&self, user: &UserId) -> PresenceResult<Option<PresenceRecord>>;

    async fn list_connections(&self, user: &UserId) -> PresenceResult<BTreeSet<ConnectionId>>;

    /// Drop records past their retention window. Returns how many.
    async fn purge_expired(&self) -> PresenceResult<usize> {
        Ok(0)
    }
}
