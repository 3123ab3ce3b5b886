//! Redis-backed presence store, shared by every gateway process.
//!
//! Key layout under a configurable prefix:
//!
//! ```text
//! {prefix}:presence:user:{user}   HASH  c:{conn} → {"e":expiry_ms,"r":[rooms]}
//!                                       _last_seen → ms, _away → 0|1
//! {prefix}:presence:online        ZSET  user → latest lease expiry (ms)
//! ```
//!
//! Every mutation is one Lua script, so concurrent connect/disconnect of the
//! same user from different processes is serialized by Redis itself. Lapsed
//! leases are reaped inside each script. The user hash carries a TTL of the
//! last lease expiry plus the offline retention, so abandoned records expire
//! without any sweeper.

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::Script;
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};

use super::{PresenceConfig, PresenceRecord, PresenceResult, PresenceStatus, PresenceStore};
use crate::error::PresenceError;
use crate::model::{now_millis, ChatId, ConnectionId, UserId};

const LEASE_PREFIX: &str = "c:";

/// Shared prelude: drop lapsed leases, then keep the online index and the
/// record TTL in line with what is left.
const PRELUDE: &str = r#"
local function reap(key, now)
  local live = {}
  local had = false
  local flat = redis.call('HGETALL', key)
  for i = 1, #flat, 2 do
    local f = flat[i]
    if string.sub(f, 1, 2) == 'c:' then
      had = true
      local lease = cjson.decode(flat[i + 1])
      if type(lease.r) ~= 'table' then lease.r = {} end
      if tonumber(lease.e) <= now then
        redis.call('HDEL', key, f)
      else
        live[f] = lease
      end
    end
  end
  if had and next(live) == nil then
    redis.call('HSET', key, '_last_seen', now)
  end
  return live
end

local function settle(key, zkey, user, live, now, retention)
  local max_e = 0
  for _, lease in pairs(live) do
    if tonumber(lease.e) > max_e then max_e = tonumber(lease.e) end
  end
  if max_e > 0 then
    redis.call('ZADD', zkey, max_e, user)
    redis.call('PEXPIRE', key, max_e - now + retention)
  else
    redis.call('ZREM', zkey, user)
    redis.call('PEXPIRE', key, retention)
  end
end
"#;

// KEYS: user hash, online zset. ARGV: now, ttl, conn, retention, user.
const MARK_ONLINE: &str = r#"
local now = tonumber(ARGV[1])
local field = 'c:' .. ARGV[3]
local live = reap(KEYS[1], now)
local was_online = next(live) ~= nil
local lease = live[field] or { r = {} }
lease.e = now + tonumber(ARGV[2])
live[field] = lease
redis.call('HSET', KEYS[1], field, cjson.encode(lease))
if not was_online then
  redis.call('HSET', KEYS[1], '_last_seen', now, '_away', 0)
end
settle(KEYS[1], KEYS[2], ARGV[5], live, now, tonumber(ARGV[4]))
if was_online then return 0 end
return 1
"#;

// KEYS: user hash, online zset. ARGV: now, conn, retention, user.
const MARK_OFFLINE: &str = r#"
local now = tonumber(ARGV[1])
local field = 'c:' .. ARGV[2]
if redis.call('HDEL', KEYS[1], field) == 0 then return 0 end
local live = reap(KEYS[1], now)
settle(KEYS[1], KEYS[2], ARGV[4], live, now, tonumber(ARGV[3]))
if next(live) ~= nil then return 0 end
redis.call('HSET', KEYS[1], '_last_seen', now)
return 1
"#;

// KEYS: user hash, online zset. ARGV: now, conn, room, join(1)|leave(0), retention, user.
const UPDATE_ROOM: &str = r#"
local now = tonumber(ARGV[1])
local field = 'c:' .. ARGV[2]
if redis.call('EXISTS', KEYS[1]) == 0 then return 0 end
local live = reap(KEYS[1], now)
settle(KEYS[1], KEYS[2], ARGV[6], live, now, tonumber(ARGV[5]))
local lease = live[field]
if lease == nil then return 0 end
local rooms = {}
local present = false
for _, r in ipairs(lease.r) do
  if r == ARGV[3] then present = true
  else table.insert(rooms, r) end
end
if ARGV[4] == '1' then
  if present then return 0 end
  table.insert(rooms, ARGV[3])
elseif not present then
  return 0
end
lease.r = rooms
redis.call('HSET', KEYS[1], field, cjson.encode(lease))
return 1
"#;

// KEYS: user hash, online zset. ARGV: now, away, retention, user.
const SET_AWAY: &str = r#"
local now = tonumber(ARGV[1])
if redis.call('EXISTS', KEYS[1]) == 0 then return 'offline' end
local live = reap(KEYS[1], now)
redis.call('HSET', KEYS[1], '_away', ARGV[2])
settle(KEYS[1], KEYS[2], ARGV[4], live, now, tonumber(ARGV[3]))
if next(live) == nil then return 'offline' end
if ARGV[2] == '1' then return 'away' end
return 'online'
"#;

// KEYS: user hash, online zset. ARGV: now, retention, user.
const REAP: &str = r#"
local now = tonumber(ARGV[1])
local live = reap(KEYS[1], now)
settle(KEYS[1], KEYS[2], ARGV[3], live, now, tonumber(ARGV[2]))
if next(live) == nil then return 1 end
return 0
"#;

#[derive(Debug, Deserialize)]
struct StoredLease {
    e: f64,
    #[serde(default)]
    r: Value,
}

impl StoredLease {
    fn rooms(&self) -> impl Iterator<Item = &str> {
        // An empty Lua table encodes as `{}`, so only arrays carry rooms.
        self.r
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(|v| v.as_str())
    }
}

/// Decoded user hash.
#[derive(Debug, Default)]
struct StoredPresence {
    leases: HashMap<ConnectionId, StoredLease>,
    last_seen: u64,
    away: bool,
}

impl StoredPresence {
    fn parse(fields: HashMap<String, String>) -> Self {
        let mut presence = StoredPresence::default();
        for (field, value) in fields {
            if let Some(conn) = field.strip_prefix(LEASE_PREFIX) {
                let Ok(uuid) = uuid::Uuid::parse_str(conn) else {
                    log::warn!("Presence: skipping malformed lease field {field}");
                    continue;
                };
                match serde_json::from_str::<StoredLease>(&value) {
                    Ok(lease) => {
                        presence.leases.insert(ConnectionId::from_uuid(uuid), lease);
                    }
                    Err(e) => log::warn!("Presence: skipping malformed lease {field}: {e}"),
                }
            } else if field == "_last_seen" {
                presence.last_seen = value.parse::<f64>().map(|v| v as u64).unwrap_or_default();
            } else if field == "_away" {
                presence.away = value == "1";
            }
        }
        presence
    }

    fn live(&self, now: u64) -> impl Iterator<Item = (&ConnectionId, &StoredLease)> {
        self.leases.iter().filter(move |(_, lease)| lease.e > now as f64)
    }
}

fn backend(e: redis::RedisError) -> PresenceError {
    PresenceError::Backend(e.to_string())
}

/// [`PresenceStore`] over a multiplexed Redis connection.
pub struct RedisPresenceStore {
    conn: MultiplexedConnection,
    prefix: String,
    config: PresenceConfig,
    mark_online: Script,
    mark_offline: Script,
    update_room: Script,
    set_away: Script,
    reap: Script,
}

impl RedisPresenceStore {
    pub async fn connect(url: &str, prefix: impl Into<String>, config: PresenceConfig) -> PresenceResult<Self> {
        let client = redis::Client::open(url).map_err(backend)?;
        let conn = client.get_multiplexed_async_connection().await.map_err(backend)?;
        Ok(Self::with_connection(conn, prefix, config))
    }

    pub fn with_connection(conn: MultiplexedConnection, prefix: impl Into<String>, config: PresenceConfig) -> Self {
        let script = |body: &str| Script::new(&format!("{PRELUDE}{body}"));
        Self {
            conn,
            prefix: prefix.into(),
            config,
            mark_online: script(MARK_ONLINE),
            mark_offline: script(MARK_OFFLINE),
            update_room: script(UPDATE_ROOM),
            set_away: script(SET_AWAY),
            reap: script(REAP),
        }
    }

    fn user_key(&self, user: &UserId) -> String {
        format!("{}:presence:user:{}", self.prefix, user)
    }

    fn online_key(&self) -> String {
        format!("{}:presence:online", self.prefix)
    }

    fn ttl_ms(&self) -> u64 {
        self.config.online_ttl.as_millis() as u64
    }

    fn retention_ms(&self) -> u64 {
        self.config.offline_retention.as_millis() as u64
    }

    async fn load(&self, user: &UserId) -> PresenceResult<Option<StoredPresence>> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(self.user_key(user))
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        if fields.is_empty() {
            return Ok(None);
        }
        Ok(Some(StoredPresence::parse(fields)))
    }

    async fn update_room(&self, user: &UserId, conn_id: ConnectionId, room: &ChatId, join: bool) -> PresenceResult<()> {
        let mut conn = self.conn.clone();
        let mut invocation = self.update_room.prepare_invoke();
        invocation
            .key(self.user_key(user))
            .key(self.online_key())
            .arg(now_millis())
            .arg(conn_id.to_string())
            .arg(room.as_str())
            .arg(if join { "1" } else { "0" })
            .arg(self.retention_ms())
            .arg(user.as_str());
        let _changed: i64 = invocation.invoke_async(&mut conn).await.map_err(backend)?;
        Ok(())
    }
}

#[async_trait]
impl PresenceStore for RedisPresenceStore {
    async fn mark_online(&self, user: &UserId, conn_id: ConnectionId) -> PresenceResult<bool> {
        let mut conn = self.conn.clone();
        let mut invocation = self.mark_online.prepare_invoke();
        invocation
            .key(self.user_key(user))
            .key(self.online_key())
            .arg(now_millis())
            .arg(self.ttl_ms())
            .arg(conn_id.to_string())
            .arg(self.retention_ms())
            .arg(user.as_str());
        let flipped: i64 = invocation.invoke_async(&mut conn).await.map_err(backend)?;
        Ok(flipped == 1)
    }

    async fn mark_offline(&self, user: &UserId, conn_id: ConnectionId) -> PresenceResult<bool> {
        let mut conn = self.conn.clone();
        let mut invocation = self.mark_offline.prepare_invoke();
        invocation
            .key(self.user_key(user))
            .key(self.online_key())
            .arg(now_millis())
            .arg(conn_id.to_string())
            .arg(self.retention_ms())
            .arg(user.as_str());
        let flipped: i64 = invocation.invoke_async(&mut conn).await.map_err(backend)?;
        Ok(flipped == 1)
    }

    async fn join_room(&self, user: &UserId, conn: ConnectionId, room: &ChatId) -> PresenceResult<()> {
        self.update_room(user, conn, room, true).await
    }

    async fn leave_room(&self, user: &UserId, conn: ConnectionId, room: &ChatId) -> PresenceResult<()> {
        self.update_room(user, conn, room, false).await
    }

    async fn set_away(&self, user: &UserId, away: bool) -> PresenceResult<PresenceStatus> {
        let mut conn = self.conn.clone();
        let mut invocation = self.set_away.prepare_invoke();
        invocation
            .key(self.user_key(user))
            .key(self.online_key())
            .arg(now_millis())
            .arg(if away { "1" } else { "0" })
            .arg(self.retention_ms())
            .arg(user.as_str());
        let status: String = invocation.invoke_async(&mut conn).await.map_err(backend)?;
        Ok(match status.as_str() {
            "online" => PresenceStatus::Online,
            "away" => PresenceStatus::Away,
            _ => PresenceStatus::Offline,
        })
    }

    async fn is_online(&self, user: &UserId) -> PresenceResult<bool> {
        let mut conn = self.conn.clone();
        let expiry: Option<f64> = redis::cmd("ZSCORE")
            .arg(self.online_key())
            .arg(user.as_str())
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(expiry.is_some_and(|e| e > now_millis() as f64))
    }

    async fn is_reachable_in(&self, user: &UserId, room: &ChatId) -> PresenceResult<bool> {
        let now = now_millis();
        Ok(self.load(user).await?.is_some_and(|presence| {
            presence
                .live(now)
                .any(|(_, lease)| lease.rooms().any(|r| r == room.as_str()))
        }))
    }

    async fn list_online(&self) -> PresenceResult<BTreeSet<UserId>> {
        let mut conn = self.conn.clone();
        let users: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(self.online_key())
            .arg(format!("({}", now_millis()))
            .arg("+inf")
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(users.into_iter().map(UserId::from).collect())
    }

    async fn get_presence(&self, user: &UserId) -> PresenceResult<Option<PresenceRecord>> {
        let now = now_millis();
        Ok(self.load(user).await?.map(|presence| {
            let connections: BTreeSet<ConnectionId> =
                presence.live(now).map(|(id, _)| *id).collect();
            PresenceRecord {
                user_id: user.clone(),
                status: PresenceStatus::derive(!connections.is_empty(), presence.away),
                last_seen: presence.last_seen,
                connections,
            }
        }))
    }

    async fn list_connections(&self, user: &UserId) -> PresenceResult<BTreeSet<ConnectionId>> {
        let now = now_millis();
        Ok(self
            .load(user)
            .await?
            .map(|presence| presence.live(now).map(|(id, _)| *id).collect())
            .unwrap_or_default())
    }

    /// Reconciles users whose every lease lapsed. Offline records past
    /// retention expire through their key TTL, so this only reports the
    /// lapsed users it flipped to offline.
    async fn purge_expired(&self) -> PresenceResult<usize> {
        let mut conn = self.conn.clone();
        let lapsed: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(self.online_key())
            .arg("-inf")
            .arg(now_millis())
            .query_async(&mut conn)
            .await
            .map_err(backend)?;

        let mut flipped = 0;
        for user in lapsed.into_iter().map(UserId::from) {
            let mut invocation = self.reap.prepare_invoke();
            invocation
                .key(self.user_key(&user))
                .key(self.online_key())
                .arg(now_millis())
                .arg(self.retention_ms())
                .arg(user.as_str());
            let offline: i64 = invocation.invoke_async(&mut conn).await.map_err(backend)?;
            if offline == 1 {
                log::debug!("Presence: {user} lease lapsed");
                flipped += 1;
            }
        }
        Ok(flipped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stored_presence() {
        let live = ConnectionId::new();
        let lapsed = ConnectionId::new();
        let mut fields = HashMap::new();
        fields.insert(format!("c:{live}"), r#"{"e":2000,"r":["c1","c2"]}"#.to_string());
        fields.insert(format!("c:{lapsed}"), r#"{"e":500,"r":{}}"#.to_string());
        fields.insert("c:not-a-uuid".to_string(), r#"{"e":2000}"#.to_string());
        fields.insert("_last_seen".to_string(), "1234".to_string());
        fields.insert("_away".to_string(), "1".to_string());

        let presence = StoredPresence::parse(fields);
        assert_eq!(presence.leases.len(), 2);
        assert_eq!(presence.last_seen, 1234);
        assert!(presence.away);

        let live_now: Vec<_> = presence.live(1000).collect();
        assert_eq!(live_now.len(), 1);
        assert_eq!(*live_now[0].0, live);
        assert_eq!(live_now[0].1.rooms().collect::<Vec<_>>(), vec!["c1", "c2"]);

        let lapsed_lease = &presence.leases[&lapsed];
        assert_eq!(lapsed_lease.rooms().count(), 0);
    }

    /// Runs against a live server when `PARLEY_TEST_REDIS_URL` is set.
    #[tokio::test]
    async fn test_redis_presence_lifecycle() {
        let Ok(url) = std::env::var("PARLEY_TEST_REDIS_URL") else {
            return;
        };
        let prefix = format!("parley-test-{}", uuid::Uuid::new_v4());
        let store = RedisPresenceStore::connect(&url, prefix, PresenceConfig::default())
            .await
            .unwrap();
        let alice = UserId::new("alice");
        let (c1, c2) = (ConnectionId::new(), ConnectionId::new());

        assert!(store.mark_online(&alice, c1).await.unwrap());
        assert!(!store.mark_online(&alice, c2).await.unwrap());
        store.join_room(&alice, c2, &"room".into()).await.unwrap();
        assert!(store.is_reachable_in(&alice, &"room".into()).await.unwrap());
        assert_eq!(store.list_connections(&alice).await.unwrap().len(), 2);
        assert!(store.list_online().await.unwrap().contains(&alice));

        assert!(!store.mark_offline(&alice, c1).await.unwrap());
        assert!(store.mark_offline(&alice, c2).await.unwrap());
        assert!(!store.mark_offline(&alice, c2).await.unwrap());
        assert!(!store.is_online(&alice).await.unwrap());
        assert!(!store.is_reachable_in(&alice, &"room".into()).await.unwrap());

        let record = store.get_presence(&alice).await.unwrap().unwrap();
        assert_eq!(record.status, PresenceStatus::Offline);
    }
}
