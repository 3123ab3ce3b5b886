//! Gateway: connection lifecycle and inbound actions.
//!
//! Architecture:
//! ```text
//!   socket ──▶ ChatServer ──▶ Gateway::handle_action
//!                               │
//!       ┌───────────────┬───────┴────────┬──────────────────┐
//!       ▼               ▼                ▼                  ▼
//!  ConnectionRegistry  PresenceStore  DeliveryTracker   Publisher ──▶ FanoutBus
//!   (local sockets)    (cluster-wide)   (+ MessageStore)               │
//!       ▲                                                              │
//!       └──────────────────── Relay (per subscribed topic) ◀───────────┘
//! ```
//!
//! The gateway subscribes to a bus topic only while a local connection needs
//! it: `user:{id}` while that user has a connection here, `room:{id}` while
//! any local connection has joined the room, and `presence` always.
//!
//! Ordering on join is what makes delivery decisions safe across processes:
//! the room subscription exists before the presence store reports the
//! connection reachable in the room, so a sender that sees the recipient as
//! reachable publishes to a topic somebody here is already listening on.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::cache::MessageCache;
use crate::config::GatewayConfig;
use crate::delivery::DeliveryTracker;
use crate::error::{BusError, ChatError, PresenceError, StoreError};
use crate::events::{ChatEvent, EventSink, LogEventSink};
use crate::fanout::{BusHandler, FanoutBus, LocalBus, Publisher, Subscription, Topic};
use crate::model::{Chat, ChatId, ConnectionId, UserId};
use crate::presence::{MemoryPresenceStore, PresenceStatus, PresenceStore};
use crate::protocol::{ActionReply, BusEnvelope, BusEvent, ClientAction, CloseReason};
use crate::registry::{ConnectionRegistry, ConnectionSnapshot, Outbound};
use crate::session::{Authenticator, SessionStore};
use crate::storage::{MemoryMessageStore, MessageStore};

/// Messages returned by `fetch-messages` when the client names no limit.
pub const DEFAULT_FETCH_LIMIT: usize = 50;
/// Upper bound on `fetch-messages`.
pub const MAX_FETCH_LIMIT: usize = 200;
/// Upper bound on message content, in bytes.
pub const MAX_CONTENT_LEN: usize = 64 * 1024;

/// Failures while assembling a gateway.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Presence(#[from] PresenceError),
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("{0} support is not compiled in")]
    Unsupported(&'static str),
}

/// Gateway counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GatewayStats {
    pub connections_opened: u64,
    pub connections_closed: u64,
    pub auth_failures: u64,
    pub messages_accepted: u64,
    pub status_transitions: u64,
    pub idle_closures: u64,
    pub active_connections: usize,
    pub active_subscriptions: usize,
}

#[derive(Default)]
struct AtomicGatewayStats {
    connections_opened: AtomicU64,
    connections_closed: AtomicU64,
    auth_failures: AtomicU64,
    messages_accepted: AtomicU64,
    idle_closures: AtomicU64,
}

/// What one maintenance pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub idle_closed: usize,
    pub leases_refreshed: usize,
    pub subscriptions_restored: usize,
    pub topics_pruned: usize,
    pub presence_purged: usize,
    pub sessions_purged: usize,
}

/// Forwards bus traffic to the local sockets the topic addresses.
struct Relay {
    registry: ConnectionRegistry,
}

#[async_trait]
impl BusHandler for Relay {
    async fn handle(&self, topic: &Topic, envelope: BusEnvelope) {
        let exclude = envelope.origin_connection;
        let event = envelope.event.into_server_event();
        let delivered = match topic {
            Topic::Room(chat) => self.registry.deliver_to_room(chat, &event, exclude).await,
            Topic::User(user) => self.registry.deliver_to_user(user, &event).await,
            Topic::Presence => self.registry.broadcast_all(&event).await,
        };
        log::trace!("Relay: {topic} → {delivered} local connections");
    }
}

struct GatewayInner {
    config: GatewayConfig,
    authenticator: Arc<dyn Authenticator>,
    sessions: Option<Arc<SessionStore>>,
    presence: Arc<dyn PresenceStore>,
    store: Arc<dyn MessageStore>,
    publisher: Publisher,
    registry: ConnectionRegistry,
    tracker: DeliveryTracker,
    events: Arc<dyn EventSink>,
    subscriptions: Mutex<HashMap<Topic, Subscription>>,
    stats: AtomicGatewayStats,
}

/// Assembles a [`Gateway`]. Collaborators that are not supplied are chosen
/// from the configuration: Redis presence and fan-out when `redis_url` is
/// set, RocksDB storage when `data_dir` is set, in-process otherwise.
pub struct GatewayBuilder {
    config: GatewayConfig,
    authenticator: Option<Arc<dyn Authenticator>>,
    sessions: Option<Arc<SessionStore>>,
    presence: Option<Arc<dyn PresenceStore>>,
    store: Option<Arc<dyn MessageStore>>,
    bus: Option<Arc<dyn FanoutBus>>,
    events: Option<Arc<dyn EventSink>>,
    process_id: Option<Uuid>,
}

impl GatewayBuilder {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config,
            authenticator: None,
            sessions: None,
            presence: None,
            store: None,
            bus: None,
            events: None,
            process_id: None,
        }
    }

    /// Use an external credential verifier instead of the session store.
    pub fn authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    /// Authenticate against this session store; the gateway also purges it.
    pub fn sessions(mut self, sessions: Arc<SessionStore>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    pub fn presence(mut self, presence: Arc<dyn PresenceStore>) -> Self {
        self.presence = Some(presence);
        self
    }

    pub fn store(mut self, store: Arc<dyn MessageStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn bus(mut self, bus: Arc<dyn FanoutBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn process_id(mut self, process_id: Uuid) -> Self {
        self.process_id = Some(process_id);
        self
    }

    pub async fn build(self) -> Result<Gateway, GatewayError> {
        let config = self.config;
        let presence = match self.presence {
            Some(presence) => presence,
            None => default_presence(&config).await?,
        };
        let bus = match self.bus {
            Some(bus) => bus,
            None => default_bus(&config).await?,
        };
        let store = match self.store {
            Some(store) => store,
            None => default_store(&config)?,
        };

        let (authenticator, sessions): (Arc<dyn Authenticator>, _) = match (self.authenticator, self.sessions) {
            (Some(authenticator), sessions) => (authenticator, sessions),
            (None, sessions) => {
                let sessions = sessions.unwrap_or_else(|| Arc::new(SessionStore::new(config.session_ttl)));
                (sessions.clone() as Arc<dyn Authenticator>, Some(sessions))
            }
        };
        let events = self.events.unwrap_or_else(|| Arc::new(LogEventSink));
        let process_id = self.process_id.unwrap_or_else(Uuid::new_v4);

        let publisher = Publisher::new(bus, process_id, config.publish_timeout);
        let tracker = DeliveryTracker::new(
            store.clone(),
            presence.clone(),
            publisher.clone(),
            MessageCache::new(config.cache_capacity, config.cache_ttl),
            events.clone(),
        );

        let gateway = Gateway {
            inner: Arc::new(GatewayInner {
                config,
                authenticator,
                sessions,
                presence,
                store,
                publisher,
                registry: ConnectionRegistry::new(),
                tracker,
                events,
                subscriptions: Mutex::new(HashMap::new()),
                stats: AtomicGatewayStats::default(),
            }),
        };
        gateway.ensure_subscribed(&Topic::Presence).await?;
        log::info!("Gateway {process_id} ready");
        Ok(gateway)
    }
}

async fn default_presence(config: &GatewayConfig) -> Result<Arc<dyn PresenceStore>, GatewayError> {
    match &config.redis_url {
        #[cfg(feature = "redis")]
        Some(url) => {
            let store = crate::presence::RedisPresenceStore::connect(url, config.redis_prefix.clone(), config.presence()).await?;
            log::info!("Presence: using Redis at {url}");
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "redis"))]
        Some(_) => Err(GatewayError::Unsupported("redis")),
        None => Ok(Arc::new(MemoryPresenceStore::new(config.presence()))),
    }
}

async fn default_bus(config: &GatewayConfig) -> Result<Arc<dyn FanoutBus>, GatewayError> {
    match &config.redis_url {
        #[cfg(feature = "redis")]
        Some(url) => {
            let bus = crate::fanout::RedisBus::connect(url, config.redis_prefix.clone()).await?;
            log::info!("Fan-out: using Redis pub/sub at {url}");
            Ok(Arc::new(bus))
        }
        #[cfg(not(feature = "redis"))]
        Some(_) => Err(GatewayError::Unsupported("redis")),
        None => Ok(Arc::new(LocalBus::new(local_bus_capacity(config)))),
    }
}

/// Bus channels hold at least as much as one connection's outbound queue.
fn local_bus_capacity(config: &GatewayConfig) -> usize {
    config.bus_capacity.max(config.outbound_buffer)
}

fn default_store(config: &GatewayConfig) -> Result<Arc<dyn MessageStore>, GatewayError> {
    match &config.data_dir {
        #[cfg(feature = "rocksdb")]
        Some(dir) => {
            let store = crate::storage::RocksMessageStore::open(crate::storage::RocksConfig {
                path: dir.clone(),
                ..crate::storage::RocksConfig::default()
            })?;
            log::info!("Storage: using RocksDB at {}", dir.display());
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "rocksdb"))]
        Some(_) => Err(GatewayError::Unsupported("rocksdb")),
        None => Ok(Arc::new(MemoryMessageStore::new())),
    }
}

/// Shared gateway handle; clones drive the same state.
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<GatewayInner>,
}

impl Gateway {
    pub fn builder(config: GatewayConfig) -> GatewayBuilder {
        GatewayBuilder::new(config)
    }

    /// In-process backends throughout.
    pub async fn in_memory(config: GatewayConfig) -> Result<Self, GatewayError> {
        let config = GatewayConfig {
            redis_url: None,
            data_dir: None,
            ..config
        };
        GatewayBuilder::new(config).build().await
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.inner.config
    }

    pub fn process_id(&self) -> Uuid {
        self.inner.publisher.process_id()
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.inner.registry
    }

    pub fn presence(&self) -> &Arc<dyn PresenceStore> {
        &self.inner.presence
    }

    pub fn store(&self) -> &Arc<dyn MessageStore> {
        &self.inner.store
    }

    pub fn tracker(&self) -> &DeliveryTracker {
        &self.inner.tracker
    }

    /// The bundled session store, when the gateway authenticates with it.
    pub fn sessions(&self) -> Option<&Arc<SessionStore>> {
        self.inner.sessions.as_ref()
    }

    pub async fn create_chat(&self, chat: Chat) -> Result<Chat, ChatError> {
        Ok(self.inner.store.create_chat(chat).await?)
    }

    /// Verify a handshake credential.
    pub async fn authenticate(&self, credential: &str) -> Result<UserId, ChatError> {
        match self.inner.authenticator.verify(credential).await {
            Ok(user) => Ok(user),
            Err(e) => {
                self.inner.stats.auth_failures.fetch_add(1, Ordering::Relaxed);
                log::info!("Gateway: handshake rejected: {e}");
                Err(ChatError::AuthenticationFailure(e))
            }
        }
    }

    /// Activate a connection for an authenticated user.
    ///
    /// On failure nothing is left behind: the registry entry is removed and
    /// the user topic released.
    pub async fn open_connection(&self, user: UserId, outbound: mpsc::Sender<Outbound>) -> Result<ConnectionId, ChatError> {
        let conn = ConnectionId::new();
        self.inner.registry.register(conn, user.clone(), outbound).await;

        let activated = async {
            self.ensure_subscribed(&Topic::User(user.clone())).await?;
            Ok::<bool, ChatError>(self.inner.presence.mark_online(&user, conn).await?)
        }
        .await;

        let flipped = match activated {
            Ok(flipped) => flipped,
            Err(e) => {
                log::error!("Gateway: could not activate {conn} for {user}: {e}");
                self.inner.registry.unregister(conn).await;
                self.release_if_unused(&Topic::User(user)).await;
                return Err(e);
            }
        };

        self.inner.stats.connections_opened.fetch_add(1, Ordering::Relaxed);
        self.inner.events.publish(ChatEvent::ConnectionOpened {
            connection_id: conn,
            user_id: user.clone(),
        });
        if flipped {
            self.announce_presence(&user, PresenceStatus::Online).await;
        }
        log::info!("Gateway: {user} connected as {conn}");
        Ok(conn)
    }

    /// Record inbound activity on a connection.
    pub async fn touch(&self, conn: ConnectionId) -> bool {
        self.inner.registry.touch(conn).await
    }

    /// Run one inbound action for an active connection.
    pub async fn handle_action(&self, conn: ConnectionId, action: ClientAction) -> Result<ActionReply, ChatError> {
        let user = self
            .inner
            .registry
            .lookup(conn)
            .await
            .ok_or(ChatError::UnknownConnection)?;
        log::trace!("Gateway: {user}/{conn} → {}", action.name());

        match action {
            ClientAction::SendMessage { chat_id, content } => self.send_message(conn, &user, chat_id, content).await,
            ClientAction::JoinRoom { chat_id } => self.join_room(conn, &user, chat_id).await,
            ClientAction::LeaveRoom { chat_id } => self.leave_room(conn, &user, chat_id).await,
            ClientAction::ReadAck { message_id } => {
                self.inner.tracker.mark_read(&user, message_id).await?;
                Ok(ActionReply::ok())
            }
            ClientAction::ListOnline => {
                let online = self.inner.presence.list_online().await?;
                Ok(ActionReply::OnlineUsers {
                    user_ids: online.into_iter().collect(),
                })
            }
            ClientAction::GetPresence { user_id } => Ok(ActionReply::Presence {
                presence: self.inner.presence.get_presence(&user_id).await?,
            }),
            ClientAction::SetAway { away } => {
                let status = self.inner.presence.set_away(&user, away).await?;
                self.announce_presence(&user, status).await;
                Ok(ActionReply::ok())
            }
            ClientAction::FetchMessages { chat_id, limit } => {
                let limit = match limit {
                    Some(0) => return Err(ChatError::InvalidRequest("limit must be positive".to_string())),
                    Some(n) => n.min(MAX_FETCH_LIMIT),
                    None => DEFAULT_FETCH_LIMIT,
                };
                let chat = self.participant_chat(&user, &chat_id).await?;
                let messages = self.inner.store.list_messages(&chat.id, limit).await?;
                Ok(ActionReply::Messages { messages })
            }
        }
    }

    async fn participant_chat(&self, user: &UserId, chat_id: &ChatId) -> Result<Chat, ChatError> {
        let chat = self
            .inner
            .store
            .get_chat(chat_id)
            .await?
            .ok_or_else(|| ChatError::ChatNotFound(chat_id.clone()))?;
        if !chat.is_participant(user) {
            return Err(ChatError::NotAParticipant {
                user: user.clone(),
                chat: chat_id.clone(),
            });
        }
        Ok(chat)
    }

    async fn send_message(&self, conn: ConnectionId, user: &UserId, chat_id: ChatId, content: String) -> Result<ActionReply, ChatError> {
        if content.is_empty() {
            return Err(ChatError::InvalidRequest("content must not be empty".to_string()));
        }
        if content.len() > MAX_CONTENT_LEN {
            return Err(ChatError::InvalidRequest(format!("content exceeds {MAX_CONTENT_LEN} bytes")));
        }
        let chat = self.participant_chat(user, &chat_id).await?;
        let message = self.inner.tracker.accept(&chat, user, content).await?;
        self.inner.stats.messages_accepted.fetch_add(1, Ordering::Relaxed);

        let reply = ActionReply::MessageAccepted {
            message_id: message.id,
            status: message.status,
        };
        self.inner
            .publisher
            .publish_best_effort(&Topic::Room(chat.id), Some(conn), BusEvent::Message(message))
            .await;
        Ok(reply)
    }

    async fn join_room(&self, conn: ConnectionId, user: &UserId, chat_id: ChatId) -> Result<ActionReply, ChatError> {
        let chat = self.participant_chat(user, &chat_id).await?;
        if !self.inner.registry.join_room(conn, &chat.id).await {
            return Err(ChatError::UnknownConnection);
        }

        let topic = Topic::Room(chat.id.clone());
        let joined = async {
            self.ensure_subscribed(&topic).await?;
            self.inner.presence.join_room(user, conn, &chat.id).await?;
            Ok::<(), ChatError>(())
        }
        .await;
        if let Err(e) = joined {
            self.inner.registry.leave_room(conn, &chat.id).await;
            self.release_if_unused(&topic).await;
            return Err(e);
        }

        // The join stands either way; a later join retries the sweep.
        if let Err(e) = self.inner.tracker.deliver_pending(user, &chat.id).await {
            log::warn!("Gateway: pending delivery for {user} in {} failed: {e}", chat.id);
        }
        Ok(ActionReply::ok())
    }

    /// If the presence store cannot be updated the connection stays in the
    /// room, so senders that see it reachable are still heard.
    async fn leave_room(&self, conn: ConnectionId, user: &UserId, chat_id: ChatId) -> Result<ActionReply, ChatError> {
        if !self.inner.registry.leave_room(conn, &chat_id).await {
            return Ok(ActionReply::ok());
        }

        let presence = &self.inner.presence;
        let left = self
            .inner
            .config
            .cleanup_backoff
            .retry("Presence room leave", || presence.leave_room(user, conn, &chat_id))
            .await;
        if let Err(e) = left {
            self.inner.registry.join_room(conn, &chat_id).await;
            let topic = Topic::Room(chat_id);
            if let Err(sub) = self.ensure_subscribed(&topic).await {
                log::warn!("Gateway: could not resubscribe {topic} for {user}/{conn}: {sub}");
            }
            return Err(e.into());
        }
        self.release_if_unused(&Topic::Room(chat_id)).await;
        Ok(ActionReply::ok())
    }

    /// Detach a connection and release everything it held. Safe to call
    /// more than once; only the first call does anything.
    pub async fn close_connection(&self, conn: ConnectionId, reason: CloseReason) -> bool {
        let Some(removed) = self.inner.registry.unregister(conn).await else {
            return false;
        };
        let user = removed.user_id;

        for room in removed.rooms {
            self.release_if_unused(&Topic::Room(room)).await;
        }
        self.release_if_unused(&Topic::User(user.clone())).await;

        let presence = &self.inner.presence;
        let offline = self
            .inner
            .config
            .cleanup_backoff
            .retry("Presence cleanup", || presence.mark_offline(&user, conn))
            .await;
        match offline {
            Ok(true) => self.announce_presence(&user, PresenceStatus::Offline).await,
            Ok(false) => {}
            // The lease lapses on its own after online_ttl.
            Err(e) => log::error!("Gateway: presence for {user}/{conn} left to expire: {e}"),
        }

        self.inner.stats.connections_closed.fetch_add(1, Ordering::Relaxed);
        self.inner.events.publish(ChatEvent::ConnectionClosed {
            connection_id: conn,
            user_id: user.clone(),
            reason: reason.as_str().to_string(),
        });
        log::info!("Gateway: {user}/{conn} closed ({})", reason.as_str());
        true
    }

    /// Ask every local connection to close.
    pub async fn shutdown(&self) -> usize {
        let mut signalled = 0;
        for snapshot in self.inner.registry.snapshot().await {
            if self
                .inner
                .registry
                .signal_close(snapshot.connection_id, CloseReason::ServerShutdown)
                .await
            {
                signalled += 1;
            }
        }
        log::info!("Gateway: shutdown signalled to {signalled} connections");
        signalled
    }

    /// One maintenance pass.
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let inner = &self.inner;

        for (conn, user) in inner.registry.idle_connections(inner.config.idle_timeout).await {
            log::info!("Gateway: closing idle connection {user}/{conn}");
            inner.registry.signal_close(conn, CloseReason::IdleTimeout).await;
            if self.close_connection(conn, CloseReason::IdleTimeout).await {
                inner.stats.idle_closures.fetch_add(1, Ordering::Relaxed);
                report.idle_closed += 1;
            }
        }

        for snapshot in inner.registry.snapshot().await {
            if self.refresh_lease(&snapshot).await {
                report.leases_refreshed += 1;
            }
        }

        report.subscriptions_restored = self.restore_subscriptions().await;
        report.topics_pruned = inner.publisher.bus().prune().await;
        report.presence_purged = match inner.presence.purge_expired().await {
            Ok(n) => n,
            Err(e) => {
                log::warn!("Gateway: presence purge failed: {e}");
                0
            }
        };
        if let Some(sessions) = &inner.sessions {
            report.sessions_purged = sessions.purge_expired().await;
        }

        if report.idle_closed > 0
            || report.subscriptions_restored > 0
            || report.presence_purged > 0
            || report.sessions_purged > 0
        {
            log::info!("Gateway: sweep {report:?}");
        } else {
            log::debug!("Gateway: sweep {report:?}");
        }
        report
    }

    /// Renew the presence lease of one live connection. A lease the store
    /// already reaped comes back without its rooms, so those are re-joined.
    ///
    /// The snapshot may be stale by the time the store answers: a
    /// connection that closed or left a room meanwhile has its lease or room
    /// taken back out instead of being resurrected.
    async fn refresh_lease(&self, snapshot: &ConnectionSnapshot) -> bool {
        let inner = &self.inner;
        let user = &snapshot.user_id;
        let conn = snapshot.connection_id;

        let flipped = match inner.presence.mark_online(user, conn).await {
            Ok(flipped) => flipped,
            Err(e) => {
                log::warn!("Gateway: lease refresh for {user}/{conn} failed: {e}");
                return false;
            }
        };
        for room in &snapshot.rooms {
            if let Err(e) = inner.presence.join_room(user, conn, room).await {
                log::warn!("Gateway: could not restore {room} for {user}/{conn}: {e}");
            }
        }

        if inner.registry.lookup(conn).await.is_none() {
            log::debug!("Gateway: {user}/{conn} closed during lease refresh");
            if let Err(e) = inner.presence.mark_offline(user, conn).await {
                log::warn!("Gateway: presence for {user}/{conn} left to expire: {e}");
            }
            return false;
        }
        let current = inner.registry.rooms_of(conn).await;
        for room in snapshot.rooms.difference(&current) {
            if let Err(e) = inner.presence.leave_room(user, conn, room).await {
                log::warn!("Gateway: could not drop {room} for {user}/{conn}: {e}");
            }
        }

        if flipped {
            log::warn!("Gateway: lease of {user}/{conn} had lapsed, restored");
            self.announce_presence(user, PresenceStatus::Online).await;
        }
        true
    }

    /// Resubscribe topics whose subscriber loop ended, e.g. after the bus
    /// lost its connection. Returns how many came back.
    async fn restore_subscriptions(&self) -> usize {
        let mut subscriptions = self.inner.subscriptions.lock().await;
        let dead: Vec<Topic> = subscriptions
            .iter()
            .filter(|(_, sub)| !sub.is_active())
            .map(|(topic, _)| topic.clone())
            .collect();

        let mut restored = 0;
        for topic in dead {
            subscriptions.remove(&topic);
            if !self.topic_needed(&topic).await {
                continue;
            }
            let relay = Arc::new(Relay {
                registry: self.inner.registry.clone(),
            });
            match self.inner.publisher.bus().subscribe(&topic, relay).await {
                Ok(subscription) => {
                    log::warn!("Gateway: subscription to {topic} had ended, restored");
                    subscriptions.insert(topic, subscription);
                    restored += 1;
                }
                Err(e) => log::warn!("Gateway: could not restore subscription to {topic}: {e}"),
            }
        }
        restored
    }

    /// Run [`Gateway::sweep`] every `sweep_interval` until the gateway is
    /// dropped.
    pub fn spawn_maintenance(&self) -> JoinHandle<()> {
        let weak: Weak<GatewayInner> = Arc::downgrade(&self.inner);
        let period = self.inner.config.sweep_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                Gateway { inner }.sweep().await;
            }
            log::debug!("Gateway: maintenance stopped");
        })
    }

    pub async fn stats(&self) -> GatewayStats {
        let s = &self.inner.stats;
        GatewayStats {
            connections_opened: s.connections_opened.load(Ordering::Relaxed),
            connections_closed: s.connections_closed.load(Ordering::Relaxed),
            auth_failures: s.auth_failures.load(Ordering::Relaxed),
            messages_accepted: s.messages_accepted.load(Ordering::Relaxed),
            status_transitions: self.inner.tracker.transitions(),
            idle_closures: s.idle_closures.load(Ordering::Relaxed),
            active_connections: self.inner.registry.len().await,
            active_subscriptions: self.inner.subscriptions.lock().await.len(),
        }
    }

    pub async fn is_subscribed(&self, topic: &Topic) -> bool {
        self.inner
            .subscriptions
            .lock()
            .await
            .get(topic)
            .is_some_and(Subscription::is_active)
    }

    async fn announce_presence(&self, user: &UserId, status: PresenceStatus) {
        self.inner.events.publish(ChatEvent::PresenceChanged {
            user_id: user.clone(),
            status,
        });
        self.inner
            .publisher
            .publish_best_effort(
                &Topic::Presence,
                None,
                BusEvent::Presence {
                    user_id: user.clone(),
                    status,
                },
            )
            .await;
    }

    /// Subscribe to `topic` unless a live subscription exists.
    async fn ensure_subscribed(&self, topic: &Topic) -> Result<(), BusError> {
        let mut subscriptions = self.inner.subscriptions.lock().await;
        if subscriptions.get(topic).is_some_and(Subscription::is_active) {
            return Ok(());
        }
        let relay = Arc::new(Relay {
            registry: self.inner.registry.clone(),
        });
        let subscription = self.inner.publisher.bus().subscribe(topic, relay).await?;
        subscriptions.insert(topic.clone(), subscription);
        log::debug!("Gateway: subscribed to {topic}");
        Ok(())
    }

    /// Drop the subscription to `topic` if no local connection needs it.
    /// Registry changes always happen before this is called, and the check
    /// runs under the subscription lock, so a concurrent join either sees
    /// the subscription or recreates it.
    async fn release_if_unused(&self, topic: &Topic) {
        let mut subscriptions = self.inner.subscriptions.lock().await;
        if !self.topic_needed(topic).await && subscriptions.remove(topic).is_some() {
            log::debug!("Gateway: unsubscribed from {topic}");
        }
    }

    async fn topic_needed(&self, topic: &Topic) -> bool {
        match topic {
            Topic::Room(chat) => self.inner.registry.has_room(chat).await,
            Topic::User(user) => self.inner.registry.has_user(user).await,
            Topic::Presence => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ChannelEventSink;
    use crate::model::DeliveryStatus;
    use crate::protocol::ServerEvent;
    use std::time::Duration;

    struct Peer {
        conn: ConnectionId,
        rx: mpsc::Receiver<Outbound>,
    }

    impl Peer {
        async fn next_event(&mut self) -> ServerEvent {
            loop {
                match tokio::time::timeout(Duration::from_secs(1), self.rx.recv()).await {
                    Ok(Some(Outbound::Event(event))) => return event,
                    Ok(Some(Outbound::Close(reason))) => panic!("unexpected close {reason:?}"),
                    Ok(None) => panic!("outbound queue closed"),
                    Err(_) => panic!("no event within 1s"),
                }
            }
        }

        /// Next event that is not a presence update.
        async fn next_chat_event(&mut self) -> ServerEvent {
            loop {
                let event = self.next_event().await;
                if !matches!(event, ServerEvent::PresenceUpdate { .. }) {
                    return event;
                }
            }
        }

        /// Let in-flight bus traffic land, then discard it.
        async fn settle(&mut self) {
            tokio::time::sleep(Duration::from_millis(20)).await;
            while self.rx.try_recv().is_ok() {}
        }
    }

    async fn gateway() -> (Gateway, mpsc::UnboundedReceiver<ChatEvent>) {
        let (events, rx) = ChannelEventSink::new();
        let gateway = Gateway::builder(GatewayConfig::for_testing())
            .events(Arc::new(events))
            .build()
            .await
            .unwrap();
        gateway.create_chat(Chat::direct("c1", "alice", "bob")).await.unwrap();
        (gateway, rx)
    }

    async fn connect(gateway: &Gateway, user: &str) -> Peer {
        let (tx, rx) = mpsc::channel(64);
        let conn = gateway.open_connection(user.into(), tx).await.unwrap();
        Peer { conn, rx }
    }

    #[tokio::test]
    async fn test_authenticate_with_sessions() {
        let (gateway, _events) = gateway().await;
        let session = gateway.sessions().unwrap().create("alice".into(), "web", None).await;
        assert_eq!(gateway.authenticate(&session.token).await.unwrap(), UserId::new("alice"));

        let err = gateway.authenticate("bogus").await.unwrap_err();
        assert_eq!(err.code(), "AUTHENTICATION_FAILURE");
        assert_eq!(gateway.stats().await.auth_failures, 1);
        assert_eq!(gateway.registry().len().await, 0);
    }

    #[tokio::test]
    async fn test_open_connection_marks_online_once() {
        let (gateway, mut events) = gateway().await;
        let _a1 = connect(&gateway, "alice").await;
        let _a2 = connect(&gateway, "alice").await;

        assert!(gateway.presence().is_online(&"alice".into()).await.unwrap());
        assert_eq!(gateway.presence().list_connections(&"alice".into()).await.unwrap().len(), 2);
        assert!(gateway.is_subscribed(&Topic::User("alice".into())).await);

        let mut online_changes = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, ChatEvent::PresenceChanged { status: PresenceStatus::Online, .. }) {
                online_changes += 1;
            }
        }
        assert_eq!(online_changes, 1);
    }

    #[tokio::test]
    async fn test_send_to_recipient_in_room() {
        let (gateway, _events) = gateway().await;
        let alice = connect(&gateway, "alice").await;
        let mut bob = connect(&gateway, "bob").await;
        gateway
            .handle_action(bob.conn, ClientAction::JoinRoom { chat_id: "c1".into() })
            .await
            .unwrap();

        let reply = gateway
            .handle_action(
                alice.conn,
                ClientAction::SendMessage {
                    chat_id: "c1".into(),
                    content: "hello".into(),
                },
            )
            .await
            .unwrap();
        let ActionReply::MessageAccepted { status, .. } = reply else {
            panic!("unexpected reply {reply:?}");
        };
        assert_eq!(status, DeliveryStatus::Delivered);

        match bob.next_chat_event().await {
            ServerEvent::Message(message) => assert_eq!(message.content, "hello"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_join_sweeps_pending_and_notifies_sender() {
        let (gateway, _events) = gateway().await;
        let mut alice = connect(&gateway, "alice").await;
        let bob = connect(&gateway, "bob").await;

        let reply = gateway
            .handle_action(
                alice.conn,
                ClientAction::SendMessage {
                    chat_id: "c1".into(),
                    content: "are you there".into(),
                },
            )
            .await
            .unwrap();
        let ActionReply::MessageAccepted { message_id, status } = reply else {
            panic!("unexpected reply {reply:?}");
        };
        assert_eq!(status, DeliveryStatus::Sent);
        alice.settle().await;

        gateway
            .handle_action(bob.conn, ClientAction::JoinRoom { chat_id: "c1".into() })
            .await
            .unwrap();
        assert_eq!(
            alice.next_chat_event().await,
            ServerEvent::StatusUpdate {
                message_id,
                chat_id: "c1".into(),
                status: DeliveryStatus::Delivered,
            }
        );

        // Joining again is a no-op.
        gateway
            .handle_action(bob.conn, ClientAction::JoinRoom { chat_id: "c1".into() })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(alice.rx.try_recv().is_err());
        assert_eq!(gateway.stats().await.status_transitions, 1);
    }

    #[tokio::test]
    async fn test_non_participant_rejected() {
        let (gateway, _events) = gateway().await;
        let mallory = connect(&gateway, "mallory").await;

        let err = gateway
            .handle_action(mallory.conn, ClientAction::JoinRoom { chat_id: "c1".into() })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NOT_A_PARTICIPANT");
        assert!(!gateway.is_subscribed(&Topic::Room("c1".into())).await);

        let err = gateway
            .handle_action(
                mallory.conn,
                ClientAction::SendMessage {
                    chat_id: "nope".into(),
                    content: "x".into(),
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "CHAT_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_invalid_requests() {
        let (gateway, _events) = gateway().await;
        let alice = connect(&gateway, "alice").await;
        let err = gateway
            .handle_action(
                alice.conn,
                ClientAction::SendMessage {
                    chat_id: "c1".into(),
                    content: String::new(),
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_REQUEST");

        let err = gateway
            .handle_action(
                alice.conn,
                ClientAction::FetchMessages {
                    chat_id: "c1".into(),
                    limit: Some(0),
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_REQUEST");

        let err = gateway
            .handle_action(ConnectionId::new(), ClientAction::ListOnline)
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::UnknownConnection));
    }

    #[tokio::test]
    async fn test_close_releases_everything() {
        let (gateway, mut events) = gateway().await;
        let bob = connect(&gateway, "bob").await;
        gateway
            .handle_action(bob.conn, ClientAction::JoinRoom { chat_id: "c1".into() })
            .await
            .unwrap();
        assert!(gateway.is_subscribed(&Topic::Room("c1".into())).await);

        assert!(gateway.close_connection(bob.conn, CloseReason::ClientClosed).await);
        assert!(!gateway.close_connection(bob.conn, CloseReason::ClientClosed).await);

        assert!(!gateway.presence().is_online(&"bob".into()).await.unwrap());
        assert!(!gateway.presence().is_reachable_in(&"bob".into(), &"c1".into()).await.unwrap());
        assert!(!gateway.is_subscribed(&Topic::Room("c1".into())).await);
        assert!(!gateway.is_subscribed(&Topic::User("bob".into())).await);
        assert!(gateway.is_subscribed(&Topic::Presence).await);

        let mut offline = 0;
        let mut closed = 0;
        while let Ok(event) = events.try_recv() {
            match event {
                ChatEvent::PresenceChanged { status: PresenceStatus::Offline, .. } => offline += 1,
                ChatEvent::ConnectionClosed { .. } => closed += 1,
                _ => {}
            }
        }
        assert_eq!((offline, closed), (1, 1));
        let stats = gateway.stats().await;
        assert_eq!(stats.connections_opened, 1);
        assert_eq!(stats.connections_closed, 1);
    }

    #[tokio::test]
    async fn test_second_device_keeps_user_online() {
        let (gateway, _events) = gateway().await;
        let mut alice = connect(&gateway, "alice").await;
        let phone = connect(&gateway, "bob").await;
        let laptop = connect(&gateway, "bob").await;
        alice.settle().await;

        gateway.close_connection(phone.conn, CloseReason::ClientClosed).await;
        assert!(gateway.presence().is_online(&"bob".into()).await.unwrap());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(alice.rx.try_recv().is_err());

        gateway.close_connection(laptop.conn, CloseReason::ClientClosed).await;
        assert_eq!(
            alice.next_event().await,
            ServerEvent::PresenceUpdate {
                user_id: "bob".into(),
                online: false,
                status: PresenceStatus::Offline,
            }
        );
    }

    #[tokio::test]
    async fn test_presence_actions() {
        let (gateway, _events) = gateway().await;
        let alice = connect(&gateway, "alice").await;
        let mut bob = connect(&gateway, "bob").await;
        bob.settle().await;

        let reply = gateway.handle_action(alice.conn, ClientAction::ListOnline).await.unwrap();
        assert_eq!(
            reply,
            ActionReply::OnlineUsers {
                user_ids: vec!["alice".into(), "bob".into()]
            }
        );

        gateway
            .handle_action(alice.conn, ClientAction::SetAway { away: true })
            .await
            .unwrap();
        assert_eq!(
            bob.next_event().await,
            ServerEvent::PresenceUpdate {
                user_id: "alice".into(),
                online: true,
                status: PresenceStatus::Away,
            }
        );

        let reply = gateway
            .handle_action(bob.conn, ClientAction::GetPresence { user_id: "alice".into() })
            .await
            .unwrap();
        let ActionReply::Presence { presence: Some(record) } = reply else {
            panic!("unexpected reply {reply:?}");
        };
        assert_eq!(record.status, PresenceStatus::Away);

        let reply = gateway
            .handle_action(bob.conn, ClientAction::GetPresence { user_id: "nobody".into() })
            .await
            .unwrap();
        assert_eq!(reply, ActionReply::Presence { presence: None });
    }

    #[tokio::test]
    async fn test_fetch_messages_newest_first() {
        let (gateway, _events) = gateway().await;
        let alice = connect(&gateway, "alice").await;
        for i in 0..3 {
            gateway
                .handle_action(
                    alice.conn,
                    ClientAction::SendMessage {
                        chat_id: "c1".into(),
                        content: format!("m{i}"),
                    },
                )
                .await
                .unwrap();
        }
        let reply = gateway
            .handle_action(
                alice.conn,
                ClientAction::FetchMessages {
                    chat_id: "c1".into(),
                    limit: Some(2),
                },
            )
            .await
            .unwrap();
        let ActionReply::Messages { messages } = reply else {
            panic!("unexpected reply {reply:?}");
        };
        let contents: Vec<_> = messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m2", "m1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_closes_idle_connections() {
        let (gateway, _events) = gateway().await;
        let mut idle = connect(&gateway, "alice").await;
        let active = connect(&gateway, "bob").await;

        tokio::time::advance(Duration::from_secs(20)).await;
        gateway.touch(active.conn).await;
        tokio::time::advance(Duration::from_secs(15)).await;

        let report = gateway.sweep().await;
        assert_eq!(report.idle_closed, 1);
        assert_eq!(report.leases_refreshed, 1);

        loop {
            match idle.rx.recv().await {
                Some(Outbound::Close(reason)) => {
                    assert_eq!(reason, CloseReason::IdleTimeout);
                    break;
                }
                Some(Outbound::Event(_)) => continue,
                None => panic!("closed without a close frame"),
            }
        }
        assert!(!gateway.presence().is_online(&"alice".into()).await.unwrap());
        assert!(gateway.presence().is_online(&"bob".into()).await.unwrap());
        assert_eq!(gateway.stats().await.idle_closures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_restores_lapsed_lease() {
        let (gateway, _events) = gateway().await;
        let bob = connect(&gateway, "bob").await;
        gateway
            .handle_action(bob.conn, ClientAction::JoinRoom { chat_id: "c1".into() })
            .await
            .unwrap();

        // Past online_ttl but keep the connection active.
        tokio::time::advance(Duration::from_secs(29)).await;
        gateway.touch(bob.conn).await;
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!gateway.presence().is_online(&"bob".into()).await.unwrap());

        gateway.sweep().await;
        assert!(gateway.presence().is_online(&"bob".into()).await.unwrap());
        assert!(gateway.presence().is_reachable_in(&"bob".into(), &"c1".into()).await.unwrap());
    }

    /// Memory presence with switchable faults.
    #[derive(Default)]
    struct FaultyPresence {
        inner: MemoryPresenceStore,
        fail_leave: std::sync::atomic::AtomicBool,
        online_delay_ms: AtomicU64,
    }

    #[async_trait]
    impl PresenceStore for FaultyPresence {
        async fn mark_online(&self, user: &UserId, conn: ConnectionId) -> crate::presence::PresenceResult<bool> {
            let delay = self.online_delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            self.inner.mark_online(user, conn).await
        }
        async fn mark_offline(&self, user: &UserId, conn: ConnectionId) -> crate::presence::PresenceResult<bool> {
            self.inner.mark_offline(user, conn).await
        }
        async fn join_room(&self, user: &UserId, conn: ConnectionId, room: &ChatId) -> crate::presence::PresenceResult<()> {
            self.inner.join_room(user, conn, room).await
        }
        async fn leave_room(&self, user: &UserId, conn: ConnectionId, room: &ChatId) -> crate::presence::PresenceResult<()> {
            if self.fail_leave.load(Ordering::SeqCst) {
                return Err(PresenceError::Backend("down".into()));
            }
            self.inner.leave_room(user, conn, room).await
        }
        async fn set_away(&self, user: &UserId, away: bool) -> crate::presence::PresenceResult<PresenceStatus> {
            self.inner.set_away(user, away).await
        }
        async fn is_online(&self, user: &UserId) -> crate::presence::PresenceResult<bool> {
            self.inner.is_online(user).await
        }
        async fn is_reachable_in(&self, user: &UserId, room: &ChatId) -> crate::presence::PresenceResult<bool> {
            self.inner.is_reachable_in(user, room).await
        }
        async fn list_online(&self) -> crate::presence::PresenceResult<std::collections::BTreeSet<UserId>> {
            self.inner.list_online().await
        }
        async fn get_presence(&self, user: &UserId) -> crate::presence::PresenceResult<Option<crate::presence::PresenceRecord>> {
            self.inner.get_presence(user).await
        }
        async fn list_connections(&self, user: &UserId) -> crate::presence::PresenceResult<std::collections::BTreeSet<ConnectionId>> {
            self.inner.list_connections(user).await
        }
    }

    /// Memory storage whose undelivered index is unavailable.
    #[derive(Default)]
    struct NoPendingIndex {
        inner: MemoryMessageStore,
    }

    #[async_trait]
    impl MessageStore for NoPendingIndex {
        async fn create_chat(&self, chat: Chat) -> crate::storage::StoreResult<Chat> {
            self.inner.create_chat(chat).await
        }
        async fn get_chat(&self, id: &ChatId) -> crate::storage::StoreResult<Option<Chat>> {
            self.inner.get_chat(id).await
        }
        async fn append_message(&self, message: crate::model::NewMessage) -> crate::storage::StoreResult<crate::model::Message> {
            self.inner.append_message(message).await
        }
        async fn get_message(&self, id: crate::model::MessageId) -> crate::storage::StoreResult<Option<crate::model::Message>> {
            self.inner.get_message(id).await
        }
        async fn list_undelivered(&self, _: &UserId, _: Option<&ChatId>) -> crate::storage::StoreResult<Vec<crate::model::Message>> {
            Err(StoreError::Backend("index offline".into()))
        }
        async fn update_status(
            &self,
            id: crate::model::MessageId,
            target: DeliveryStatus,
        ) -> crate::storage::StoreResult<crate::storage::StatusChange> {
            self.inner.update_status(id, target).await
        }
        async fn list_messages(&self, chat: &ChatId, limit: usize) -> crate::storage::StoreResult<Vec<crate::model::Message>> {
            self.inner.list_messages(chat, limit).await
        }
    }

    /// Local bus whose subscriber loops can all be ended at once, like a
    /// dropped pub/sub connection.
    struct SeverableBus {
        inner: LocalBus,
        sever: tokio::sync::watch::Sender<u64>,
    }

    impl SeverableBus {
        fn new() -> Self {
            Self {
                inner: LocalBus::new(64),
                sever: tokio::sync::watch::channel(0).0,
            }
        }

        fn sever(&self) {
            self.sever.send_modify(|generation| *generation += 1);
        }
    }

    #[async_trait]
    impl FanoutBus for SeverableBus {
        async fn publish(&self, topic: &Topic, envelope: &BusEnvelope) -> Result<usize, BusError> {
            self.inner.publish(topic, envelope).await
        }

        async fn subscribe(&self, topic: &Topic, handler: Arc<dyn BusHandler>) -> Result<Subscription, BusError> {
            let inner = self.inner.subscribe(topic, handler).await?;
            let mut severed = self.sever.subscribe();
            let task = tokio::spawn(async move {
                let _inner = inner;
                let _ = severed.changed().await;
            });
            Ok(Subscription::new(topic.clone(), task))
        }

        async fn prune(&self) -> usize {
            self.inner.prune().await
        }
    }

    async fn build(builder: GatewayBuilder) -> Gateway {
        let gateway = builder.build().await.unwrap();
        gateway.create_chat(Chat::direct("c1", "alice", "bob")).await.unwrap();
        gateway
    }

    async fn send(gateway: &Gateway, conn: ConnectionId, content: &str) -> DeliveryStatus {
        let reply = gateway
            .handle_action(
                conn,
                ClientAction::SendMessage {
                    chat_id: "c1".into(),
                    content: content.into(),
                },
            )
            .await
            .unwrap();
        match reply {
            ActionReply::MessageAccepted { status, .. } => status,
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_failed_presence_leave_keeps_room() {
        let presence = Arc::new(FaultyPresence::default());
        let gateway = build(Gateway::builder(GatewayConfig::for_testing()).presence(presence.clone())).await;
        let alice = connect(&gateway, "alice").await;
        let mut bob = connect(&gateway, "bob").await;
        gateway
            .handle_action(bob.conn, ClientAction::JoinRoom { chat_id: "c1".into() })
            .await
            .unwrap();

        presence.fail_leave.store(true, Ordering::SeqCst);
        let err = gateway
            .handle_action(bob.conn, ClientAction::LeaveRoom { chat_id: "c1".into() })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "TRANSIENT_INFRA");
        assert_eq!(gateway.registry().members_of_room(&"c1".into()).await, vec![bob.conn]);
        assert!(gateway.is_subscribed(&Topic::Room("c1".into())).await);

        // Reported DELIVERED, and really received.
        assert_eq!(send(&gateway, alice.conn, "still here?").await, DeliveryStatus::Delivered);
        assert!(matches!(bob.next_chat_event().await, ServerEvent::Message(_)));

        presence.fail_leave.store(false, Ordering::SeqCst);
        gateway
            .handle_action(bob.conn, ClientAction::LeaveRoom { chat_id: "c1".into() })
            .await
            .unwrap();
        assert_eq!(send(&gateway, alice.conn, "gone").await, DeliveryStatus::Sent);
    }

    #[tokio::test]
    async fn test_close_during_lease_refresh_stays_offline() {
        let presence = Arc::new(FaultyPresence::default());
        let gateway = build(Gateway::builder(GatewayConfig::for_testing()).presence(presence.clone())).await;
        let alice = connect(&gateway, "alice").await;
        let bob = connect(&gateway, "bob").await;
        gateway
            .handle_action(bob.conn, ClientAction::JoinRoom { chat_id: "c1".into() })
            .await
            .unwrap();

        presence.online_delay_ms.store(100, Ordering::SeqCst);
        let sweeping = {
            let gateway = gateway.clone();
            tokio::spawn(async move { gateway.sweep().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(gateway.close_connection(bob.conn, CloseReason::ClientClosed).await);
        let report = sweeping.await.unwrap();
        assert_eq!(report.leases_refreshed, 1);

        assert_eq!(gateway.registry().len().await, 1);
        assert!(!gateway.presence().is_online(&"bob".into()).await.unwrap());
        assert!(!gateway.presence().is_reachable_in(&"bob".into(), &"c1".into()).await.unwrap());
        presence.online_delay_ms.store(0, Ordering::SeqCst);
        assert_eq!(send(&gateway, alice.conn, "anyone?").await, DeliveryStatus::Sent);
    }

    #[tokio::test]
    async fn test_sweep_restores_ended_subscriptions() {
        let bus = Arc::new(SeverableBus::new());
        let gateway = build(Gateway::builder(GatewayConfig::for_testing()).bus(bus.clone())).await;
        let mut alice = connect(&gateway, "alice").await;
        let bob = connect(&gateway, "bob").await;
        alice.settle().await;

        bus.sever();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!gateway.is_subscribed(&Topic::Presence).await);

        let report = gateway.sweep().await;
        // presence, user:alice and user:bob
        assert_eq!(report.subscriptions_restored, 3);
        assert!(gateway.is_subscribed(&Topic::Presence).await);
        assert_eq!(gateway.sweep().await.subscriptions_restored, 0);

        gateway
            .handle_action(bob.conn, ClientAction::SetAway { away: true })
            .await
            .unwrap();
        assert_eq!(
            alice.next_event().await,
            ServerEvent::PresenceUpdate {
                user_id: "bob".into(),
                online: true,
                status: PresenceStatus::Away,
            }
        );
    }

    #[tokio::test]
    async fn test_join_succeeds_when_pending_sweep_fails() {
        let gateway = build(Gateway::builder(GatewayConfig::for_testing()).store(Arc::new(NoPendingIndex::default()))).await;
        let alice = connect(&gateway, "alice").await;
        let bob = connect(&gateway, "bob").await;
        assert_eq!(send(&gateway, alice.conn, "early").await, DeliveryStatus::Sent);

        let reply = gateway
            .handle_action(bob.conn, ClientAction::JoinRoom { chat_id: "c1".into() })
            .await
            .unwrap();
        assert_eq!(reply, ActionReply::ok());
        assert!(gateway.presence().is_reachable_in(&"bob".into(), &"c1".into()).await.unwrap());
        assert_eq!(send(&gateway, alice.conn, "now").await, DeliveryStatus::Delivered);
    }

    #[test]
    fn test_local_bus_never_smaller_than_outbound_queue() {
        let config = GatewayConfig {
            bus_capacity: 8,
            outbound_buffer: 256,
            ..GatewayConfig::for_testing()
        };
        assert_eq!(local_bus_capacity(&config), 256);
        assert_eq!(local_bus_capacity(&GatewayConfig::default()), 1024);
    }

    #[tokio::test]
    async fn test_maintenance_stops_with_gateway() {
        let (gateway, _events) = gateway().await;
        let handle = gateway.spawn_maintenance();
        drop(gateway);
        tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
    }
}
