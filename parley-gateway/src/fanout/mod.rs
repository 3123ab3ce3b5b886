//! Fan-out bus: relays events between gateway processes.
//!
//! A connection is attached to exactly one process, but the users it talks
//! to may be attached anywhere. Every event that targets a room, a user or
//! the presence channel is published to the bus; each process subscribes
//! only to the topics its local connections need and forwards what arrives
//! to its local registry.
//!
//! ```text
//!   process A                    bus                     process B
//!   publish(room:c1) ───────▶ [room:c1] ───────▶ handler → registry → sockets
//!   publish(user:bob) ──────▶ [user:bob] ──────▶ handler → registry → sockets
//! ```
//!
//! Publishing is fire-and-forget. A slow subscriber drops messages
//! (broadcast lag) rather than stalling publishers.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::BusError;
use crate::model::{ChatId, ConnectionId, UserId};
use crate::protocol::{BusEnvelope, BusEvent};

pub mod local;
#[cfg(feature = "redis")]
pub mod redis_bus;

pub use local::{BusStats, LocalBus};
#[cfg(feature = "redis")]
pub use redis_bus::RedisBus;

/// A bus channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Topic {
    /// Everything posted to a chat's room.
    Room(ChatId),
    /// Events addressed to every connection of one user.
    User(UserId),
    /// Presence transitions of all users.
    Presence,
}

impl Topic {
    pub fn channel_name(&self) -> String {
        match self {
            Topic::Room(chat) => format!("room:{chat}"),
            Topic::User(user) => format!("user:{user}"),
            Topic::Presence => "presence".to_string(),
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.channel_name())
    }
}

/// Receives envelopes for one subscription, in publish order.
#[async_trait]
pub trait BusHandler: Send + Sync + 'static {
    async fn handle(&self, topic: &Topic, envelope: BusEnvelope);
}

/// A live subscription. Dropping it stops delivery.
pub struct Subscription {
    topic: Topic,
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn new(topic: Topic, task: JoinHandle<()>) -> Self {
        Self { topic, task }
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Transport between gateway processes.
#[async_trait]
pub trait FanoutBus: Send + Sync {
    /// Publish to a topic. Returns how many subscribers the backend reports
    /// receiving it; zero is not an error.
    async fn publish(&self, topic: &Topic, envelope: &BusEnvelope) -> Result<usize, BusError>;

    /// Start delivering a topic to `handler`. The subscription is active
    /// when this returns.
    async fn subscribe(&self, topic: &Topic, handler: Arc<dyn BusHandler>) -> Result<Subscription, BusError>;

    /// Release per-topic resources nobody listens to. Returns how many.
    async fn prune(&self) -> usize {
        0
    }
}

/// Decode one raw payload and hand it to the handler. Undecodable payloads
/// are logged and skipped.
pub(crate) async fn dispatch(topic: &Topic, bytes: &[u8], handler: &dyn BusHandler) {
    match BusEnvelope::decode(bytes) {
        Ok(envelope) => handler.handle(topic, envelope).await,
        Err(e) => log::warn!("Bus: dropping undecodable payload on {topic}: {e}"),
    }
}

/// Stamps envelopes with this process's id and bounds publish latency.
#[derive(Clone)]
pub struct Publisher {
    bus: Arc<dyn FanoutBus>,
    process_id: Uuid,
    timeout: Duration,
}

impl Publisher {
    pub fn new(bus: Arc<dyn FanoutBus>, process_id: Uuid, timeout: Duration) -> Self {
        Self {
            bus,
            process_id,
            timeout,
        }
    }

    pub fn process_id(&self) -> Uuid {
        self.process_id
    }

    pub fn bus(&self) -> &Arc<dyn FanoutBus> {
        &self.bus
    }

    pub async fn publish(
        &self,
        topic: &Topic,
        origin_connection: Option<ConnectionId>,
        event: BusEvent,
    ) -> Result<usize, BusError> {
        let envelope = BusEnvelope::new(self.process_id, origin_connection, event);
        match tokio::time::timeout(self.timeout, self.bus.publish(topic, &envelope)).await {
            Ok(result) => result,
            Err(_) => Err(BusError::Timeout),
        }
    }

    /// Publish without surfacing failure: persisted state is already
    /// correct, so a lost notification is logged and reconciled by clients
    /// on their next fetch.
    pub async fn publish_best_effort(
        &self,
        topic: &Topic,
        origin_connection: Option<ConnectionId>,
        event: BusEvent,
    ) -> bool {
        match self.publish(topic, origin_connection, event).await {
            Ok(_) => true,
            Err(e) => {
                log::warn!("Bus: publish to {topic} failed: {e}");
                false
            }
        }
    }
}
