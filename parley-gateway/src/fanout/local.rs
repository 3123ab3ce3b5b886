//! In-process bus over tokio broadcast channels.
//!
//! One broadcast channel per topic, created on first subscribe. Payloads are
//! encoded once and shared as `Arc<Vec<u8>>`, so sending to N subscribers is
//! one encode and N refcount bumps. Suitable for single-process deployments
//! and tests; multi-process deployments use the Redis bus.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, RwLock};

use super::{dispatch, BusHandler, FanoutBus, Subscription, Topic};
use crate::error::BusError;
use crate::protocol::BusEnvelope;

/// Bus health counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BusStats {
    pub messages_published: u64,
    pub messages_dropped: u64,
    pub active_topics: usize,
}

struct AtomicBusStats {
    messages_published: AtomicU64,
    messages_dropped: AtomicU64,
}

/// Broadcast-channel [`FanoutBus`].
pub struct LocalBus {
    topics: RwLock<HashMap<Topic, broadcast::Sender<Arc<Vec<u8>>>>>,
    capacity: usize,
    stats: Arc<AtomicBusStats>,
}

impl LocalBus {
    /// `capacity` is how many messages a subscriber may fall behind before
    /// it starts losing them. Lost messages are counted in
    /// [`BusStats::messages_dropped`]; clients recover them with
    /// `fetch-messages`.
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            stats: Arc::new(AtomicBusStats {
                messages_published: AtomicU64::new(0),
                messages_dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Receiver on the topic's channel, creating the channel if needed.
    /// The receiver is taken under the map lock so `prune` never sees the
    /// new channel without it.
    async fn receiver(&self, topic: &Topic) -> broadcast::Receiver<Arc<Vec<u8>>> {
        {
            let topics = self.topics.read().await;
            if let Some(sender) = topics.get(topic) {
                return sender.subscribe();
            }
        }

        let mut topics = self.topics.write().await;
        topics
            .entry(topic.clone())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    pub async fn subscriber_count(&self, topic: &Topic) -> usize {
        self.topics
            .read()
            .await
            .get(topic)
            .map_or(0, |s| s.receiver_count())
    }

    pub async fn stats(&self) -> BusStats {
        BusStats {
            messages_published: self.stats.messages_published.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            active_topics: self.topics.read().await.len(),
        }
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl FanoutBus for LocalBus {
    async fn publish(&self, topic: &Topic, envelope: &BusEnvelope) -> Result<usize, BusError> {
        let sender = {
            let topics = self.topics.read().await;
            match topics.get(topic) {
                Some(sender) => sender.clone(),
                None => return Ok(0),
            }
        };
        let bytes = envelope
            .encode()
            .map_err(|e| BusError::Serialization(e.to_string()))?;
        let count = sender.send(Arc::new(bytes)).unwrap_or(0);
        self.stats.messages_published.fetch_add(1, Ordering::Relaxed);
        Ok(count)
    }

    async fn subscribe(&self, topic: &Topic, handler: Arc<dyn BusHandler>) -> Result<Subscription, BusError> {
        // Subscribe before spawning so nothing published after this call
        // returns can be missed.
        let mut rx = self.receiver(topic).await;
        let stats = self.stats.clone();
        let task_topic = topic.clone();

        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(bytes) => dispatch(&task_topic, &bytes, handler.as_ref()).await,
                    Err(RecvError::Lagged(skipped)) => {
                        stats.messages_dropped.fetch_add(skipped, Ordering::Relaxed);
                        log::warn!("Bus: subscriber on {task_topic} lagged, dropped {skipped} messages");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
        Ok(Subscription::new(topic.clone(), task))
    }

    async fn prune(&self) -> usize {
        let mut topics = self.topics.write().await;
        let before = topics.len();
        topics.retain(|_, sender| sender.receiver_count() > 0);
        before - topics.len()
    }
}
