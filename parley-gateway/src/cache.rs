//! Read-through cache for message lookups.
//!
//! Read-acks and status updates look up the same recent messages over and
//! over; this bounded LRU keeps them close. Entries also carry a TTL so a
//! status advanced by another process is picked up within `ttl` even if this
//! process never observes the write. The cache is advisory: every status
//! transition still goes through the store's compare-and-set.

use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

use crate::model::{Message, MessageId};

struct CachedMessage {
    message: Message,
    inserted_at: Instant,
}

/// Cache hit/miss counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

struct CacheInner {
    entries: LruCache<MessageId, CachedMessage>,
    hits: u64,
    misses: u64,
}

pub struct MessageCache {
    inner: Mutex<CacheInner>,
    ttl: Duration,
}

impl MessageCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(CacheInner {
                entries: LruCache::new(capacity),
                hits: 0,
                misses: 0,
            }),
            ttl,
        }
    }

    pub fn get(&self, id: &MessageId) -> Option<Message> {
        let Ok(mut inner) = self.inner.lock() else {
            return None;
        };
        let fresh = inner
            .entries
            .get(id)
            .filter(|c| c.inserted_at.elapsed() < self.ttl)
            .map(|c| c.message.clone());
        match fresh {
            Some(message) => {
                inner.hits += 1;
                Some(message)
            }
            None => {
                inner.entries.pop(id);
                inner.misses += 1;
                None
            }
        }
    }

    /// Insert or replace. Never replaces a newer status with an older one.
    pub fn put(&self, message: Message) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        if let Some(existing) = inner.entries.peek(&message.id) {
            if existing.message.status > message.status && existing.inserted_at.elapsed() < self.ttl {
                return;
            }
        }
        inner.entries.put(
            message.id,
            CachedMessage {
                message,
                inserted_at: Instant::now(),
            },
        );
    }

    pub fn invalidate(&self, id: &MessageId) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.entries.pop(id);
        }
    }

    pub fn stats(&self) -> CacheStats {
        self.inner
            .lock()
            .map(|inner| CacheStats {
                hits: inner.hits,
                misses: inner.misses,
                entries: inner.entries.len(),
            })
            .unwrap_or_default()
    }
}
