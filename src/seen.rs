//! Bounded, time-expiring set of message ids.
//!
//! Shared by the relay router and the broadcast disseminator. Capacity is
//! enforced by LRU eviction; entries older than the TTL count as unseen, so a
//! very old duplicate may be processed again after expiry.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;

use crate::messages::MessageId;

/// Time-to-live for seen entries.
pub const DEFAULT_SEEN_TTL: Duration = Duration::from_secs(120);

/// Maximum number of tracked message ids.
/// SECURITY: Bounds memory regardless of message rate.
pub const DEFAULT_SEEN_CAPACITY: usize = 10_000;

pub struct SeenCache {
    entries: LruCache<MessageId, Instant>,
    ttl: Duration,
}

impl SeenCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(cap),
            ttl,
        }
    }

    /// Record `id` as seen. Returns `true` if it was not already (live) in the set.
    pub fn insert(&mut self, id: MessageId) -> bool {
        let now = Instant::now();
        if let Some(seen_at) = self.entries.get(&id)
            && now.duration_since(*seen_at) < self.ttl
        {
            return false;
        }
        self.entries.put(id, now);
        true
    }

    #[cfg(test)]
    pub fn contains(&self, id: &MessageId) -> bool {
        self.entries
            .peek(id)
            .is_some_and(|seen_at| seen_at.elapsed() < self.ttl)
    }

    /// Drop expired entries from the least recently used end.
    pub fn evict_expired(&mut self) -> usize {
        let mut evicted = 0;
        while let Some((_, seen_at)) = self.entries.peek_lru() {
            if seen_at.elapsed() < self.ttl {
                break;
            }
            self.entries.pop_lru();
            evicted += 1;
        }
        evicted
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
