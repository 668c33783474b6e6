use lru::LruCache;
use std::num::NonZeroUsize;

use crate::crdt::limits::REPLAY_CACHE_CAPACITY;

/// LRU window of inbound payload hashes for one logical channel.
///
/// Payload hash → first-seen timestamp (ms). Exact re-deliveries inside the
/// window are dropped before decoding; anything older falls through to the
/// merge cache, whose own dedup set makes it a no-op anyway.
pub struct ReplayCache {
    cache: LruCache<[u8; 32], u64>,
}

impl Default for ReplayCache {
    fn default() -> Self {
        Self::new(REPLAY_CACHE_CAPACITY)
    }
}

impl ReplayCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        ReplayCache {
            cache: LruCache::new(capacity),
        }
    }

    /// Check if a payload is a replay, and insert if not.
    ///
    /// Returns true if the payload is NEW (should be processed).
    pub fn check_and_insert(&mut self, payload_hash: [u8; 32], now_ms: u64) -> bool {
        if self.cache.contains(&payload_hash) {
            log::debug!(
                "Duplicate payload {} dropped",
                hex::encode(&payload_hash[..8])
            );
            return false;
        }
        self.cache.put(payload_hash, now_ms);
        true
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn clear(&mut self) {
        self.cache.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replay_detection() {
        let mut cache = ReplayCache::default();
        assert!(cache.check_and_insert([2u8; 32], 1));
        assert!(!cache.check_and_insert([2u8; 32], 2));
        assert!(cache.check_and_insert([3u8; 32], 3));
    }

    #[test]
    fn test_eviction_reopens_window() {
        let mut cache = ReplayCache::new(2);
        assert!(cache.check_and_insert([1u8; 32], 1));
        assert!(cache.check_and_insert([2u8; 32], 2));
        assert!(cache.check_and_insert([3u8; 32], 3));
        assert_eq!(cache.len(), 2);
        // [1] was evicted
        assert!(cache.check_and_insert([1u8; 32], 4));
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let mut cache = ReplayCache::new(0);
        assert!(cache.check_and_insert([9u8; 32], 1));
        assert!(!cache.check_and_insert([9u8; 32], 2));
    }
}
