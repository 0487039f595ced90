//! In-memory cache tier
//!
//! An LRU bounded by item count and by total byte weight. Expired
//! entries are dropped at lookup time; over-budget entries evict from
//! the cold end.

use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;

use super::entry::CacheEntry;
use super::fingerprint::Fingerprint;

pub struct MemoryTier {
    inner: Mutex<Inner>,
    max_bytes: u64,
}

struct Inner {
    map: LruCache<Fingerprint, Arc<CacheEntry>>,
    bytes: u64,
}

impl MemoryTier {
    #[must_use]
    pub fn new(max_items: usize, max_bytes: u64) -> Self {
        let capacity = NonZeroUsize::new(max_items.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(Inner {
                map: LruCache::new(capacity),
                bytes: 0,
            }),
            max_bytes,
        }
    }

    /// Fresh entry or, when `allow_stale`, an expired one (flagged).
    pub fn get(&self, key: &Fingerprint, allow_stale: bool) -> Option<(Arc<CacheEntry>, bool)> {
        let mut inner = self.inner.lock();
        let entry = inner.map.get(key)?.clone();
        let fresh = !entry.is_expired();
        if fresh || allow_stale {
            return Some((entry, fresh));
        }
        if let Some(removed) = inner.map.pop(key) {
            inner.bytes = inner.bytes.saturating_sub(removed.weight());
        }
        None
    }

    pub fn put(&self, key: Fingerprint, entry: Arc<CacheEntry>) {
        let weight = entry.weight();
        let mut inner = self.inner.lock();
        if let Some(previous) = inner.map.put(key, entry) {
            inner.bytes = inner.bytes.saturating_sub(previous.weight());
        }
        inner.bytes = inner.bytes.saturating_add(weight);
        while inner.bytes > self.max_bytes && inner.map.len() > 1 {
            if let Some((_, evicted)) = inner.map.pop_lru() {
                inner.bytes = inner.bytes.saturating_sub(evicted.weight());
            } else {
                break;
            }
        }
    }

    pub fn remove(&self, key: &Fingerprint) {
        let mut inner = self.inner.lock();
        if let Some(removed) = inner.map.pop(key) {
            inner.bytes = inner.bytes.saturating_sub(removed.weight());
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn bytes(&self) -> u64 {
        self.inner.lock().bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::entry::CacheEntry;
    use crate::guard::CanonicalUrl;
    use std::time::Duration;

    fn entry(body: &str, ttl: Duration) -> Arc<CacheEntry> {
        let url = CanonicalUrl::parse("https://example.com/").expect("url");
        Arc::new(CacheEntry::from_parts(&url, 200, vec![], body.as_bytes(), ttl))
    }

    fn key(n: u8) -> Fingerprint {
        let url = CanonicalUrl::parse(&format!("https://example.com/{n}")).expect("url");
        Fingerprint::for_get(&url)
    }

    #[test]
    fn put_then_get_within_ttl() {
        let tier = MemoryTier::new(10, 1 << 20);
        tier.put(key(1), entry("hello", Duration::from_secs(60)));
        let (hit, fresh) = tier.get(&key(1), false).expect("hit");
        assert!(fresh);
        assert_eq!(hit.response.body_bytes(), b"hello");
    }

    #[test]
    fn expired_entry_is_a_miss_unless_stale_allowed() {
        let tier = MemoryTier::new(10, 1 << 20);
        tier.put(key(1), entry("old", Duration::ZERO));
        assert!(tier.get(&key(1), false).is_none());

        tier.put(key(2), entry("old", Duration::ZERO));
        let (_, fresh) = tier.get(&key(2), true).expect("stale hit");
        assert!(!fresh);
    }

    #[test]
    fn item_cap_evicts_lru() {
        let tier = MemoryTier::new(2, 1 << 20);
        tier.put(key(1), entry("a", Duration::from_secs(60)));
        tier.put(key(2), entry("b", Duration::from_secs(60)));
        // Touch key 1 so key 2 is the cold one.
        let _ = tier.get(&key(1), false);
        tier.put(key(3), entry("c", Duration::from_secs(60)));
        assert!(tier.get(&key(2), false).is_none());
        assert!(tier.get(&key(1), false).is_some());
    }

    #[test]
    fn byte_budget_evicts() {
        let big = "x".repeat(600);
        let tier = MemoryTier::new(100, 1_000);
        tier.put(key(1), entry(&big, Duration::from_secs(60)));
        tier.put(key(2), entry(&big, Duration::from_secs(60)));
        assert!(tier.len() < 2, "byte budget should have evicted one entry");
        assert!(tier.bytes() <= 1_000 + big.len() as u64);
    }
}
