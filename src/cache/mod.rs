//! Two-tier response cache
//!
//! Lookups probe the in-memory LRU first, then the disk tier; a disk
//! hit warms memory. Writes land in both tiers (the disk write runs on
//! the blocking pool). Keys are request [`Fingerprint`]s, so method and
//! body participate in identity. An expired entry is never returned
//! unless the caller explicitly opts into stale-while-revalidate.

pub mod disk;
pub mod entry;
pub mod fingerprint;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::CacheConfig;
use crate::error::HarvestResult;

pub use disk::DiskTier;
pub use entry::{Artifact, CacheEntry, StoredResponse};
pub use fingerprint::Fingerprint;
use memory::MemoryTier;

pub mod memory;

/// Outcome of a cache probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Stale,
    Miss,
}

pub struct TieredCache {
    l1: MemoryTier,
    l2: Option<Arc<DiskTier>>,
    default_ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl TieredCache {
    pub fn new(config: &CacheConfig, data_dir: &std::path::Path) -> HarvestResult<Self> {
        let l2 = if config.l2_enabled {
            let root: PathBuf = config
                .l2_path
                .clone()
                .unwrap_or_else(|| data_dir.join("cache"));
            Some(Arc::new(DiskTier::new(root)?))
        } else {
            None
        };
        Ok(Self {
            l1: MemoryTier::new(config.l1_items, config.l1_bytes),
            l2,
            default_ttl: Duration::from_millis(config.ttl_ms),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        })
    }

    /// Memory-only cache for tests and ephemeral runs.
    #[must_use]
    pub fn memory_only(max_items: usize, max_bytes: u64, default_ttl: Duration) -> Self {
        Self {
            l1: MemoryTier::new(max_items, max_bytes),
            l2: None,
            default_ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Probe both tiers. A disk hit is promoted into memory.
    pub async fn get(
        &self,
        key: &Fingerprint,
        allow_stale: bool,
    ) -> Option<(Arc<CacheEntry>, CacheStatus)> {
        if let Some((entry, fresh)) = self.l1.get(key, allow_stale) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, fresh, "cache hit (memory)");
            let status = if fresh { CacheStatus::Hit } else { CacheStatus::Stale };
            return Some((entry, status));
        }

        if let Some(l2) = &self.l2 {
            let l2 = Arc::clone(l2);
            let key_copy = *key;
            let from_disk = tokio::task::spawn_blocking(move || l2.read(&key_copy, allow_stale))
                .await
                .ok()
                .flatten();
            if let Some((entry, fresh)) = from_disk {
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, fresh, "cache hit (disk)");
                let entry = Arc::new(entry);
                self.l1.put(*key, Arc::clone(&entry));
                let status = if fresh { CacheStatus::Hit } else { CacheStatus::Stale };
                return Some((entry, status));
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Store an entry in both tiers.
    pub async fn put(&self, key: Fingerprint, entry: CacheEntry) {
        let shared = Arc::new(entry);
        self.l1.put(key, Arc::clone(&shared));
        if let Some(l2) = &self.l2 {
            let l2 = Arc::clone(l2);
            let for_disk = Arc::clone(&shared);
            let write = tokio::task::spawn_blocking(move || l2.write(&key, &for_disk)).await;
            match write {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(key = %key, error = %e, "disk cache write failed"),
                Err(e) => warn!(key = %key, error = %e, "disk cache write join failed"),
            }
        }
    }

    /// Drop an entry from both tiers.
    pub async fn invalidate(&self, key: &Fingerprint) {
        self.l1.remove(key);
        if let Some(l2) = &self.l2 {
            let l2 = Arc::clone(l2);
            let key_copy = *key;
            let _ = tokio::task::spawn_blocking(move || l2.remove(&key_copy)).await;
        }
    }

    /// (hits, misses) since startup.
    #[must_use]
    pub fn counters(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }

    #[must_use]
    pub fn l1_len(&self) -> usize {
        self.l1.len()
    }

    #[must_use]
    pub fn l1_bytes(&self) -> u64 {
        self.l1.bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard::CanonicalUrl;

    fn sample(path: &str, ttl: Duration) -> (Fingerprint, CacheEntry) {
        let url =
            CanonicalUrl::parse(&format!("https://example.com{path}")).expect("url");
        let entry = CacheEntry::from_parts(&url, 200, vec![], path.as_bytes(), ttl);
        (Fingerprint::for_get(&url), entry)
    }

    #[tokio::test]
    async fn miss_then_hit() {
        let cache = TieredCache::memory_only(16, 1 << 20, Duration::from_secs(60));
        let (key, entry) = sample("/a", Duration::from_secs(60));
        assert!(cache.get(&key, false).await.is_none());
        cache.put(key, entry).await;
        let (hit, status) = cache.get(&key, false).await.expect("hit");
        assert_eq!(status, CacheStatus::Hit);
        assert_eq!(hit.response.body_bytes(), b"/a");
        assert_eq!(cache.counters(), (1, 1));
    }

    #[tokio::test]
    async fn disk_hit_warms_memory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = CacheConfig {
            l1_items: 16,
            l1_bytes: 1 << 20,
            ttl_ms: 60_000,
            l2_path: Some(dir.path().join("l2")),
            l2_enabled: true,
        };
        let cache = TieredCache::new(&config, dir.path()).expect("cache");
        let (key, entry) = sample("/warm", Duration::from_secs(60));
        cache.put(key, entry).await;

        // Simulate a cold L1 by rebuilding the cache over the same L2.
        let cache = TieredCache::new(&config, dir.path()).expect("cache");
        assert_eq!(cache.l1_len(), 0);
        let (_, status) = cache.get(&key, false).await.expect("disk hit");
        assert_eq!(status, CacheStatus::Hit);
        assert_eq!(cache.l1_len(), 1, "L1 warmed from disk");
    }

    #[tokio::test]
    async fn stale_entries_surface_only_on_request() {
        let cache = TieredCache::memory_only(16, 1 << 20, Duration::from_secs(60));
        let (key, entry) = sample("/stale", Duration::ZERO);
        cache.put(key, entry).await;
        assert!(cache.get(&key, false).await.is_none());

        let (key, entry) = sample("/stale2", Duration::ZERO);
        cache.put(key, entry).await;
        let (_, status) = cache.get(&key, true).await.expect("stale");
        assert_eq!(status, CacheStatus::Stale);
    }

    #[tokio::test]
    async fn invalidate_removes_everywhere() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = CacheConfig {
            l2_path: Some(dir.path().join("l2")),
            ..CacheConfig::default()
        };
        let cache = TieredCache::new(&config, dir.path()).expect("cache");
        let (key, entry) = sample("/gone", Duration::from_secs(60));
        cache.put(key, entry).await;
        cache.invalidate(&key).await;
        assert!(cache.get(&key, false).await.is_none());
        // A miss after invalidation also proves L2 deletion (no warm).
        assert_eq!(cache.l1_len(), 0);
    }
}
