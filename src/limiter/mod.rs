//! Per-host rate limiting and the global in-flight cap
//!
//! Each host gets an independent token bucket (capacity = burst,
//! refill = configured rps) so no single host can starve the others. A
//! robots.txt `Crawl-delay` tightens a host's bucket to one token per
//! delay period. A global semaphore bounds concurrent fetches across
//! all hosts; the permit is carried by [`InflightPermit`] and released
//! on drop.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::config::RateLimitConfig;
use crate::error::{HarvestError, HarvestResult};

/// Token bucket with fractional tokens so sub-1 rps rates work.
#[derive(Debug)]
struct Bucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(capacity: f64, refill_per_sec: f64) -> Self {
        Self {
            tokens: capacity,
            capacity,
            refill_per_sec,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
            self.last_refill = now;
        }
    }

    /// Try to take one token; on failure return how long until one
    /// accumulates.
    fn try_take(&mut self, now: Instant) -> Result<(), Duration> {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            let missing = 1.0 - self.tokens;
            let wait = if self.refill_per_sec > 0.0 {
                missing / self.refill_per_sec
            } else {
                1.0
            };
            Err(Duration::from_secs_f64(wait))
        }
    }

    /// Apply a crawl-delay override: one request per `delay`, no burst.
    fn constrain_to_delay(&mut self, delay: Duration) {
        let rate = 1.0 / delay.as_secs_f64().max(0.001);
        if rate < self.refill_per_sec {
            self.refill_per_sec = rate;
            self.capacity = 1.0;
            self.tokens = self.tokens.min(1.0);
        }
    }
}

/// Holds the global in-flight slot for one fetch.
#[derive(Debug)]
pub struct InflightPermit {
    _permit: OwnedSemaphorePermit,
}

/// Per-host token buckets plus the global concurrency cap.
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: DashMap<String, Arc<Mutex<Bucket>>>,
    global: Arc<Semaphore>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        let global = Arc::new(Semaphore::new(config.global_inflight));
        Self {
            config,
            buckets: DashMap::new(),
            global,
        }
    }

    fn bucket_for(&self, host: &str) -> Arc<Mutex<Bucket>> {
        Arc::clone(
            self.buckets
                .entry(host.to_ascii_lowercase())
                .or_insert_with(|| {
                    Arc::new(Mutex::new(Bucket::new(
                        f64::from(self.config.burst).max(1.0),
                        self.config.rps,
                    )))
                })
                .value(),
        )
    }

    /// Tighten a host's bucket to honor a robots.txt crawl-delay.
    pub fn apply_crawl_delay(&self, host: &str, delay: Duration) {
        let bucket = self.bucket_for(host);
        bucket.lock().constrain_to_delay(delay);
    }

    /// Wait for a host token and a global in-flight slot.
    ///
    /// Returns a permit that must be held for the duration of the
    /// fetch. Honors cancellation at every wait.
    pub async fn acquire(
        &self,
        host: &str,
        cancel: &CancellationToken,
    ) -> HarvestResult<InflightPermit> {
        let bucket = self.bucket_for(host);

        loop {
            let wait = {
                let mut b = bucket.lock();
                match b.try_take(Instant::now()) {
                    Ok(()) => None,
                    Err(wait) => Some(wait),
                }
            };
            match wait {
                None => break,
                Some(wait) => {
                    trace!(host = %host, wait_ms = wait.as_millis() as u64, "rate limited");
                    tokio::select! {
                        () = tokio::time::sleep(wait) => {}
                        () = cancel.cancelled() => return Err(HarvestError::Cancelled),
                    }
                }
            }
        }

        let permit = tokio::select! {
            permit = Arc::clone(&self.global).acquire_owned() => {
                permit.map_err(|_| HarvestError::internal("rate limiter semaphore closed"))?
            }
            () = cancel.cancelled() => return Err(HarvestError::Cancelled),
        };

        Ok(InflightPermit { _permit: permit })
    }

    /// Fetches currently holding an in-flight slot.
    #[must_use]
    pub fn inflight(&self) -> usize {
        self.config
            .global_inflight
            .saturating_sub(self.global.available_permits())
    }

    /// Hosts with an active bucket.
    #[must_use]
    pub fn tracked_hosts(&self) -> usize {
        self.buckets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(rps: f64, burst: u32, inflight: usize) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            rps,
            burst,
            global_inflight: inflight,
        })
    }

    #[tokio::test]
    async fn burst_tokens_are_immediate() {
        let limiter = limiter(1.0, 3, 10);
        let cancel = CancellationToken::new();
        let start = Instant::now();
        for _ in 0..3 {
            let _permit = limiter.acquire("example.com", &cancel).await.expect("token");
        }
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn exhausted_bucket_waits_for_refill() {
        let limiter = limiter(10.0, 1, 10);
        let cancel = CancellationToken::new();
        let _first = limiter.acquire("example.com", &cancel).await.expect("first");
        let start = Instant::now();
        let _second = limiter.acquire("example.com", &cancel).await.expect("second");
        // 10 rps means roughly 100ms to refill one token.
        assert!(start.elapsed() >= Duration::from_millis(80));
    }

    #[tokio::test]
    async fn hosts_do_not_contend() {
        let limiter = limiter(0.001, 1, 10);
        let cancel = CancellationToken::new();
        let _a = limiter.acquire("a.example", &cancel).await.expect("a");
        // b.example has its own bucket and is not starved by a.example.
        let start = Instant::now();
        let _b = limiter.acquire("b.example", &cancel).await.expect("b");
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn cancellation_unblocks_waiter() {
        let limiter = limiter(0.001, 1, 10);
        let cancel = CancellationToken::new();
        let _only = limiter.acquire("slow.example", &cancel).await.expect("only");

        cancel.cancel();
        let err = limiter.acquire("slow.example", &cancel).await.unwrap_err();
        assert_eq!(err.kind(), "Cancelled");
    }

    #[tokio::test]
    async fn global_cap_limits_inflight() {
        let limiter = Arc::new(limiter(100.0, 100, 2));
        let cancel = CancellationToken::new();
        let p1 = limiter.acquire("x.example", &cancel).await.expect("p1");
        let _p2 = limiter.acquire("y.example", &cancel).await.expect("p2");
        assert_eq!(limiter.inflight(), 2);

        drop(p1);
        // Permit released; a third acquire proceeds.
        let _p3 = limiter.acquire("z.example", &cancel).await.expect("p3");
    }

    #[tokio::test]
    async fn crawl_delay_tightens_bucket() {
        let limiter = limiter(10.0, 5, 10);
        limiter.apply_crawl_delay("polite.example", Duration::from_millis(300));
        let cancel = CancellationToken::new();
        let _first = limiter.acquire("polite.example", &cancel).await.expect("first");
        let start = Instant::now();
        let _second = limiter.acquire("polite.example", &cancel).await.expect("second");
        assert!(start.elapsed() >= Duration::from_millis(250));
    }
}
