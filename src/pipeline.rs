//! The shared extraction pipeline
//!
//! Every fetch-based tool and the crawler run the same flow:
//! guard -> cache probe -> robots -> rate limit -> fetch (retries,
//! breaker) -> cache store -> artifact extraction on the worker pool.
//! The pipeline owns the shared components and hands references to the
//! subsystems layered on top (crawler, research, tracker, tools).

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cache::{CacheEntry, CacheStatus, Fingerprint, TieredCache};
use crate::config::EngineConfig;
use crate::error::{HarvestError, HarvestResult};
use crate::extract::{ContentExtractor, HtmlExtractor};
use crate::fetch::breaker::CircuitBreaker;
use crate::fetch::{FetchPolicy, FetchRequest, Fetcher};
use crate::guard::{CanonicalUrl, Resolver, SystemResolver, UrlGuard};
use crate::limiter::RateLimiter;
use crate::metrics::Metrics;
use crate::robots::RobotsCache;
use crate::workers::WorkerPool;

/// Per-call pipeline options.
#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub use_cache: bool,
    /// Serve an expired entry when present (stale-while-revalidate).
    pub allow_stale: bool,
    pub respect_robots: bool,
    pub max_bytes: Option<u64>,
    pub timeout: Option<Duration>,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            use_cache: true,
            allow_stale: false,
            respect_robots: false,
            max_bytes: None,
            timeout: None,
        }
    }
}

/// A page delivered by the pipeline, cached or fresh.
#[derive(Debug, Clone)]
pub struct PageFetch {
    pub url: CanonicalUrl,
    pub fingerprint: Fingerprint,
    pub entry: Arc<CacheEntry>,
    pub cache: CacheStatus,
}

impl PageFetch {
    #[must_use]
    pub fn status(&self) -> u16 {
        self.entry.response.status
    }

    #[must_use]
    pub fn text(&self) -> String {
        self.entry.response.text()
    }
}

pub struct Pipeline {
    config: Arc<EngineConfig>,
    guard: Arc<UrlGuard>,
    robots: Arc<RobotsCache>,
    limiter: Arc<RateLimiter>,
    fetcher: Arc<Fetcher>,
    cache: Arc<TieredCache>,
    workers: Arc<WorkerPool>,
    extractor: Arc<dyn ContentExtractor>,
    metrics: Arc<Metrics>,
}

impl Pipeline {
    /// Build the pipeline with the system resolver.
    pub fn new(config: Arc<EngineConfig>) -> HarvestResult<Self> {
        Self::with_resolver(config, Arc::new(SystemResolver))
    }

    /// Build with an injected resolver (tests use fixed DNS answers).
    pub fn with_resolver(
        config: Arc<EngineConfig>,
        resolver: Arc<dyn Resolver>,
    ) -> HarvestResult<Self> {
        let guard = Arc::new(UrlGuard::new(config.ssrf.clone(), resolver));
        let breaker = Arc::new(CircuitBreaker::new(config.breaker.clone()));
        let fetcher = Arc::new(Fetcher::new(
            &config.fetch,
            config.retry.clone(),
            Arc::clone(&guard),
            breaker,
        )?);
        let robots = Arc::new(RobotsCache::new(config.robots.clone(), fetcher.client()));
        let limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));
        let cache = Arc::new(TieredCache::new(&config.cache, &config.data_dir())?);
        let workers = Arc::new(WorkerPool::new(&config.worker, config.worker_count()));
        Ok(Self {
            config,
            guard,
            robots,
            limiter,
            fetcher,
            cache,
            workers,
            extractor: Arc::new(HtmlExtractor),
            metrics: Arc::new(Metrics::new()),
        })
    }

    #[must_use]
    pub fn config(&self) -> &Arc<EngineConfig> {
        &self.config
    }

    #[must_use]
    pub fn guard(&self) -> &Arc<UrlGuard> {
        &self.guard
    }

    #[must_use]
    pub fn robots(&self) -> &Arc<RobotsCache> {
        &self.robots
    }

    #[must_use]
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    #[must_use]
    pub fn fetcher(&self) -> &Arc<Fetcher> {
        &self.fetcher
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<TieredCache> {
        &self.cache
    }

    #[must_use]
    pub fn workers(&self) -> &Arc<WorkerPool> {
        &self.workers
    }

    #[must_use]
    pub fn extractor(&self) -> &Arc<dyn ContentExtractor> {
        &self.extractor
    }

    #[must_use]
    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    fn policy(&self, options: &FetchOptions) -> FetchPolicy {
        let mut policy = FetchPolicy::from_config(&self.config.fetch);
        if let Some(max_bytes) = options.max_bytes {
            policy.max_bytes = max_bytes;
        }
        if let Some(timeout) = options.timeout {
            policy.timeout = timeout;
            policy.total_timeout = policy.total_timeout.max(timeout);
        }
        policy
    }

    /// Fetch one page through the full pipeline.
    pub async fn fetch_page(
        &self,
        raw_url: &str,
        options: &FetchOptions,
        cancel: &CancellationToken,
    ) -> HarvestResult<PageFetch> {
        let url = self.guard.admit(raw_url).await?;
        self.fetch_admitted(url, options, cancel).await
    }

    /// Fetch a URL that already passed the guard (crawler hot path).
    pub async fn fetch_admitted(
        &self,
        url: CanonicalUrl,
        options: &FetchOptions,
        cancel: &CancellationToken,
    ) -> HarvestResult<PageFetch> {
        let fingerprint = Fingerprint::for_get(&url);

        if options.use_cache {
            if let Some((entry, status)) = self.cache.get(&fingerprint, options.allow_stale).await {
                self.metrics.inc("cache_hits", "");
                return Ok(PageFetch {
                    url,
                    fingerprint,
                    entry,
                    cache: status,
                });
            }
            self.metrics.inc("cache_misses", "");
        }

        if options.respect_robots {
            let user_agent = self.fetcher.user_agent().to_string();
            if !self.robots.allowed(&url, &user_agent).await {
                self.metrics.inc("errors_total", "kind=RobotsDisallowed");
                return Err(HarvestError::RobotsDisallowed(url.as_str().to_string()));
            }
            if let Some(delay) = self.robots.crawl_delay(&url, &user_agent).await {
                self.limiter.apply_crawl_delay(url.host(), delay);
            }
        }

        let permit = self.limiter.acquire(url.host(), cancel).await?;
        self.metrics
            .set_gauge("inflight_fetches", self.limiter.inflight() as i64);

        let policy = self.policy(options);
        let started = std::time::Instant::now();
        let result = self
            .fetcher
            .fetch(FetchRequest::get(url.clone()), &policy, cancel)
            .await;
        drop(permit);
        self.metrics.observe("fetch_duration", started.elapsed());

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                self.metrics
                    .inc("errors_total", &format!("kind={}", e.kind()));
                return Err(e);
            }
        };

        debug!(
            url = %url,
            status = response.status,
            bytes = response.body.len(),
            hops = response.hops,
            "fetched"
        );

        let entry = CacheEntry::from_response(&response, self.cache.default_ttl());
        let shared = Arc::new(entry.clone());
        if options.use_cache {
            self.cache.put(fingerprint, entry).await;
        }

        Ok(PageFetch {
            url,
            fingerprint,
            entry: shared,
            cache: CacheStatus::Miss,
        })
    }

    /// Get a derived artifact, computing and caching it on a miss.
    ///
    /// `compute` runs on the worker pool with the page HTML and the
    /// extractor; its JSON result is attached to the cache entry under
    /// `kind`.
    pub async fn artifact<F>(
        &self,
        page: &PageFetch,
        kind: &str,
        cancel: &CancellationToken,
        compute: F,
    ) -> HarvestResult<serde_json::Value>
    where
        F: FnOnce(&dyn ContentExtractor, &str) -> HarvestResult<serde_json::Value>
            + Send
            + 'static,
    {
        if let Some(value) = page.entry.artifact(kind) {
            return Ok(value.clone());
        }

        let html = page.entry.response.text();
        let extractor = Arc::clone(&self.extractor);
        let value = self
            .workers
            .submit(cancel, move || compute(extractor.as_ref(), &html))
            .await??;

        let updated = page
            .entry
            .with_artifact(kind, value.clone(), self.cache.default_ttl());
        self.cache.put(page.fingerprint, updated).await;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard::StaticResolver;

    fn test_config() -> Arc<EngineConfig> {
        let mut config = EngineConfig::default();
        config.cache.l2_enabled = false;
        Arc::new(config)
    }

    #[tokio::test]
    async fn ssrf_block_happens_before_any_network_io() {
        // Empty resolver: any DNS use would error with ResolutionFailed
        // rather than the expected guard reason.
        let pipeline =
            Pipeline::with_resolver(test_config(), Arc::new(StaticResolver::new())).expect("build");
        let err = pipeline
            .fetch_page(
                "http://169.254.169.254/latest/meta-data",
                &FetchOptions::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "BlockedByGuard");
        assert_eq!(err.guard_reason().map(|r| r.as_str()), Some("MetadataHost"));
    }

    #[tokio::test]
    async fn robots_disallow_short_circuits() {
        let pipeline =
            Pipeline::with_resolver(test_config(), Arc::new(StaticResolver::new().with(
                "example.com",
                vec![std::net::IpAddr::V4(std::net::Ipv4Addr::new(93, 184, 216, 34))],
            )))
            .expect("build");
        pipeline
            .robots
            .insert_rules("example.com", "User-agent: *\nDisallow: /\n");

        let options = FetchOptions {
            respect_robots: true,
            ..FetchOptions::default()
        };
        let err = pipeline
            .fetch_page("https://example.com/page", &options, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "RobotsDisallowed");
    }
}
