//! Engine configuration
//!
//! One `EngineConfig` value is built at startup and shared (via `Arc`)
//! by every subsystem. All knobs deserialize from a single JSON document
//! with serde defaults, so an empty `{}` is a complete, working
//! configuration. Unknown keys are rejected at every nesting level, and
//! `validate()` enforces the numeric ranges after deserialization.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{HarvestError, HarvestResult};

const MIB: u64 = 1024 * 1024;

/// Top-level configuration for the extraction engine.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields, default)]
pub struct EngineConfig {
    /// Root directory for all persistent state (jobs, snapshots, cache
    /// L2, webhook DLQ).
    pub data_dir: Option<PathBuf>,
    pub fetch: FetchConfig,
    pub rate_limit: RateLimitConfig,
    pub retry: RetryConfig,
    pub breaker: BreakerConfig,
    pub cache: CacheConfig,
    pub robots: RobotsConfig,
    pub crawl: CrawlConfig,
    pub ssrf: SsrfConfig,
    pub webhook: WebhookConfig,
    pub job: JobConfig,
    pub research: ResearchConfig,
    pub tracker: TrackerConfig,
    pub worker: WorkerConfig,
    pub credits: CreditConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct FetchConfig {
    /// Per-attempt timeout.
    pub timeout_ms: u64,
    /// Deadline across all retry attempts of one logical fetch.
    pub total_timeout_ms: u64,
    /// Hard cap on decoded body size.
    pub max_bytes: u64,
    pub max_redirects: u32,
    pub user_agent: String,
    /// Idle keep-alive connections retained per origin.
    pub max_idle_per_host: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            total_timeout_ms: 60_000,
            max_bytes: 100 * MIB,
            max_redirects: 5,
            user_agent: format!("webharvest/{}", env!("CARGO_PKG_VERSION")),
            max_idle_per_host: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RateLimitConfig {
    /// Token refill rate per host.
    pub rps: f64,
    /// Bucket capacity per host.
    pub burst: u32,
    /// Global cap on concurrent fetches.
    pub global_inflight: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            rps: 10.0,
            burst: 20,
            global_inflight: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub backoff_factor: f64,
    pub max_backoff_ms: u64,
    /// Jitter fraction applied symmetrically around each backoff.
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff_ms: 1_000,
            backoff_factor: 2.0,
            max_backoff_ms: 30_000,
            jitter: 0.2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout_ms: u64,
    /// Probe requests allowed while half-open.
    pub half_open_probes: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_ms: 60_000,
            half_open_probes: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CacheConfig {
    pub l1_items: usize,
    pub l1_bytes: u64,
    pub ttl_ms: u64,
    /// Overrides `{data_dir}/cache` when set.
    pub l2_path: Option<PathBuf>,
    /// Disables the disk tier entirely.
    pub l2_enabled: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            l1_items: 1_000,
            l1_bytes: 64 * MIB,
            ttl_ms: 3_600_000,
            l2_path: None,
            l2_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RobotsConfig {
    pub ttl_ms: u64,
    /// Treat robots.txt fetch failures as allow-all.
    pub fail_open: bool,
}

impl Default for RobotsConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 3_600_000,
            fail_open: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CrawlConfig {
    pub max_depth: u32,
    pub max_pages: u32,
    pub respect_robots: bool,
    pub time_limit_ms: u64,
    /// Concurrent fetches within one crawl session.
    pub concurrency: usize,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            max_depth: 5,
            max_pages: 100,
            respect_robots: true,
            time_limit_ms: 300_000,
            concurrency: 8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SsrfConfig {
    pub block_private: bool,
    pub extra_blocked_hosts: Vec<String>,
}

impl Default for SsrfConfig {
    fn default() -> Self {
        Self {
            block_private: true,
            extra_blocked_hosts: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct WebhookConfig {
    pub max_attempts: u32,
    pub queue_size: usize,
    pub signing_secret: Option<String>,
    pub timeout_ms: u64,
    /// Maximum clock skew accepted by the verification helper.
    pub max_skew_ms: u64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            queue_size: 10_000,
            signing_secret: None,
            timeout_ms: 10_000,
            max_skew_ms: 300_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct JobConfig {
    pub retention_ms: u64,
    /// Queued jobs accepted before submit blocks.
    pub queue_size: usize,
    /// Concurrent job executors.
    pub workers: usize,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            retention_ms: 86_400_000,
            queue_size: 1_000,
            workers: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ResearchConfig {
    pub default_time_limit_ms: u64,
    pub max_urls: u32,
    /// Queries produced by expansion per topic.
    pub query_variants: usize,
    pub default_credibility_threshold: f64,
}

impl Default for ResearchConfig {
    fn default() -> Self {
        Self {
            default_time_limit_ms: 180_000,
            max_urls: 1_000,
            query_variants: 6,
            default_credibility_threshold: 0.3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct TrackerConfig {
    /// Significance component weights; normalized if they do not sum
    /// to 1.0.
    pub weight_content: f64,
    pub weight_structural: f64,
    pub weight_metadata: f64,
    pub weight_visual: f64,
    /// Score thresholds for minor/moderate/major/critical.
    pub thresholds: [f64; 4],
    /// Minimum significance that produces a webhook event.
    pub notification_threshold: f64,
    /// Per-URL minimum interval between notifications.
    pub min_notify_interval_ms: u64,
    /// Snapshots retained per URL before pruning.
    pub retained_snapshots: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            weight_content: 0.4,
            weight_structural: 0.2,
            weight_metadata: 0.2,
            weight_visual: 0.2,
            thresholds: [0.1, 0.4, 0.7, 0.9],
            notification_threshold: 0.4,
            min_notify_interval_ms: 60_000,
            retained_snapshots: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct WorkerConfig {
    /// CPU workers; 0 means one per available core.
    pub count: usize,
    pub queue_size: usize,
    pub task_timeout_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: 0,
            queue_size: 256,
            task_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CreditConfig {
    pub enabled: bool,
    pub balance: u64,
    /// Per-tool credit cost; tools absent from the map cost
    /// `default_cost`.
    pub costs: HashMap<String, u64>,
    pub default_cost: u64,
}

impl Default for CreditConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            balance: 1_000_000,
            costs: HashMap::new(),
            default_cost: 1,
        }
    }
}

impl EngineConfig {
    /// Load configuration from the file named by `WEBHARVEST_CONFIG`,
    /// falling back to defaults when the variable is unset.
    pub fn load() -> HarvestResult<Self> {
        match std::env::var("WEBHARVEST_CONFIG") {
            Ok(path) => Self::from_file(PathBuf::from(path)),
            Err(_) => Ok(Self::default()),
        }
    }

    /// Parse a JSON configuration file and validate it.
    pub fn from_file(path: PathBuf) -> HarvestResult<Self> {
        let raw = std::fs::read_to_string(&path)
            .map_err(|e| HarvestError::InvalidArgument(format!("config file unreadable: {e}")))?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| HarvestError::InvalidArgument(format!("config parse: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Enforce numeric ranges serde cannot express.
    pub fn validate(&self) -> HarvestResult<()> {
        fn out_of_range(field: &str, message: impl Into<String>) -> HarvestError {
            HarvestError::OutOfRange {
                field: field.to_string(),
                message: message.into(),
            }
        }

        if self.rate_limit.rps <= 0.0 {
            return Err(out_of_range("rate_limit.rps", "must be > 0"));
        }
        if self.rate_limit.burst == 0 {
            return Err(out_of_range("rate_limit.burst", "must be >= 1"));
        }
        if self.rate_limit.global_inflight == 0 {
            return Err(out_of_range("rate_limit.global_inflight", "must be >= 1"));
        }
        if self.fetch.max_redirects > 20 {
            return Err(out_of_range("fetch.max_redirects", "must be <= 20"));
        }
        if self.fetch.max_bytes == 0 {
            return Err(out_of_range("fetch.max_bytes", "must be >= 1"));
        }
        if !(1..=10).contains(&self.crawl.max_depth) {
            return Err(out_of_range("crawl.max_depth", "must be in 1..=10"));
        }
        if self.crawl.max_pages == 0 {
            return Err(out_of_range("crawl.max_pages", "must be >= 1"));
        }
        if self.retry.max_attempts == 0 {
            return Err(out_of_range("retry.max_attempts", "must be >= 1"));
        }
        if self.webhook.queue_size == 0 {
            return Err(out_of_range("webhook.queue_size", "must be >= 1"));
        }
        let t = &self.tracker.thresholds;
        if !t.windows(2).all(|w| w[0] < w[1]) || t[0] < 0.0 || t[3] > 1.0 {
            return Err(out_of_range(
                "tracker.thresholds",
                "must be ascending within [0, 1]",
            ));
        }
        if !(0.0..=1.0).contains(&self.research.default_credibility_threshold) {
            return Err(out_of_range(
                "research.default_credibility_threshold",
                "must be in 0..=1",
            ));
        }
        Ok(())
    }

    /// Root directory for persistent state.
    #[must_use]
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("./webharvest-data"))
    }

    #[must_use]
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch.timeout_ms)
    }

    #[must_use]
    pub fn fetch_total_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch.total_timeout_ms)
    }

    /// Effective CPU worker count.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        if self.worker.count == 0 {
            num_cpus::get().max(1)
        } else {
            self.worker.count
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_is_a_complete_config() {
        let config: EngineConfig = serde_json::from_str("{}").expect("defaults");
        config.validate().expect("valid");
        assert_eq!(config.fetch.timeout_ms, 30_000);
        assert_eq!(config.fetch.max_bytes, 100 * MIB);
        assert_eq!(config.rate_limit.rps, 10.0);
        assert_eq!(config.cache.l1_items, 1_000);
        assert_eq!(config.webhook.queue_size, 10_000);
        assert_eq!(config.job.retention_ms, 86_400_000);
    }

    #[test]
    fn unknown_keys_rejected_at_any_level() {
        assert!(serde_json::from_str::<EngineConfig>(r#"{"bogus": 1}"#).is_err());
        assert!(
            serde_json::from_str::<EngineConfig>(r#"{"fetch": {"timeout_ms": 5, "nope": true}}"#)
                .is_err()
        );
    }

    #[test]
    fn validate_rejects_out_of_range() {
        let mut config = EngineConfig::default();
        config.crawl.max_depth = 11;
        assert!(matches!(
            config.validate(),
            Err(HarvestError::OutOfRange { .. })
        ));

        let mut config = EngineConfig::default();
        config.tracker.thresholds = [0.4, 0.1, 0.7, 0.9];
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_override_keeps_sibling_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"rate_limit": {"rps": 2.5}}"#).expect("parse");
        assert_eq!(config.rate_limit.rps, 2.5);
        assert_eq!(config.rate_limit.burst, 20);
    }
}
