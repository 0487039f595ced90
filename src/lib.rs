//! webharvest: a concurrent web-data extraction engine exposed as MCP
//! tools over stdio.
//!
//! The core is the shared extraction pipeline (URL guard, robots
//! cache, per-host rate limiting, a retrying/breaker-gated fetcher, a
//! two-tier cache, and a CPU worker pool) with the crawler, ranker,
//! change tracker, webhook dispatcher, job manager, and research
//! orchestrator layered on top. `mcp::serve_stdio` wires everything to
//! an MCP client.

pub mod cache;
pub mod capabilities;
pub mod config;
pub mod crawler;
pub mod error;
pub mod extract;
pub mod fetch;
pub mod guard;
pub mod jobs;
pub mod limiter;
pub mod mcp;
pub mod metrics;
pub mod pipeline;
pub mod rank;
pub mod research;
pub mod robots;
pub mod sitemap;
pub mod tracker;
pub mod webhook;
pub mod workers;

pub use cache::{CacheEntry, CacheStatus, Fingerprint, TieredCache};
pub use capabilities::{
    BrowserAction, BrowserSession, Capabilities, RenderedPage, SearchHit, SearchProvider,
    SemanticScorer, Synthesis, Synthesizer,
};
pub use config::EngineConfig;
pub use crawler::{CrawlOutcome, CrawlRequest, CrawlSession, CrawledPage};
pub use error::{GuardReason, HarvestError, HarvestResult};
pub use extract::{ContentExtractor, HtmlExtractor, PageLink, PageMetadata};
pub use fetch::{FetchPolicy, FetchRequest, FetchedResponse, Fetcher};
pub use guard::{CanonicalUrl, Resolver, StaticResolver, SystemResolver, UrlGuard};
pub use jobs::{JobManager, JobPriority, JobRecord, JobStatus};
pub use limiter::RateLimiter;
pub use mcp::{Engine, serve_stdio};
pub use metrics::{HealthReport, Metrics, MetricsSnapshot};
pub use pipeline::{FetchOptions, PageFetch, Pipeline};
pub use rank::{Bm25, RankDoc, simhash64};
pub use research::{Approach, ResearchOrchestrator, ResearchRequest};
pub use robots::{RobotsCache, RobotsRules};
pub use tracker::{ChangeRecord, ChangeTracker, Significance, SnapshotStore, TrackOptions};
pub use webhook::{EventPriority, WebhookDispatcher};
pub use workers::WorkerPool;
