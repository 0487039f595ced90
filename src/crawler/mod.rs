//! Breadth-first crawler
//!
//! One [`CrawlSession`] owns its frontier and visited set; the shared
//! pipeline supplies fetching, robots, rate limits, and caching.
//! Ordering is strict BFS: a level is drained and fetched (fetches run
//! concurrently and may finish out of order) before the next level is
//! started, so no depth *d + 1* URL is popped before every depth *d*
//! URL. Per-URL failures are recorded and do not abort the crawl.

pub mod frontier;

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{HarvestError, HarvestResult};
use crate::extract::PageLink;
use crate::guard::CanonicalUrl;
use crate::pipeline::{FetchOptions, PageFetch, Pipeline};

use frontier::{Frontier, FrontierItem};

/// Validated crawl parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlRequest {
    pub seed: String,
    /// Levels fetched: 1 means the seed only.
    pub max_depth: u32,
    /// Successful page budget.
    pub max_pages: u32,
    pub include_patterns: Vec<String>,
    pub exclude_patterns: Vec<String>,
    pub follow_external: bool,
    pub respect_robots: bool,
    pub time_limit_ms: Option<u64>,
}

impl CrawlRequest {
    #[must_use]
    pub fn new(seed: impl Into<String>) -> Self {
        Self {
            seed: seed.into(),
            max_depth: 3,
            max_pages: 50,
            include_patterns: Vec::new(),
            exclude_patterns: Vec::new(),
            follow_external: false,
            respect_robots: true,
            time_limit_ms: None,
        }
    }

    pub fn validate(&self) -> HarvestResult<()> {
        if !(1..=10).contains(&self.max_depth) {
            return Err(HarvestError::OutOfRange {
                field: "max_depth".into(),
                message: format!("{} not in 1..=10", self.max_depth),
            });
        }
        if self.max_pages == 0 {
            return Err(HarvestError::OutOfRange {
                field: "max_pages".into(),
                message: "must be >= 1".into(),
            });
        }
        Ok(())
    }
}

/// One crawled page in the session results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawledPage {
    pub url: String,
    pub depth: u32,
    pub parent: Option<String>,
    pub status: Option<u16>,
    pub title: Option<String>,
    pub links_found: usize,
    pub from_cache: bool,
    pub error: Option<CrawlPageError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlPageError {
    pub kind: String,
    pub message: String,
}

/// Session result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlOutcome {
    pub pages: Vec<CrawledPage>,
    pub pages_crawled: usize,
    pub pages_failed: usize,
    pub max_depth_reached: u32,
    /// True when a budget, the time limit, or cancellation stopped the
    /// crawl before the frontier drained.
    pub truncated: bool,
    pub duration_ms: u64,
}

/// Optional within-level ordering hook.
pub type PriorityFn = Arc<dyn Fn(&CanonicalUrl) -> f64 + Send + Sync>;

struct CompiledFilters {
    include: Vec<Regex>,
    exclude: Vec<Regex>,
}

impl CompiledFilters {
    fn compile(request: &CrawlRequest) -> HarvestResult<Self> {
        let compile = |patterns: &[String]| -> HarvestResult<Vec<Regex>> {
            patterns
                .iter()
                .map(|p| {
                    Regex::new(p).map_err(|e| {
                        HarvestError::InvalidArgument(format!("pattern '{p}': {e}"))
                    })
                })
                .collect()
        };
        Ok(Self {
            include: compile(&request.include_patterns)?,
            exclude: compile(&request.exclude_patterns)?,
        })
    }

    fn admits(&self, url: &str) -> bool {
        if self.exclude.iter().any(|re| re.is_match(url)) {
            return false;
        }
        self.include.is_empty() || self.include.iter().any(|re| re.is_match(url))
    }
}

struct PageWork {
    item: FrontierItem,
    result: HarvestResult<(PageFetch, Vec<PageLink>, Option<String>)>,
}

/// A single crawl execution.
pub struct CrawlSession {
    pipeline: Arc<Pipeline>,
    priority: Option<PriorityFn>,
}

impl CrawlSession {
    #[must_use]
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self {
            pipeline,
            priority: None,
        }
    }

    #[must_use]
    pub fn with_priority(mut self, priority: PriorityFn) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Run the crawl to completion or budget exhaustion.
    pub async fn run(
        &self,
        request: &CrawlRequest,
        cancel: &CancellationToken,
    ) -> HarvestResult<CrawlOutcome> {
        request.validate()?;
        let filters = CompiledFilters::compile(request)?;
        let seed = self.pipeline.guard().admit(&request.seed).await?;
        let seed_domain = seed.registrable_domain();

        let started = Instant::now();
        let deadline = request
            .time_limit_ms
            .map(|ms| started + Duration::from_millis(ms));

        let mut frontier = Frontier::new(seed);
        let mut pages: Vec<CrawledPage> = Vec::new();
        let mut crawled = 0usize;
        let mut failed = 0usize;
        let mut max_depth_reached = 0u32;
        let mut truncated = false;
        let concurrency = self.pipeline.config().crawl.concurrency.max(1);

        let options = FetchOptions {
            respect_robots: request.respect_robots,
            ..FetchOptions::default()
        };

        'levels: loop {
            let level = frontier.pop_level();
            if level.is_empty() {
                break;
            }
            let depth = level[0].depth;
            debug!(depth, urls = level.len(), "crawling level");

            let mut queue: std::collections::VecDeque<FrontierItem> = level.into();
            let mut inflight = FuturesUnordered::new();
            let mut level_results: Vec<PageWork> = Vec::new();

            loop {
                // Top up workers; the popping order within the level is
                // the frontier order. Completed-but-unprocessed level
                // results count against the page budget too.
                while inflight.len() < concurrency {
                    if crawled + level_results.len() + inflight.len()
                        >= request.max_pages as usize
                    {
                        break;
                    }
                    if let Some(deadline) = deadline {
                        if Instant::now() >= deadline {
                            break;
                        }
                    }
                    if cancel.is_cancelled() {
                        break;
                    }
                    let Some(item) = queue.pop_front() else { break };
                    inflight.push(self.process_one(item, &options, cancel));
                }

                let Some(work) = inflight.next().await else {
                    break;
                };
                level_results.push(work);
            }

            // Whatever is still queued was cut off by a budget.
            if !queue.is_empty() {
                truncated = true;
            }

            for work in level_results {
                let item = work.item;
                max_depth_reached = max_depth_reached.max(item.depth);
                match work.result {
                    Ok((page, links, title)) => {
                        crawled += 1;
                        let links_found = links.len();
                        if item.depth + 1 < request.max_depth {
                            self.enqueue_links(
                                &mut frontier,
                                &item.url,
                                links,
                                &filters,
                                &seed_domain,
                                request.follow_external,
                            );
                        }
                        pages.push(CrawledPage {
                            url: item.url.as_str().to_string(),
                            depth: item.depth,
                            parent: item.parent,
                            status: Some(page.status()),
                            title,
                            links_found,
                            from_cache: page.cache != crate::cache::CacheStatus::Miss,
                            error: None,
                        });
                    }
                    Err(e) => {
                        failed += 1;
                        warn!(url = %item.url, error = %e, "page failed");
                        pages.push(CrawledPage {
                            url: item.url.as_str().to_string(),
                            depth: item.depth,
                            parent: item.parent,
                            status: match &e {
                                HarvestError::HttpStatus(code) => Some(*code),
                                _ => None,
                            },
                            title: None,
                            links_found: 0,
                            from_cache: false,
                            error: Some(CrawlPageError {
                                kind: e.kind().to_string(),
                                message: e.to_string(),
                            }),
                        });
                    }
                }
            }

            if cancel.is_cancelled() {
                truncated = truncated || !frontier.is_exhausted();
                break 'levels;
            }
            if crawled >= request.max_pages as usize {
                truncated = truncated || !frontier.is_exhausted();
                break;
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    truncated = truncated || !frontier.is_exhausted();
                    break;
                }
            }
            if depth + 1 >= request.max_depth {
                // Deeper levels were never enqueued; nothing to do.
                if frontier.is_exhausted() {
                    break;
                }
            }
        }

        info!(
            seed = %request.seed,
            crawled,
            failed,
            truncated,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "crawl finished"
        );

        Ok(CrawlOutcome {
            pages,
            pages_crawled: crawled,
            pages_failed: failed,
            max_depth_reached,
            truncated,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn process_one(
        &self,
        item: FrontierItem,
        options: &FetchOptions,
        cancel: &CancellationToken,
    ) -> PageWork {
        let result = self.fetch_and_extract(&item, options, cancel).await;
        PageWork { item, result }
    }

    async fn fetch_and_extract(
        &self,
        item: &FrontierItem,
        options: &FetchOptions,
        cancel: &CancellationToken,
    ) -> HarvestResult<(PageFetch, Vec<PageLink>, Option<String>)> {
        let page = self
            .pipeline
            .fetch_admitted(item.url.clone(), options, cancel)
            .await?;

        let is_html = page
            .entry
            .response
            .header("content-type")
            .map(|ct| ct.contains("html"))
            .unwrap_or(true);
        if !is_html {
            return Ok((page, Vec::new(), None));
        }

        let html = page.text();
        let base = item.url.clone();
        let extractor = Arc::clone(self.pipeline.extractor());
        let (links, title) = self
            .pipeline
            .workers()
            .submit(cancel, move || {
                let links = extractor.links(&html, &base);
                let title = extractor.metadata(&html).title;
                (links, title)
            })
            .await?;

        Ok((page, links, title))
    }

    fn enqueue_links(
        &self,
        frontier: &mut Frontier,
        parent: &CanonicalUrl,
        links: Vec<PageLink>,
        filters: &CompiledFilters,
        seed_domain: &str,
        follow_external: bool,
    ) {
        for link in links {
            let Ok(url) = CanonicalUrl::parse(&link.url) else {
                continue;
            };
            if !follow_external && url.registrable_domain() != seed_domain {
                continue;
            }
            if !filters.admits(url.as_str()) {
                continue;
            }
            if frontier.seen(&url) {
                continue;
            }
            let priority = self
                .priority
                .as_ref()
                .map(|f| f(&url))
                .unwrap_or(0.0);
            frontier.push_next(url, parent, priority);
        }
    }
}
