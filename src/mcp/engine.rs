//! Tool dispatcher core
//!
//! `Engine` owns every subsystem and maps validated tool arguments to
//! core operations. Each method returns the JSON payload that the MCP
//! layer wraps in a response envelope. Batch jobs route through the
//! job manager; the engine is also the job executor, dispatching on
//! the persisted job kind (components reference each other by id, not
//! by back-pointer).

use futures::StreamExt;
use futures::future::BoxFuture;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::capabilities::Capabilities;
use crate::cache::CacheStatus;
use crate::config::EngineConfig;
use crate::crawler::{CrawlRequest, CrawlSession};
use crate::error::{HarvestError, HarvestResult};
use crate::guard::CanonicalUrl;
use crate::jobs::{JobContext, JobExecutor, JobManager, JobPriority, JobRecord};
use crate::pipeline::{FetchOptions, PageFetch, Pipeline};
use crate::rank::{Bm25, RankDoc};
use crate::research::{ResearchOrchestrator, ResearchRequest};
use crate::sitemap;
use crate::tracker::{ChangeTracker, TrackOptions};
use crate::webhook::WebhookDispatcher;

use super::args::*;
use super::credits::CreditLedger;

/// Cap on body text echoed through a tool response.
const MAX_BODY_TEXT: usize = 500_000;

pub struct Engine {
    config: Arc<EngineConfig>,
    pipeline: Arc<Pipeline>,
    tracker: Arc<ChangeTracker>,
    jobs: Arc<JobManager>,
    webhooks: Arc<WebhookDispatcher>,
    research: ResearchOrchestrator,
    capabilities: Capabilities,
    credits: CreditLedger,
    shutdown: CancellationToken,
}

impl Engine {
    pub fn new(config: Arc<EngineConfig>, capabilities: Capabilities) -> HarvestResult<Arc<Self>> {
        Self::with_pipeline(
            Arc::new(Pipeline::new(Arc::clone(&config))?),
            config,
            capabilities,
        )
    }

    /// Assemble over an existing pipeline (tests inject a resolver).
    pub fn with_pipeline(
        pipeline: Arc<Pipeline>,
        config: Arc<EngineConfig>,
        capabilities: Capabilities,
    ) -> HarvestResult<Arc<Self>> {
        let data_dir = config.data_dir();
        std::fs::create_dir_all(&data_dir)?;
        let webhooks = WebhookDispatcher::new(
            config.webhook.clone(),
            &data_dir,
            pipeline.fetcher().client(),
            Arc::clone(pipeline.metrics()),
        )?;
        let tracker = Arc::new(ChangeTracker::new(
            config.tracker.clone(),
            &data_dir,
            Arc::clone(&pipeline),
            Some(Arc::clone(&webhooks)),
        )?);
        let jobs = Arc::new(JobManager::new(config.job.clone(), &data_dir)?);
        let research = ResearchOrchestrator::new(Arc::clone(&pipeline), capabilities.clone());
        let credits = CreditLedger::new(config.credits.clone());

        Ok(Arc::new(Self {
            config,
            pipeline,
            tracker,
            jobs,
            webhooks,
            research,
            capabilities,
            credits,
            shutdown: CancellationToken::new(),
        }))
    }

    /// Start background loops: webhook delivery and job workers.
    pub fn start(self: &Arc<Self>) {
        let dispatcher = Arc::clone(&self.webhooks);
        tokio::spawn(dispatcher.run(self.shutdown.clone()));
        let executor: Arc<dyn JobExecutor> = Arc::clone(self) as Arc<dyn JobExecutor>;
        let _handles = self.jobs.run(executor, self.shutdown.clone());
        info!("engine started");
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    #[must_use]
    pub fn credits(&self) -> &CreditLedger {
        &self.credits
    }

    #[must_use]
    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    #[must_use]
    pub fn tracker(&self) -> &Arc<ChangeTracker> {
        &self.tracker
    }

    #[must_use]
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    fn cancel_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }

    fn cache_label(status: CacheStatus) -> &'static str {
        match status {
            CacheStatus::Hit => "hit",
            CacheStatus::Stale => "stale",
            CacheStatus::Miss => "miss",
        }
    }

    async fn page(&self, url: &str, cancel: &CancellationToken) -> HarvestResult<PageFetch> {
        self.pipeline
            .fetch_page(url, &FetchOptions::default(), cancel)
            .await
    }

    // ── fetch/extract tools ─────────────────────────────────────────

    pub async fn fetch_url(&self, args: FetchUrlArgs) -> HarvestResult<serde_json::Value> {
        let cancel = self.cancel_token();
        let options = FetchOptions {
            use_cache: args.use_cache,
            ..FetchOptions::default()
        };
        let page = self.pipeline.fetch_page(&args.url, &options, &cancel).await?;
        let mut body = page.text();
        let truncated = body.len() > MAX_BODY_TEXT;
        if truncated {
            body.truncate(MAX_BODY_TEXT);
        }
        Ok(json!({
            "url": page.url.as_str(),
            "final_url": page.entry.response.final_url,
            "status": page.status(),
            "headers": page.entry.response.headers,
            "body": body,
            "body_truncated": truncated,
            "fetched_at": page.entry.response.fetched_at,
            "cache": Self::cache_label(page.cache),
        }))
    }

    pub async fn extract_text(&self, args: ExtractTextArgs) -> HarvestResult<serde_json::Value> {
        let cancel = self.cancel_token();
        let page = self.page(&args.url, &cancel).await?;
        let text = self
            .pipeline
            .artifact(&page, "text", &cancel, |extractor, html| {
                Ok(json!(extractor.text(html)))
            })
            .await?;
        Ok(json!({
            "url": page.url.as_str(),
            "text": text,
            "cache": Self::cache_label(page.cache),
        }))
    }

    pub async fn extract_links(&self, args: ExtractLinksArgs) -> HarvestResult<serde_json::Value> {
        let cancel = self.cancel_token();
        let page = self.page(&args.url, &cancel).await?;
        let base = page.url.clone();
        let links = self
            .pipeline
            .artifact(&page, "links", &cancel, move |extractor, html| {
                Ok(serde_json::to_value(extractor.links(html, &base))?)
            })
            .await?;
        let mut links: Vec<serde_json::Value> = serde_json::from_value(links)?;
        if args.filter_external {
            links.retain(|l| l["external"] == json!(false));
        }
        Ok(json!({
            "url": page.url.as_str(),
            "count": links.len(),
            "links": links,
        }))
    }

    pub async fn extract_metadata(
        &self,
        args: ExtractMetadataArgs,
    ) -> HarvestResult<serde_json::Value> {
        let cancel = self.cancel_token();
        let page = self.page(&args.url, &cancel).await?;
        let metadata = self
            .pipeline
            .artifact(&page, "metadata", &cancel, |extractor, html| {
                Ok(serde_json::to_value(extractor.metadata(html))?)
            })
            .await?;
        Ok(json!({
            "url": page.url.as_str(),
            "metadata": metadata,
        }))
    }

    pub async fn scrape_structured(
        &self,
        args: ScrapeStructuredArgs,
    ) -> HarvestResult<serde_json::Value> {
        if args.selectors.is_empty() {
            return Err(HarvestError::InvalidArgument("selectors is empty".into()));
        }
        let cancel = self.cancel_token();
        let page = self.page(&args.url, &cancel).await?;
        let selectors = args.selectors.clone();
        let html = page.text();
        let extractor = Arc::clone(self.pipeline.extractor());
        let values = self
            .pipeline
            .workers()
            .submit(&cancel, move || extractor.select(&html, &selectors))
            .await??;
        Ok(json!({
            "url": page.url.as_str(),
            "fields": values,
        }))
    }

    pub async fn extract_content(
        &self,
        args: ExtractContentArgs,
    ) -> HarvestResult<serde_json::Value> {
        let cancel = self.cancel_token();
        let page = self.page(&args.url, &cancel).await?;
        let content = self
            .pipeline
            .artifact(&page, "article", &cancel, |extractor, html| {
                Ok(json!({
                    "article": extractor.article(html),
                    "metadata": extractor.metadata(html),
                }))
            })
            .await?;
        Ok(json!({
            "url": page.url.as_str(),
            "content": content["article"],
            "metadata": content["metadata"],
            "cache": Self::cache_label(page.cache),
        }))
    }

    // ── search & crawl tools ────────────────────────────────────────

    pub async fn search_web(&self, args: SearchWebArgs) -> HarvestResult<serde_json::Value> {
        args.validate()?;
        let provider = self
            .capabilities
            .search
            .as_ref()
            .ok_or(HarvestError::CapabilityUnavailable("search_provider"))?;

        let query = match &args.localization {
            Some(loc) => format!("{} {loc}", args.query),
            None => args.query.clone(),
        };
        let mut hits = provider.search(&query, args.limit as usize * 2).await?;
        if let Some(site) = &args.site {
            let site = site.to_ascii_lowercase();
            hits.retain(|h| {
                CanonicalUrl::parse(&h.url)
                    .map(|u| u.host() == site || u.host().ends_with(&format!(".{site}")))
                    .unwrap_or(false)
            });
        }

        // Re-rank with BM25 over titles and snippets; ties keep the
        // provider's order.
        let docs: Vec<RankDoc> = hits
            .iter()
            .map(|h| RankDoc {
                title: h.title.clone(),
                headings: Vec::new(),
                body: h.snippet.clone(),
            })
            .collect();
        let ranked = Bm25::default().rank(&args.query, &docs);
        let results: Vec<serde_json::Value> = ranked
            .iter()
            .take(args.limit as usize)
            .map(|scored| {
                let hit = &hits[scored.index];
                json!({
                    "url": hit.url,
                    "title": hit.title,
                    "snippet": hit.snippet,
                    "score": scored.score,
                })
            })
            .collect();
        Ok(json!({
            "query": args.query,
            "count": results.len(),
            "results": results,
        }))
    }

    pub async fn crawl_deep(&self, args: CrawlDeepArgs) -> HarvestResult<serde_json::Value> {
        let request = CrawlRequest {
            seed: args.url,
            max_depth: args.max_depth,
            max_pages: args.max_pages,
            include_patterns: args.include_patterns,
            exclude_patterns: args.exclude_patterns,
            follow_external: args.follow_external,
            respect_robots: args.respect_robots,
            time_limit_ms: args.time_limit_ms.or(Some(self.config.crawl.time_limit_ms)),
        };
        let cancel = self.cancel_token();
        let outcome = CrawlSession::new(Arc::clone(&self.pipeline))
            .run(&request, &cancel)
            .await?;
        Ok(serde_json::to_value(outcome)?)
    }

    pub async fn map_site(&self, args: MapSiteArgs) -> HarvestResult<serde_json::Value> {
        args.validate()?;
        let cancel = self.cancel_token();
        let page = self.page(&args.url, &cancel).await?;
        let base = page.url.clone();

        // Sitemaps declared in robots.txt.
        let declared = self.pipeline.robots().sitemaps(&base).await;
        let from_sitemaps = if declared.is_empty() {
            Vec::new()
        } else {
            sitemap::collect_urls(
                &self.pipeline.fetcher().client(),
                &declared,
                5,
                args.max_urls as usize,
            )
            .await
        };

        // Internal links from the seed page.
        let base_for_links = base.clone();
        let links = self
            .pipeline
            .artifact(&page, "links", &cancel, move |extractor, html| {
                Ok(serde_json::to_value(extractor.links(html, &base_for_links))?)
            })
            .await?;
        let links: Vec<crate::extract::PageLink> = serde_json::from_value(links)?;

        let mut urls: Vec<String> = Vec::new();
        let mut seen = std::collections::HashSet::new();
        let own_domain = base.registrable_domain();
        for candidate in from_sitemaps
            .into_iter()
            .chain(links.into_iter().filter(|l| !l.external).map(|l| l.url))
        {
            let Ok(parsed) = CanonicalUrl::parse(&candidate) else {
                continue;
            };
            if parsed.registrable_domain() != own_domain {
                continue;
            }
            if seen.insert(parsed.as_str().to_string()) {
                urls.push(parsed.as_str().to_string());
                if urls.len() >= args.max_urls as usize {
                    break;
                }
            }
        }

        Ok(json!({
            "url": base.as_str(),
            "count": urls.len(),
            "urls": urls,
            "sitemaps": declared,
        }))
    }

    // ── batch & browser tools ───────────────────────────────────────

    /// Shared batch body: results in input order, progress reported
    /// when running as a job.
    async fn run_batch(
        &self,
        urls: &[String],
        extract_content: bool,
        cancel: &CancellationToken,
        progress: Option<&JobContext>,
    ) -> Vec<serde_json::Value> {
        let concurrency = self.config.crawl.concurrency.max(1);
        let total = urls.len();
        let completed = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let results: Vec<(usize, serde_json::Value)> =
            futures::stream::iter(urls.iter().cloned().enumerate().map(|(i, url)| {
                let pipeline = Arc::clone(&self.pipeline);
                let cancel = cancel.clone();
                let completed = Arc::clone(&completed);
                async move {
                    let value = match pipeline
                        .fetch_page(&url, &FetchOptions::default(), &cancel)
                        .await
                    {
                        Ok(page) => {
                            let body = if extract_content {
                                let html = page.text();
                                let extractor = Arc::clone(pipeline.extractor());
                                pipeline
                                    .workers()
                                    .submit(&cancel, move || {
                                        serde_json::to_value(extractor.article(&html))
                                            .unwrap_or_default()
                                    })
                                    .await
                                    .unwrap_or_default()
                            } else {
                                let mut text = page.text();
                                text.truncate(MAX_BODY_TEXT);
                                json!(text)
                            };
                            json!({
                                "url": url,
                                "success": true,
                                "status": page.status(),
                                "content": body,
                                "cache": Self::cache_label(page.cache),
                            })
                        }
                        Err(e) => json!({
                            "url": url,
                            "success": false,
                            "error": {"kind": e.kind(), "message": e.to_string()},
                        }),
                    };
                    let done = completed.fetch_add(1, std::sync::atomic::Ordering::Relaxed) + 1;
                    (i, value, done)
                }
            }))
            .buffer_unordered(concurrency)
            .map(|(i, value, done)| {
                if let Some(ctx) = progress {
                    ctx.progress(done as f64 / total as f64);
                }
                (i, value)
            })
            .collect()
            .await;

        // Input order regardless of completion order.
        let mut ordered: Vec<(usize, serde_json::Value)> = results;
        ordered.sort_by_key(|(i, _)| *i);
        ordered.into_iter().map(|(_, v)| v).collect()
    }

    pub async fn batch_scrape(&self, args: BatchScrapeArgs) -> HarvestResult<serde_json::Value> {
        args.validate()?;
        match args.mode {
            BatchMode::Sync => {
                let cancel = self.cancel_token();
                let results = self
                    .run_batch(&args.urls, args.extract_content, &cancel, None)
                    .await;
                Ok(json!({
                    "mode": "sync",
                    "count": results.len(),
                    "results": results,
                }))
            }
            BatchMode::Async => {
                let job_id = self.jobs.submit(
                    "batch_scrape",
                    json!({
                        "urls": args.urls,
                        "extract_content": args.extract_content,
                    }),
                    JobPriority::Normal,
                )?;
                Ok(json!({"mode": "async", "job_id": job_id}))
            }
        }
    }

    pub async fn scrape_with_actions(
        &self,
        args: ScrapeWithActionsArgs,
    ) -> HarvestResult<serde_json::Value> {
        let browser = self
            .capabilities
            .browser
            .as_ref()
            .ok_or(HarvestError::CapabilityUnavailable("browser_session"))?;
        let cancel = self.cancel_token();
        // The target still goes through the guard before any browser
        // navigation.
        let url = self.pipeline.guard().admit(&args.url).await?;

        let rendered = browser.open(url.as_str(), &args.actions).await?;
        let html = rendered.html.clone();
        let base = url.clone();
        let extractor = Arc::clone(self.pipeline.extractor());
        let (article, metadata, links) = self
            .pipeline
            .workers()
            .submit(&cancel, move || {
                (
                    extractor.article(&html),
                    extractor.metadata(&html),
                    extractor.links(&html, &base),
                )
            })
            .await?;

        use base64::Engine as _;
        let screenshots: Vec<String> = rendered
            .screenshots
            .iter()
            .map(|png| base64::engine::general_purpose::STANDARD.encode(png))
            .collect();

        Ok(json!({
            "url": url.as_str(),
            "final_url": rendered.final_url,
            "content": article,
            "metadata": metadata,
            "links": links,
            "screenshots": screenshots,
        }))
    }

    // ── research & tracking tools ───────────────────────────────────

    pub async fn deep_research(&self, args: DeepResearchArgs) -> HarvestResult<serde_json::Value> {
        args.validate()?;
        let request = ResearchRequest {
            topic: args.topic,
            approach: args.research_approach,
            max_depth: args.max_depth,
            max_urls: args.max_urls.min(self.config.research.max_urls),
            time_limit_ms: args
                .time_limit_ms
                .unwrap_or(self.config.research.default_time_limit_ms),
            source_types: args.source_types,
            credibility_threshold: args
                .credibility_threshold
                .unwrap_or(self.config.research.default_credibility_threshold),
        };
        let cancel = self.cancel_token();
        let outcome = self.research.run(&request, &cancel).await?;
        if args.output_format == OutputFormat::Summary {
            return Ok(json!({
                "topic": outcome.topic,
                "findings": outcome
                    .findings
                    .iter()
                    .take(5)
                    .map(|f| json!({
                        "url": f.url,
                        "title": f.title,
                        "relevance": f.relevance,
                    }))
                    .collect::<Vec<_>>(),
                "consensus": outcome.consensus,
                "conflict_count": outcome.conflicts.len(),
                "synthesis": outcome.synthesis,
                "truncated": outcome.truncated,
                "metrics": outcome.metrics,
            }));
        }
        Ok(serde_json::to_value(outcome)?)
    }

    pub async fn track_changes(&self, args: TrackChangesArgs) -> HarvestResult<serde_json::Value> {
        args.validate()?;
        let options = TrackOptions {
            granularity: args.granularity,
            selector: args.selector.clone(),
            excluded_selectors: args.excluded_selectors.clone(),
            webhook_url: args.webhook_url.clone(),
        };
        let cancel = self.cancel_token();

        match args.operation {
            TrackOperation::CreateBaseline => {
                let url = args.url.unwrap_or_default();
                let html = match args.content {
                    Some(content) => content,
                    None => self.page(&url, &cancel).await?.text(),
                };
                let tracker = Arc::clone(&self.tracker);
                let record = self
                    .pipeline
                    .workers()
                    .submit(&cancel, move || tracker.create_baseline(&url, &html, &options))
                    .await??;
                Ok(json!({"snapshot": record}))
            }
            TrackOperation::Compare => {
                let url = args.url.unwrap_or_default();
                let html = match args.content {
                    Some(content) => content,
                    None => self.page(&url, &cancel).await?.text(),
                };
                let tracker = Arc::clone(&self.tracker);
                let record = self
                    .pipeline
                    .workers()
                    .submit(&cancel, move || tracker.compare(&url, &html, &options))
                    .await??;
                Ok(json!({"change": record}))
            }
            TrackOperation::Monitor => {
                let url = args.url.unwrap_or_default();
                // A baseline must exist before monitoring starts.
                if self.tracker.store().latest(&url).is_none() {
                    let html = self.page(&url, &cancel).await?.text();
                    let tracker = Arc::clone(&self.tracker);
                    let baseline_url = url.clone();
                    let baseline_options = options.clone();
                    self.pipeline
                        .workers()
                        .submit(&cancel, move || {
                            tracker.create_baseline(&baseline_url, &html, &baseline_options)
                        })
                        .await??;
                }
                let interval = Duration::from_millis(args.interval_ms.unwrap_or(3_600_000));
                let monitor_id = self.tracker.monitor(&url, interval, options);
                Ok(json!({"monitor_id": monitor_id, "url": url}))
            }
            TrackOperation::StopMonitor => {
                let monitor_id = args.monitor_id.ok_or_else(|| {
                    HarvestError::InvalidArgument("monitor_id is required".into())
                })?;
                let stopped = self.tracker.stop_monitor(&monitor_id);
                Ok(json!({"monitor_id": monitor_id, "stopped": stopped}))
            }
            TrackOperation::GetStats => {
                let url = args.url.unwrap_or_default();
                Ok(json!({"stats": self.tracker.stats(&url)}))
            }
            TrackOperation::ExportHistory => {
                let url = args.url.unwrap_or_default();
                let format = args.format.as_deref().unwrap_or("json");
                let exported = self.tracker.export_history(&url, format)?;
                Ok(json!({"url": url, "format": format, "history": exported}))
            }
            TrackOperation::CreateAlertRule => {
                let url = args.url.unwrap_or_default();
                let webhook_url = args.webhook_url.ok_or_else(|| {
                    HarvestError::InvalidArgument("webhook_url is required".into())
                })?;
                let min_significance = args
                    .min_significance
                    .unwrap_or(crate::tracker::Significance::Major);
                let rule = self
                    .tracker
                    .create_alert_rule(&url, min_significance, &webhook_url)?;
                Ok(json!({"rule": rule}))
            }
            TrackOperation::GetMonitoringTemplates => {
                Ok(json!({"templates": ChangeTracker::monitoring_templates()}))
            }
            TrackOperation::GenerateTrendReport => {
                let url = args.url.unwrap_or_default();
                Ok(json!({"report": self.tracker.trend_report(&url)}))
            }
            TrackOperation::GetDashboard => Ok(json!({"dashboard": self.tracker.dashboard()})),
        }
    }

    // ── job & health tools ──────────────────────────────────────────

    pub async fn get_job_status(&self, args: JobStatusArgs) -> HarvestResult<serde_json::Value> {
        let record = self.jobs.status(&args.job_id)?;
        let result = if record.status == crate::jobs::JobStatus::Completed {
            Some(self.jobs.result(&args.job_id)?)
        } else {
            None
        };
        Ok(json!({
            "job_id": record.job_id,
            "kind": record.kind,
            "status": record.status.as_str(),
            "progress": record.progress,
            "created_at": record.created_at,
            "updated_at": record.updated_at,
            "expires_at": record.expires_at,
            "error": record.error_kind.as_ref().map(|kind| json!({
                "kind": kind,
                "message": record.error_message,
            })),
            "result": result,
        }))
    }

    pub async fn cancel_job(&self, args: CancelJobArgs) -> HarvestResult<serde_json::Value> {
        let record = self.jobs.cancel(&args.job_id)?;
        Ok(json!({
            "job_id": record.job_id,
            "status": record.status.as_str(),
        }))
    }

    pub async fn server_health(&self, _args: ServerHealthArgs) -> HarvestResult<serde_json::Value> {
        use crate::metrics::{ComponentState, HealthReport};
        let metrics = self.pipeline.metrics();
        metrics.set_gauge("queue_depth", self.jobs.queue_depth() as i64);
        metrics.set_gauge(
            "open_breakers",
            self.pipeline.fetcher().breaker().open_count() as i64,
        );
        metrics.set_gauge("webhook_pending", self.webhooks.pending() as i64);
        let (cache_hits, cache_misses) = self.pipeline.cache().counters();
        let (delivered, failed) = self.webhooks.counters();

        let mut components = std::collections::BTreeMap::new();
        let webhook_state = if self.webhooks.pending() >= self.config.webhook.queue_size {
            ComponentState::Critical
        } else if self.webhooks.pending() > self.config.webhook.queue_size / 2 {
            ComponentState::Degraded
        } else {
            ComponentState::Ok
        };
        components.insert("webhooks".to_string(), webhook_state);
        let job_state = if self.jobs.queue_depth() >= self.config.job.queue_size {
            ComponentState::Critical
        } else {
            ComponentState::Ok
        };
        components.insert("jobs".to_string(), job_state);
        components.insert(
            "breakers".to_string(),
            if self.pipeline.fetcher().breaker().open_count() > 10 {
                ComponentState::Degraded
            } else {
                ComponentState::Ok
            },
        );
        let health = HealthReport::evaluate(components);

        Ok(json!({
            "health": health,
            "metrics": metrics.snapshot(),
            "cache": {"hits": cache_hits, "misses": cache_misses, "l1_items": self.pipeline.cache().l1_len()},
            "webhooks": {"delivered": delivered, "failed": failed, "pending": self.webhooks.pending()},
            "credits": {"balance": self.credits.balance()},
        }))
    }
}

impl JobExecutor for Engine {
    fn execute<'a>(
        &'a self,
        record: &'a JobRecord,
        ctx: JobContext,
    ) -> BoxFuture<'a, HarvestResult<serde_json::Value>> {
        Box::pin(async move {
            match record.kind.as_str() {
                "batch_scrape" => {
                    let urls: Vec<String> =
                        serde_json::from_value(record.params["urls"].clone())?;
                    let extract_content = record.params["extract_content"]
                        .as_bool()
                        .unwrap_or(true);
                    let results = self
                        .run_batch(&urls, extract_content, &ctx.cancel, Some(&ctx))
                        .await;
                    if ctx.cancel.is_cancelled() {
                        return Err(HarvestError::Cancelled);
                    }
                    Ok(json!({"count": results.len(), "results": results}))
                }
                other => Err(HarvestError::InvalidArgument(format!(
                    "unknown job kind '{other}'"
                ))),
            }
        })
    }
}
