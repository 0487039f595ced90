//! MCP server over stdio
//!
//! Exposes the engine as MCP tools via `rmcp`'s tool router. Every
//! tool response is a JSON envelope in a text content block:
//! `{"success": true, ...}` or `{"success": false, "error": {kind,
//! message}}`. Credits are charged before execution and refunded on
//! hard failure; every call is metered and bounded by a per-tool
//! timeout. Tool work never blocks the transport loop.

use rmcp::{
    ErrorData as McpError, RoleServer, ServerHandler, ServiceExt,
    handler::server::tool::{ToolCallContext, ToolRouter},
    handler::server::wrapper::Parameters,
    model::*,
    service::RequestContext,
    tool, tool_router,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{HarvestError, HarvestResult};

use super::args::*;
use super::engine::Engine;

/// Extra headroom past a tool's own time budget.
const TOOL_TIMEOUT_GRACE: Duration = Duration::from_secs(30);

/// The MCP server: the engine plus the generated tool router.
#[derive(Clone)]
pub struct HarvestServer {
    engine: Arc<Engine>,
    tool_router: ToolRouter<Self>,
}

fn envelope_ok(payload: serde_json::Value) -> serde_json::Value {
    match payload {
        serde_json::Value::Object(mut map) => {
            map.insert("success".to_string(), serde_json::Value::Bool(true));
            serde_json::Value::Object(map)
        }
        other => serde_json::json!({"success": true, "result": other}),
    }
}

fn envelope_err(error: &HarvestError) -> serde_json::Value {
    serde_json::json!({
        "success": false,
        "error": {
            "kind": error.kind(),
            "message": error.to_string(),
        }
    })
}

#[tool_router]
impl HarvestServer {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            tool_router: Self::tool_router(),
        }
    }

    /// Charge credits, run the operation under a timeout, meter it,
    /// and wrap the outcome in the response envelope.
    async fn run_tool<F>(
        &self,
        name: &'static str,
        timeout: Duration,
        operation: F,
    ) -> Result<CallToolResult, McpError>
    where
        F: Future<Output = HarvestResult<serde_json::Value>>,
    {
        let metrics = Arc::clone(self.engine.pipeline().metrics());
        metrics.inc("requests_total", &format!("tool={name}"));
        let started = std::time::Instant::now();

        let charge = match self.engine.credits().charge(name) {
            Ok(charge) => charge,
            Err(e) => {
                metrics.inc("errors_total", &format!("kind={}", e.kind()));
                let body = envelope_err(&e).to_string();
                return Ok(CallToolResult::error(vec![Content::text(body)]));
            }
        };

        let outcome = match tokio::time::timeout(timeout, operation).await {
            Ok(outcome) => outcome,
            Err(_) => Err(HarvestError::Timeout(timeout)),
        };
        metrics.observe("tool_duration", started.elapsed());

        match outcome {
            Ok(payload) => {
                let body = envelope_ok(payload).to_string();
                Ok(CallToolResult::success(vec![Content::text(body)]))
            }
            Err(e) => {
                warn!(tool = name, error = %e, "tool failed");
                metrics.inc("errors_total", &format!("kind={}", e.kind()));
                // Hard failure: the caller gets their credits back.
                self.engine.credits().refund(charge);
                let body = envelope_err(&e).to_string();
                Ok(CallToolResult::error(vec![Content::text(body)]))
            }
        }
    }

    fn default_timeout(&self) -> Duration {
        self.engine.pipeline().config().fetch_total_timeout()
    }

    #[tool(
        name = "fetch_url",
        description = "Fetch a URL through the extraction pipeline: SSRF guard, cache, rate limits, retries. Returns status, headers, body text, and whether the response came from cache."
    )]
    async fn fetch_url(
        &self,
        params: Parameters<FetchUrlArgs>,
    ) -> Result<CallToolResult, McpError> {
        self.run_tool("fetch_url", self.default_timeout(), self.engine.fetch_url(params.0))
            .await
    }

    #[tool(
        name = "extract_text",
        description = "Fetch a page and return its visible text with scripts, styles, and markup removed."
    )]
    async fn extract_text(
        &self,
        params: Parameters<ExtractTextArgs>,
    ) -> Result<CallToolResult, McpError> {
        self.run_tool(
            "extract_text",
            self.default_timeout(),
            self.engine.extract_text(params.0),
        )
        .await
    }

    #[tool(
        name = "extract_links",
        description = "Fetch a page and return its hyperlinks as canonical URLs with anchor text, flagged internal/external. Set filter_external to keep only same-domain links."
    )]
    async fn extract_links(
        &self,
        params: Parameters<ExtractLinksArgs>,
    ) -> Result<CallToolResult, McpError> {
        self.run_tool(
            "extract_links",
            self.default_timeout(),
            self.engine.extract_links(params.0),
        )
        .await
    }

    #[tool(
        name = "extract_metadata",
        description = "Fetch a page and return document metadata: title, description, canonical URL, language, and Open Graph / Twitter card tags."
    )]
    async fn extract_metadata(
        &self,
        params: Parameters<ExtractMetadataArgs>,
    ) -> Result<CallToolResult, McpError> {
        self.run_tool(
            "extract_metadata",
            self.default_timeout(),
            self.engine.extract_metadata(params.0),
        )
        .await
    }

    #[tool(
        name = "scrape_structured",
        description = "Fetch a page and extract named fields by CSS selector. Each field yields a string, an array of strings when the selector matches repeatedly, or null."
    )]
    async fn scrape_structured(
        &self,
        params: Parameters<ScrapeStructuredArgs>,
    ) -> Result<CallToolResult, McpError> {
        self.run_tool(
            "scrape_structured",
            self.default_timeout(),
            self.engine.scrape_structured(params.0),
        )
        .await
    }

    #[tool(
        name = "extract_content",
        description = "Fetch a page and return the cleaned main article content (title, text, word count) plus metadata, skipping navigation and boilerplate."
    )]
    async fn extract_content(
        &self,
        params: Parameters<ExtractContentArgs>,
    ) -> Result<CallToolResult, McpError> {
        self.run_tool(
            "extract_content",
            self.default_timeout(),
            self.engine.extract_content(params.0),
        )
        .await
    }

    #[tool(
        name = "search_web",
        description = "Run a web search through the configured provider, optionally restricted to one site, and return results re-ranked by BM25 relevance."
    )]
    async fn search_web(
        &self,
        params: Parameters<SearchWebArgs>,
    ) -> Result<CallToolResult, McpError> {
        self.run_tool(
            "search_web",
            self.default_timeout(),
            self.engine.search_web(params.0),
        )
        .await
    }

    #[tool(
        name = "crawl_deep",
        description = "Breadth-first crawl from a seed URL with depth (1-10) and page budgets, include/exclude patterns, robots.txt compliance, and per-page results. Depth 1 fetches only the seed."
    )]
    async fn crawl_deep(
        &self,
        params: Parameters<CrawlDeepArgs>,
    ) -> Result<CallToolResult, McpError> {
        let budget = params
            .0
            .time_limit_ms
            .unwrap_or(self.engine.pipeline().config().crawl.time_limit_ms);
        let timeout = Duration::from_millis(budget) + TOOL_TIMEOUT_GRACE;
        self.run_tool("crawl_deep", timeout, self.engine.crawl_deep(params.0))
            .await
    }

    #[tool(
        name = "map_site",
        description = "Map a site's URLs by merging robots.txt-declared sitemaps with links discovered on the page, deduplicated and capped at max_urls."
    )]
    async fn map_site(
        &self,
        params: Parameters<MapSiteArgs>,
    ) -> Result<CallToolResult, McpError> {
        self.run_tool("map_site", self.default_timeout(), self.engine.map_site(params.0))
            .await
    }

    #[tool(
        name = "batch_scrape",
        description = "Scrape up to 100 URLs. mode=sync returns results in input order; mode=async returns a job_id immediately for polling with get_job_status."
    )]
    async fn batch_scrape(
        &self,
        params: Parameters<BatchScrapeArgs>,
    ) -> Result<CallToolResult, McpError> {
        let timeout = self.default_timeout() * 5;
        self.run_tool("batch_scrape", timeout, self.engine.batch_scrape(params.0))
            .await
    }

    #[tool(
        name = "scrape_with_actions",
        description = "Render a page in a browser session, run scripted actions (click, type, wait, scroll, screenshot), then extract content, metadata, and links from the rendered HTML."
    )]
    async fn scrape_with_actions(
        &self,
        params: Parameters<ScrapeWithActionsArgs>,
    ) -> Result<CallToolResult, McpError> {
        let timeout = self.default_timeout() * 2;
        self.run_tool(
            "scrape_with_actions",
            timeout,
            self.engine.scrape_with_actions(params.0),
        )
        .await
    }

    #[tool(
        name = "deep_research",
        description = "Research a topic: expand queries, gather and deduplicate sources, fetch and score them for relevance and credibility, detect conflicting claims, and synthesize findings. Partial results carry truncated=true."
    )]
    async fn deep_research(
        &self,
        params: Parameters<DeepResearchArgs>,
    ) -> Result<CallToolResult, McpError> {
        let budget = params.0.time_limit_ms.unwrap_or(
            self.engine
                .pipeline()
                .config()
                .research
                .default_time_limit_ms,
        );
        let timeout = Duration::from_millis(budget) + TOOL_TIMEOUT_GRACE;
        self.run_tool("deep_research", timeout, self.engine.deep_research(params.0))
            .await
    }

    #[tool(
        name = "track_changes",
        description = "Track page changes over time. Operations: create_baseline, compare, monitor, stop_monitor, get_stats, export_history, create_alert_rule, get_monitoring_templates, generate_trend_report, get_dashboard."
    )]
    async fn track_changes(
        &self,
        params: Parameters<TrackChangesArgs>,
    ) -> Result<CallToolResult, McpError> {
        self.run_tool(
            "track_changes",
            self.default_timeout(),
            self.engine.track_changes(params.0),
        )
        .await
    }

    #[tool(
        name = "get_job_status",
        description = "Poll an async job by id: status (queued/running/completed/failed/cancelled/expired), progress, and the result once completed."
    )]
    async fn get_job_status(
        &self,
        params: Parameters<JobStatusArgs>,
    ) -> Result<CallToolResult, McpError> {
        self.run_tool(
            "get_job_status",
            self.default_timeout(),
            self.engine.get_job_status(params.0),
        )
        .await
    }

    #[tool(
        name = "cancel_job",
        description = "Cancel a queued or running job. Terminal jobs are unaffected; the final status is returned."
    )]
    async fn cancel_job(
        &self,
        params: Parameters<CancelJobArgs>,
    ) -> Result<CallToolResult, McpError> {
        self.run_tool(
            "cancel_job",
            self.default_timeout(),
            self.engine.cancel_job(params.0),
        )
        .await
    }

    #[tool(
        name = "server_health",
        description = "Liveness/readiness report plus a metrics snapshot: request counters, error counts by kind, cache hit rates, queue depths, open circuit breakers, and credit balance."
    )]
    async fn server_health(
        &self,
        params: Parameters<ServerHealthArgs>,
    ) -> Result<CallToolResult, McpError> {
        self.run_tool(
            "server_health",
            self.default_timeout(),
            self.engine.server_health(params.0),
        )
        .await
    }
}

impl ServerHandler for HarvestServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some(
                "Web-data extraction engine. Fetch and extract single pages \
                 (fetch_url, extract_text, extract_links, extract_metadata, \
                 scrape_structured, extract_content), search and crawl \
                 (search_web, crawl_deep, map_site), batch and browser \
                 scraping (batch_scrape, scrape_with_actions), research \
                 (deep_research), change tracking (track_changes), and job \
                 control (get_job_status, cancel_job, server_health). Every \
                 response is a JSON envelope with a success flag."
                    .into(),
            ),
            capabilities: ServerCapabilities {
                tools: Some(ToolsCapability { list_changed: None }),
                ..Default::default()
            },
            server_info: Implementation {
                name: "webharvest".into(),
                version: env!("CARGO_PKG_VERSION").into(),
                title: Some("webharvest".into()),
                description: Some("Concurrent web-data extraction engine".into()),
                icons: None,
                website_url: None,
            },
            ..Default::default()
        }
    }

    fn list_tools(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> impl Future<Output = Result<ListToolsResult, McpError>> + Send + '_ {
        std::future::ready(Ok(ListToolsResult {
            tools: self.tool_router.list_all(),
            next_cursor: None,
            meta: Default::default(),
        }))
    }

    fn call_tool(
        &self,
        request: CallToolRequestParams,
        context: RequestContext<RoleServer>,
    ) -> impl Future<Output = Result<CallToolResult, McpError>> + Send + '_ {
        let tool_context = ToolCallContext::new(self, request, context);
        async move { self.tool_router.call(tool_context).await }
    }

    fn get_tool(&self, name: &str) -> Option<Tool> {
        self.tool_router.get(name).cloned()
    }
}

/// Run the MCP server on stdio until the client disconnects.
pub async fn serve_stdio(engine: Arc<Engine>) -> anyhow::Result<()> {
    engine.start();
    let server = HarvestServer::new(Arc::clone(&engine));
    let transport = rmcp::transport::io::stdio();
    let service = server.serve(transport).await.inspect_err(|e| {
        warn!(error = %e, "mcp serve error");
    })?;
    info!("mcp server listening on stdio");
    service.waiting().await?;
    engine.shutdown();
    Ok(())
}
