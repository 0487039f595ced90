//! Tool argument schemas
//!
//! One struct per tool, deserialized from the `arguments` object of a
//! `tools/call`. Every struct rejects unknown fields; numeric bounds
//! are validated before dispatch.

use schemars::JsonSchema;
use serde::Deserialize;
use std::collections::BTreeMap;

use crate::capabilities::BrowserAction;
use crate::error::{HarvestError, HarvestResult};

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct FetchUrlArgs {
    /// Absolute http(s) URL to fetch.
    pub url: String,
    /// Serve a cached copy when fresh (default true).
    #[serde(default = "default_true")]
    pub use_cache: bool,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ExtractTextArgs {
    pub url: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ExtractLinksArgs {
    pub url: String,
    /// Drop links leaving the page's registrable domain.
    #[serde(default)]
    pub filter_external: bool,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ExtractMetadataArgs {
    pub url: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ScrapeStructuredArgs {
    pub url: String,
    /// Field name -> CSS selector.
    pub selectors: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ExtractContentArgs {
    pub url: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct SearchWebArgs {
    pub query: String,
    /// Result cap, 1-50 (default 10).
    #[serde(default = "default_search_limit")]
    pub limit: u32,
    /// Restrict results to this site (host suffix).
    pub site: Option<String>,
    /// Localization hint, e.g. "de-DE".
    pub localization: Option<String>,
}

fn default_search_limit() -> u32 {
    10
}

impl SearchWebArgs {
    pub fn validate(&self) -> HarvestResult<()> {
        if self.query.trim().is_empty() {
            return Err(HarvestError::InvalidArgument("query is empty".into()));
        }
        if !(1..=50).contains(&self.limit) {
            return Err(HarvestError::OutOfRange {
                field: "limit".into(),
                message: format!("{} not in 1..=50", self.limit),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct CrawlDeepArgs {
    pub url: String,
    /// Levels to crawl, 1-10 (default 3); 1 fetches only the seed.
    #[serde(default = "default_crawl_depth")]
    pub max_depth: u32,
    /// Successful page budget (default 50).
    #[serde(default = "default_crawl_pages")]
    pub max_pages: u32,
    #[serde(default)]
    pub include_patterns: Vec<String>,
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
    #[serde(default)]
    pub follow_external: bool,
    #[serde(default = "default_true")]
    pub respect_robots: bool,
    /// Wall-clock bound in milliseconds.
    pub time_limit_ms: Option<u64>,
}

fn default_crawl_depth() -> u32 {
    3
}

fn default_crawl_pages() -> u32 {
    50
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct MapSiteArgs {
    pub url: String,
    /// URL cap (default 500).
    #[serde(default = "default_map_urls")]
    pub max_urls: u32,
}

fn default_map_urls() -> u32 {
    500
}

impl MapSiteArgs {
    pub fn validate(&self) -> HarvestResult<()> {
        if self.max_urls == 0 {
            return Err(HarvestError::OutOfRange {
                field: "max_urls".into(),
                message: "must be >= 1".into(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum BatchMode {
    Sync,
    Async,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct BatchScrapeArgs {
    /// URLs to scrape, max 100.
    pub urls: Vec<String>,
    pub mode: BatchMode,
    /// Extract cleaned article text instead of raw body.
    #[serde(default = "default_true")]
    pub extract_content: bool,
}

impl BatchScrapeArgs {
    pub fn validate(&self) -> HarvestResult<()> {
        if self.urls.is_empty() {
            return Err(HarvestError::InvalidArgument("urls is empty".into()));
        }
        if self.urls.len() > 100 {
            return Err(HarvestError::OutOfRange {
                field: "urls".into(),
                message: format!("{} urls exceeds the limit of 100", self.urls.len()),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ScrapeWithActionsArgs {
    pub url: String,
    /// Browser actions executed in order before extraction.
    #[serde(default)]
    pub actions: Vec<BrowserAction>,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct DeepResearchArgs {
    pub topic: String,
    /// Crawl depth behind each source, 1-5 (default 2).
    #[serde(default = "default_research_depth")]
    pub max_depth: u32,
    /// Source budget (default 50).
    #[serde(default = "default_research_urls")]
    pub max_urls: u32,
    /// Wall-clock bound in milliseconds.
    pub time_limit_ms: Option<u64>,
    /// broad | focused | academic | current_events | comparative.
    #[serde(default)]
    pub research_approach: crate::research::Approach,
    /// Filter to these source types.
    pub source_types: Option<Vec<String>>,
    /// Minimum source credibility, 0-1.
    pub credibility_threshold: Option<f64>,
    /// full (default) or summary.
    #[serde(default)]
    pub output_format: OutputFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    #[default]
    Full,
    Summary,
}

fn default_research_depth() -> u32 {
    2
}

fn default_research_urls() -> u32 {
    50
}

impl DeepResearchArgs {
    pub fn validate(&self) -> HarvestResult<()> {
        if !(1..=5).contains(&self.max_depth) {
            return Err(HarvestError::OutOfRange {
                field: "max_depth".into(),
                message: format!("{} not in 1..=5", self.max_depth),
            });
        }
        if let Some(threshold) = self.credibility_threshold {
            if !(0.0..=1.0).contains(&threshold) {
                return Err(HarvestError::OutOfRange {
                    field: "credibility_threshold".into(),
                    message: "must be in 0..=1".into(),
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TrackOperation {
    CreateBaseline,
    Compare,
    Monitor,
    StopMonitor,
    GetStats,
    ExportHistory,
    CreateAlertRule,
    GetMonitoringTemplates,
    GenerateTrendReport,
    GetDashboard,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct TrackChangesArgs {
    pub operation: TrackOperation,
    /// Tracked URL; required by every operation except the templates
    /// and dashboard queries.
    pub url: Option<String>,
    /// Content to compare or baseline; fetched live when omitted.
    pub content: Option<String>,
    /// page | section | element | text_only.
    #[serde(default)]
    pub granularity: crate::tracker::Granularity,
    /// CSS selector for element granularity.
    pub selector: Option<String>,
    #[serde(default)]
    pub excluded_selectors: Vec<String>,
    /// Webhook target for change notifications.
    pub webhook_url: Option<String>,
    /// Monitor poll interval in milliseconds (default 1h, min 10s).
    pub interval_ms: Option<u64>,
    /// Monitor id for stop_monitor.
    pub monitor_id: Option<String>,
    /// json | jsonl | csv for export_history.
    pub format: Option<String>,
    /// none | minor | moderate | major | critical for alert rules.
    pub min_significance: Option<crate::tracker::Significance>,
}

impl TrackChangesArgs {
    pub fn validate(&self) -> HarvestResult<()> {
        let needs_url = !matches!(
            self.operation,
            TrackOperation::GetMonitoringTemplates
                | TrackOperation::GetDashboard
                | TrackOperation::StopMonitor
        );
        if needs_url && self.url.is_none() {
            return Err(HarvestError::InvalidArgument(
                "url is required for this operation".into(),
            ));
        }
        if let Some(interval) = self.interval_ms {
            if interval < 10_000 {
                return Err(HarvestError::OutOfRange {
                    field: "interval_ms".into(),
                    message: "must be >= 10000".into(),
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct JobStatusArgs {
    pub job_id: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct CancelJobArgs {
    pub job_id: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ServerHealthArgs {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_fields_rejected() {
        let result: Result<FetchUrlArgs, _> =
            serde_json::from_str(r#"{"url": "https://example.com", "surprise": 1}"#);
        assert!(result.is_err());
    }

    #[test]
    fn defaults_apply() {
        let args: CrawlDeepArgs =
            serde_json::from_str(r#"{"url": "https://example.com"}"#).expect("parse");
        assert_eq!(args.max_depth, 3);
        assert_eq!(args.max_pages, 50);
        assert!(args.respect_robots);
        assert!(!args.follow_external);
    }

    #[test]
    fn numeric_bounds_enforced() {
        let args: SearchWebArgs =
            serde_json::from_str(r#"{"query": "x", "limit": 51}"#).expect("parse");
        assert!(args.validate().is_err());

        let args: DeepResearchArgs = serde_json::from_str(
            r#"{"topic": "x", "credibility_threshold": 1.2}"#,
        )
        .expect("parse");
        assert!(args.validate().is_err());

        let args: BatchScrapeArgs =
            serde_json::from_str(r#"{"urls": [], "mode": "sync"}"#).expect("parse");
        assert!(args.validate().is_err());
    }

    #[test]
    fn track_operations_parse_snake_case() {
        let args: TrackChangesArgs = serde_json::from_str(
            r#"{"operation": "create_baseline", "url": "https://example.com"}"#,
        )
        .expect("parse");
        assert_eq!(args.operation, TrackOperation::CreateBaseline);
        assert!(args.validate().is_ok());

        let args: TrackChangesArgs =
            serde_json::from_str(r#"{"operation": "get_stats"}"#).expect("parse");
        assert!(args.validate().is_err(), "get_stats requires a url");
    }
}
