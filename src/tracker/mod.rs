//! Change tracking
//!
//! Per-URL snapshot history plus comparison, monitoring, alerting, and
//! reporting. Comparison runs over [`significance::PageFeatures`];
//! snapshots live in the [`snapshots::SnapshotStore`]; change events
//! above the notification threshold go to the webhook dispatcher,
//! throttled per URL.

pub mod significance;
pub mod snapshots;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::TrackerConfig;
use crate::error::{HarvestError, HarvestResult};
use crate::extract::ContentExtractor;
use crate::pipeline::{FetchOptions, Pipeline};
use crate::webhook::{EventPriority, WebhookDispatcher};

pub use significance::{ChangeAnalysis, PageFeatures, Significance, analyze};
pub use snapshots::{SnapshotRecord, SnapshotStore, url_hash};

/// Comparison granularity.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, schemars::JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    #[default]
    Page,
    Section,
    Element,
    TextOnly,
}

/// Options shared by baseline/compare/monitor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrackOptions {
    pub granularity: Granularity,
    /// Required for element granularity.
    pub selector: Option<String>,
    pub excluded_selectors: Vec<String>,
    /// Webhook target for change notifications.
    pub webhook_url: Option<String>,
}

/// Result of a comparison.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub url: String,
    pub from_snapshot: String,
    pub to_snapshot: Option<String>,
    pub similarity: f64,
    pub significance: Significance,
    pub score: f64,
    pub sections_changed: Vec<String>,
    pub computed_at: DateTime<Utc>,
}

/// Alert rule: forward qualifying changes to an extra target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRule {
    pub rule_id: String,
    pub url: String,
    pub min_significance: Significance,
    pub webhook_url: String,
    pub created_at: DateTime<Utc>,
}

/// Aggregate per-URL statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackStats {
    pub url: String,
    pub snapshot_count: usize,
    pub baseline_at: Option<DateTime<Utc>>,
    pub latest_at: Option<DateTime<Utc>>,
    pub changes_recorded: usize,
    pub last_significance: Option<Significance>,
    pub mean_score: f64,
}

pub struct ChangeTracker {
    store: SnapshotStore,
    config: TrackerConfig,
    pipeline: Arc<Pipeline>,
    webhooks: Option<Arc<WebhookDispatcher>>,
    history_dir: PathBuf,
    alerts_path: PathBuf,
    alerts: Mutex<Vec<AlertRule>>,
    monitors: DashMap<String, CancellationToken>,
    last_notified: DashMap<String, Instant>,
}

impl ChangeTracker {
    pub fn new(
        config: TrackerConfig,
        data_dir: &std::path::Path,
        pipeline: Arc<Pipeline>,
        webhooks: Option<Arc<WebhookDispatcher>>,
    ) -> HarvestResult<Self> {
        let store = SnapshotStore::new(data_dir.join("snapshots"))?;
        let history_dir = data_dir.join("tracker").join("history");
        fs::create_dir_all(&history_dir)?;
        let alerts_path = data_dir.join("tracker").join("alerts.json");
        let alerts = match fs::read(&alerts_path) {
            Ok(raw) => serde_json::from_slice(&raw).unwrap_or_default(),
            Err(_) => Vec::new(),
        };
        Ok(Self {
            store,
            config,
            pipeline,
            webhooks,
            history_dir,
            alerts_path,
            alerts: Mutex::new(alerts),
            monitors: DashMap::new(),
            last_notified: DashMap::new(),
        })
    }

    #[must_use]
    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    fn features_for(&self, html: &str, options: &TrackOptions) -> HarvestResult<PageFeatures> {
        let extractor: &dyn ContentExtractor = self.pipeline.extractor().as_ref();
        let scoped = match (options.granularity, &options.selector) {
            (Granularity::Element, Some(selector)) => extractor.keep(html, selector)?,
            (Granularity::Element, None) => {
                return Err(HarvestError::InvalidArgument(
                    "element granularity requires a selector".into(),
                ));
            }
            _ => html.to_string(),
        };
        let text_only = options.granularity == Granularity::TextOnly;
        Ok(PageFeatures::build(
            extractor,
            &scoped,
            &options.excluded_selectors,
            text_only,
        ))
    }

    /// Store the first (or another) snapshot of a URL.
    pub fn create_baseline(
        &self,
        url: &str,
        html: &str,
        options: &TrackOptions,
    ) -> HarvestResult<SnapshotRecord> {
        let features = self.features_for(html, options)?;
        let metadata = serde_json::json!({
            "granularity": options.granularity,
            "selector": options.selector,
            "excluded_selectors": options.excluded_selectors,
        });
        let record = self.store.write(
            url,
            html.as_bytes(),
            &features.structural_hash(),
            &features.text_hash(),
            metadata,
        )?;
        info!(url = %url, snapshot = %record.snapshot_id, "baseline created");
        Ok(record)
    }

    /// Compare new content against the latest stored snapshot.
    pub fn compare(
        &self,
        url: &str,
        new_html: &str,
        options: &TrackOptions,
    ) -> HarvestResult<ChangeRecord> {
        let reference = self
            .store
            .latest(url)
            .ok_or_else(|| HarvestError::SnapshotNotFound(format!("no baseline for {url}")))?;
        let old_html = self.store.read(&reference.snapshot_id)?;
        let old_features = self.features_for(&String::from_utf8_lossy(&old_html), options)?;
        let new_features = self.features_for(new_html, options)?;
        let analysis = analyze(&old_features, &new_features, &self.config);

        let record = ChangeRecord {
            url: url.to_string(),
            from_snapshot: reference.snapshot_id,
            to_snapshot: None,
            similarity: analysis.similarity,
            significance: analysis.significance,
            score: analysis.score,
            sections_changed: analysis.sections_changed,
            computed_at: Utc::now(),
        };
        self.append_history(&record);
        Ok(record)
    }

    /// Fetch the URL now, compare, snapshot on change, and notify.
    /// This is one tick of a monitor.
    pub async fn check_now(
        &self,
        url: &str,
        options: &TrackOptions,
        cancel: &CancellationToken,
    ) -> HarvestResult<ChangeRecord> {
        let fetch_options = FetchOptions {
            use_cache: false,
            ..FetchOptions::default()
        };
        let page = self.pipeline.fetch_page(url, &fetch_options, cancel).await?;
        let html = page.text();
        let mut record = self.compare(url, &html, options)?;

        if record.significance > Significance::None {
            let snapshot = self.create_baseline(url, &html, options)?;
            record.to_snapshot = Some(snapshot.snapshot_id);
            let retained = self.config.retained_snapshots;
            let _ = self.store.prune(url, retained);
        }
        self.notify(&record, options);
        Ok(record)
    }

    fn notify(&self, record: &ChangeRecord, options: &TrackOptions) {
        let Some(webhooks) = &self.webhooks else {
            return;
        };
        let threshold =
            Significance::from_score(self.config.notification_threshold, &self.config.thresholds);
        if record.significance < threshold {
            return;
        }

        // Per-URL throttle.
        let min_interval = Duration::from_millis(self.config.min_notify_interval_ms);
        let now = Instant::now();
        let throttled = self
            .last_notified
            .get(&record.url)
            .is_some_and(|t| now.duration_since(*t) < min_interval);
        if throttled {
            return;
        }
        self.last_notified.insert(record.url.clone(), now);

        let payload = serde_json::to_value(record).unwrap_or_default();
        if let Some(target) = &options.webhook_url {
            webhooks.enqueue("change_detected", payload.clone(), target, EventPriority::Normal);
        }
        for rule in self.alerts.lock().iter() {
            if rule.url == record.url && record.significance >= rule.min_significance {
                webhooks.enqueue(
                    "alert_triggered",
                    payload.clone(),
                    &rule.webhook_url,
                    EventPriority::High,
                );
            }
        }
    }

    /// Start a periodic monitor; returns its id.
    pub fn monitor(
        self: &Arc<Self>,
        url: &str,
        interval: Duration,
        options: TrackOptions,
    ) -> String {
        let monitor_id = uuid::Uuid::new_v4().simple().to_string();
        let cancel = CancellationToken::new();
        self.monitors.insert(monitor_id.clone(), cancel.clone());

        let tracker = Arc::clone(self);
        let url = url.to_string();
        let id_for_task = monitor_id.clone();
        tokio::spawn(async move {
            info!(url = %url, monitor = %id_for_task, interval_s = interval.as_secs(), "monitor started");
            loop {
                tokio::select! {
                    () = tokio::time::sleep(interval) => {}
                    () = cancel.cancelled() => break,
                }
                match tracker.check_now(&url, &options, &cancel).await {
                    Ok(record) => {
                        if record.significance > Significance::None {
                            info!(
                                url = %url,
                                significance = record.significance.as_str(),
                                score = record.score,
                                "change detected"
                            );
                        }
                    }
                    Err(HarvestError::Cancelled) => break,
                    Err(e) => warn!(url = %url, error = %e, "monitor tick failed"),
                }
            }
            info!(url = %url, monitor = %id_for_task, "monitor stopped");
        });

        monitor_id
    }

    /// Stop a monitor; true when it existed.
    pub fn stop_monitor(&self, monitor_id: &str) -> bool {
        match self.monitors.remove(monitor_id) {
            Some((_, cancel)) => {
                cancel.cancel();
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn active_monitors(&self) -> usize {
        self.monitors.len()
    }

    fn history_path(&self, url: &str) -> PathBuf {
        self.history_dir.join(format!("{}.jsonl", url_hash(url)))
    }

    fn append_history(&self, record: &ChangeRecord) {
        let Ok(line) = serde_json::to_string(record) else {
            return;
        };
        let result = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.history_path(&record.url))
            .and_then(|mut f| writeln!(f, "{line}"));
        if let Err(e) = result {
            warn!(url = %record.url, error = %e, "history append failed");
        }
    }

    fn load_history(&self, url: &str) -> Vec<ChangeRecord> {
        let Ok(raw) = fs::read_to_string(self.history_path(url)) else {
            return Vec::new();
        };
        raw.lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }

    pub fn stats(&self, url: &str) -> TrackStats {
        let snapshots = self.store.list(url);
        let history = self.load_history(url);
        let mean_score = if history.is_empty() {
            0.0
        } else {
            history.iter().map(|r| r.score).sum::<f64>() / history.len() as f64
        };
        TrackStats {
            url: url.to_string(),
            snapshot_count: snapshots.len(),
            baseline_at: snapshots.first().map(|r| r.taken_at),
            latest_at: snapshots.last().map(|r| r.taken_at),
            changes_recorded: history.len(),
            last_significance: history.last().map(|r| r.significance),
            mean_score,
        }
    }

    /// Export change history as `json`, `jsonl`, or `csv`.
    pub fn export_history(&self, url: &str, format: &str) -> HarvestResult<String> {
        let history = self.load_history(url);
        match format {
            "json" => Ok(serde_json::to_string_pretty(&history)?),
            "jsonl" => Ok(history
                .iter()
                .filter_map(|r| serde_json::to_string(r).ok())
                .collect::<Vec<_>>()
                .join("\n")),
            "csv" => {
                let mut out = String::from(
                    "url,from_snapshot,to_snapshot,similarity,significance,score,computed_at\n",
                );
                for r in &history {
                    out.push_str(&format!(
                        "{},{},{},{:.4},{},{:.4},{}\n",
                        r.url,
                        r.from_snapshot,
                        r.to_snapshot.as_deref().unwrap_or(""),
                        r.similarity,
                        r.significance.as_str(),
                        r.score,
                        r.computed_at.to_rfc3339(),
                    ));
                }
                Ok(out)
            }
            other => Err(HarvestError::InvalidArgument(format!(
                "unknown export format '{other}'"
            ))),
        }
    }

    pub fn create_alert_rule(
        &self,
        url: &str,
        min_significance: Significance,
        webhook_url: &str,
    ) -> HarvestResult<AlertRule> {
        let rule = AlertRule {
            rule_id: uuid::Uuid::new_v4().simple().to_string(),
            url: url.to_string(),
            min_significance,
            webhook_url: webhook_url.to_string(),
            created_at: Utc::now(),
        };
        let mut alerts = self.alerts.lock();
        alerts.push(rule.clone());
        let encoded = serde_json::to_vec(&*alerts)?;
        fs::write(&self.alerts_path, encoded)?;
        Ok(rule)
    }

    #[must_use]
    pub fn alert_rules(&self) -> Vec<AlertRule> {
        self.alerts.lock().clone()
    }

    /// Canned monitoring configurations.
    #[must_use]
    pub fn monitoring_templates() -> serde_json::Value {
        serde_json::json!([
            {
                "name": "content_watch",
                "description": "Daily whole-page comparison",
                "interval_ms": 86_400_000,
                "options": { "granularity": "page" }
            },
            {
                "name": "price_watch",
                "description": "Hourly element-level watch; set selector to the price node",
                "interval_ms": 3_600_000,
                "options": { "granularity": "element", "selector": ".price" }
            },
            {
                "name": "news_watch",
                "description": "Frequent text-only comparison ignoring layout churn",
                "interval_ms": 900_000,
                "options": { "granularity": "text_only" }
            }
        ])
    }

    /// Aggregate history into a trend summary.
    pub fn trend_report(&self, url: &str) -> serde_json::Value {
        let history = self.load_history(url);
        let mut by_significance = std::collections::BTreeMap::new();
        for record in &history {
            *by_significance
                .entry(record.significance.as_str().to_string())
                .or_insert(0u64) += 1;
        }
        let overall_mean = if history.is_empty() {
            0.0
        } else {
            history.iter().map(|r| r.score).sum::<f64>() / history.len() as f64
        };
        let recent: Vec<&ChangeRecord> = history.iter().rev().take(5).collect();
        let recent_mean = if recent.is_empty() {
            0.0
        } else {
            recent.iter().map(|r| r.score).sum::<f64>() / recent.len() as f64
        };
        let direction = if recent_mean > overall_mean + 0.05 {
            "increasing"
        } else if recent_mean + 0.05 < overall_mean {
            "decreasing"
        } else {
            "stable"
        };
        serde_json::json!({
            "url": url,
            "changes": history.len(),
            "by_significance": by_significance,
            "mean_score": overall_mean,
            "recent_mean_score": recent_mean,
            "trend": direction,
            "first": history.first().map(|r| r.computed_at),
            "last": history.last().map(|r| r.computed_at),
        })
    }

    /// Cross-URL summary for the dashboard operation.
    pub fn dashboard(&self) -> serde_json::Value {
        let urls = self.store.tracked_urls();
        let tracked: Vec<serde_json::Value> = urls
            .iter()
            .map(|url| {
                let stats = self.stats(url);
                serde_json::json!({
                    "url": url,
                    "snapshots": stats.snapshot_count,
                    "changes": stats.changes_recorded,
                    "last_significance": stats.last_significance.map(|s| s.as_str()),
                    "mean_score": stats.mean_score,
                })
            })
            .collect();
        serde_json::json!({
            "tracked_urls": tracked,
            "active_monitors": self.active_monitors(),
            "alert_rules": self.alerts.lock().len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::guard::StaticResolver;

    fn tracker() -> (tempfile::TempDir, Arc<ChangeTracker>) {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = EngineConfig::default();
        config.cache.l2_enabled = false;
        config.data_dir = Some(dir.path().to_path_buf());
        let pipeline = Arc::new(
            Pipeline::with_resolver(Arc::new(config), Arc::new(StaticResolver::new()))
                .expect("pipeline"),
        );
        let tracker = ChangeTracker::new(
            TrackerConfig::default(),
            dir.path(),
            pipeline,
            None,
        )
        .expect("tracker");
        (dir, Arc::new(tracker))
    }

    const V1: &str = "<html><body><h2>News</h2><p>Original story text</p></body></html>";
    const V2: &str = "<html><body><h2>News</h2><p>Original story text!</p></body></html>";
    const V3: &str =
        "<html><body><h1>Breaking</h1><p>Everything changed completely today</p></body></html>";

    #[test]
    fn baseline_then_self_compare_is_none() {
        let (_dir, tracker) = tracker();
        let options = TrackOptions::default();
        tracker
            .create_baseline("https://example.com/a", V1, &options)
            .expect("baseline");
        let record = tracker
            .compare("https://example.com/a", V1, &options)
            .expect("compare");
        assert_eq!(record.significance, Significance::None);
        assert!(record.similarity >= 0.999);
    }

    #[test]
    fn small_edit_vs_rewrite() {
        let (_dir, tracker) = tracker();
        let options = TrackOptions::default();
        let url = "https://example.com/b";
        tracker.create_baseline(url, V1, &options).expect("baseline");

        let small = tracker.compare(url, V2, &options).expect("small");
        assert!(small.similarity >= 0.9);
        assert!(small.significance <= Significance::Minor);

        let big = tracker.compare(url, V3, &options).expect("big");
        assert!(big.similarity <= 0.5);
        assert!(big.significance >= Significance::Major);
    }

    #[test]
    fn compare_without_baseline_fails() {
        let (_dir, tracker) = tracker();
        let err = tracker
            .compare("https://example.com/none", V1, &TrackOptions::default())
            .unwrap_err();
        assert_eq!(err.kind(), "SnapshotNotFound");
    }

    #[test]
    fn history_feeds_stats_and_exports() {
        let (_dir, tracker) = tracker();
        let options = TrackOptions::default();
        let url = "https://example.com/c";
        tracker.create_baseline(url, V1, &options).expect("baseline");
        tracker.compare(url, V2, &options).expect("c1");
        tracker.compare(url, V3, &options).expect("c2");

        let stats = tracker.stats(url);
        assert_eq!(stats.changes_recorded, 2);
        assert_eq!(stats.snapshot_count, 1);

        let csv = tracker.export_history(url, "csv").expect("csv");
        assert_eq!(csv.lines().count(), 3);
        let json = tracker.export_history(url, "json").expect("json");
        assert!(json.contains("similarity"));
        assert!(tracker.export_history(url, "xml").is_err());
    }

    #[test]
    fn excluded_selectors_mask_noise() {
        let (_dir, tracker) = tracker();
        let options = TrackOptions {
            excluded_selectors: vec![".timestamp".to_string()],
            ..TrackOptions::default()
        };
        let url = "https://example.com/d";
        tracker
            .create_baseline(
                url,
                r#"<body><p>Stable</p><div class="timestamp">10:00</div></body>"#,
                &options,
            )
            .expect("baseline");
        let record = tracker
            .compare(
                url,
                r#"<body><p>Stable</p><div class="timestamp">10:05</div></body>"#,
                &options,
            )
            .expect("compare");
        assert_eq!(record.significance, Significance::None);
    }

    #[test]
    fn alert_rules_persist() {
        let (_dir, tracker) = tracker();
        let rule = tracker
            .create_alert_rule(
                "https://example.com/e",
                Significance::Major,
                "https://hooks.example.com/x",
            )
            .expect("rule");
        assert_eq!(tracker.alert_rules().len(), 1);
        assert_eq!(tracker.alert_rules()[0].rule_id, rule.rule_id);
    }

    #[test]
    fn element_granularity_requires_selector() {
        let (_dir, tracker) = tracker();
        let options = TrackOptions {
            granularity: Granularity::Element,
            ..TrackOptions::default()
        };
        let err = tracker
            .create_baseline("https://example.com/f", V1, &options)
            .unwrap_err();
        assert_eq!(err.kind(), "InvalidArgument");
    }
}
