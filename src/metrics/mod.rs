//! Metrics and health
//!
//! Lightweight label-aware counters, fixed-bucket duration histograms,
//! and gauges, all lock-free or behind tiny mutexes. A snapshot is
//! serializable and feeds both the `server_health` tool and the
//! readiness probe.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

/// Histogram bucket upper bounds in milliseconds.
const BUCKETS_MS: &[u64] = &[
    5, 10, 25, 50, 100, 250, 500, 1_000, 2_500, 5_000, 10_000, 30_000, 60_000,
];

#[derive(Debug, Default)]
struct Histogram {
    buckets: [u64; 14],
    sum_ms: u64,
    count: u64,
}

impl Histogram {
    fn observe(&mut self, duration: Duration) {
        let ms = duration.as_millis() as u64;
        let idx = BUCKETS_MS
            .iter()
            .position(|&bound| ms <= bound)
            .unwrap_or(BUCKETS_MS.len());
        self.buckets[idx] += 1;
        self.sum_ms += ms;
        self.count += 1;
    }
}

/// Serializable histogram summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistogramSnapshot {
    pub count: u64,
    pub sum_ms: u64,
    pub mean_ms: f64,
    pub buckets: BTreeMap<String, u64>,
}

/// Point-in-time metrics dump.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MetricsSnapshot {
    pub counters: BTreeMap<String, u64>,
    pub gauges: BTreeMap<String, i64>,
    pub histograms: BTreeMap<String, HistogramSnapshot>,
}

/// Shared metrics registry.
#[derive(Default)]
pub struct Metrics {
    counters: DashMap<String, AtomicU64>,
    gauges: DashMap<String, AtomicI64>,
    histograms: DashMap<String, Mutex<Histogram>>,
}

impl Metrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment `name{label}` by one.
    pub fn inc(&self, name: &str, label: &str) {
        let key = if label.is_empty() {
            name.to_string()
        } else {
            format!("{name}{{{label}}}")
        };
        self.counters
            .entry(key)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_gauge(&self, name: &str, value: i64) {
        self.gauges
            .entry(name.to_string())
            .or_insert_with(|| AtomicI64::new(0))
            .store(value, Ordering::Relaxed);
    }

    pub fn observe(&self, name: &str, duration: Duration) {
        self.histograms
            .entry(name.to_string())
            .or_insert_with(|| Mutex::new(Histogram::default()))
            .lock()
            .observe(duration);
    }

    #[must_use]
    pub fn counter(&self, name: &str, label: &str) -> u64 {
        let key = if label.is_empty() {
            name.to_string()
        } else {
            format!("{name}{{{label}}}")
        };
        self.counters
            .get(&key)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let counters = self
            .counters
            .iter()
            .map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed)))
            .collect();
        let gauges = self
            .gauges
            .iter()
            .map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed)))
            .collect();
        let histograms = self
            .histograms
            .iter()
            .map(|e| {
                let h = e.value().lock();
                let mut buckets = BTreeMap::new();
                for (i, bound) in BUCKETS_MS.iter().enumerate() {
                    buckets.insert(format!("le_{bound}"), h.buckets[i]);
                }
                buckets.insert("le_inf".to_string(), h.buckets[BUCKETS_MS.len()]);
                let mean_ms = if h.count > 0 {
                    h.sum_ms as f64 / h.count as f64
                } else {
                    0.0
                };
                (
                    e.key().clone(),
                    HistogramSnapshot {
                        count: h.count,
                        sum_ms: h.sum_ms,
                        mean_ms,
                        buckets,
                    },
                )
            })
            .collect();
        MetricsSnapshot {
            counters,
            gauges,
            histograms,
        }
    }
}

/// Component readiness state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentState {
    Ok,
    Degraded,
    Critical,
}

/// Liveness/readiness report for the `server_health` tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub live: bool,
    pub ready: bool,
    pub components: BTreeMap<String, ComponentState>,
}

impl HealthReport {
    /// Ready unless any component is critical.
    #[must_use]
    pub fn evaluate(components: BTreeMap<String, ComponentState>) -> Self {
        let ready = components
            .values()
            .all(|s| *s != ComponentState::Critical);
        Self {
            live: true,
            ready,
            components,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_with_labels() {
        let metrics = Metrics::new();
        metrics.inc("requests_total", "tool=fetch_url");
        metrics.inc("requests_total", "tool=fetch_url");
        metrics.inc("requests_total", "tool=crawl_deep");
        assert_eq!(metrics.counter("requests_total", "tool=fetch_url"), 2);
        assert_eq!(metrics.counter("requests_total", "tool=crawl_deep"), 1);
        assert_eq!(metrics.counter("requests_total", "tool=missing"), 0);
    }

    #[test]
    fn histogram_buckets_and_mean() {
        let metrics = Metrics::new();
        metrics.observe("fetch_duration", Duration::from_millis(8));
        metrics.observe("fetch_duration", Duration::from_millis(300));
        let snap = metrics.snapshot();
        let h = &snap.histograms["fetch_duration"];
        assert_eq!(h.count, 2);
        assert_eq!(h.buckets["le_10"], 1);
        assert_eq!(h.buckets["le_500"], 1);
        assert!((h.mean_ms - 154.0).abs() < 1.0);
    }

    #[test]
    fn gauges_overwrite() {
        let metrics = Metrics::new();
        metrics.set_gauge("inflight_fetches", 5);
        metrics.set_gauge("inflight_fetches", 2);
        assert_eq!(metrics.snapshot().gauges["inflight_fetches"], 2);
    }

    #[test]
    fn readiness_fails_on_critical_component() {
        let mut components = BTreeMap::new();
        components.insert("cache".to_string(), ComponentState::Ok);
        components.insert("webhooks".to_string(), ComponentState::Degraded);
        let report = HealthReport::evaluate(components.clone());
        assert!(report.ready);

        components.insert("jobs".to_string(), ComponentState::Critical);
        let report = HealthReport::evaluate(components);
        assert!(report.live);
        assert!(!report.ready);
    }
}
