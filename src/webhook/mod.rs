//! Webhook delivery
//!
//! Events enter a size-bounded queue partitioned by target URL; a
//! single delivery loop posts them as signed JSON. Within one target
//! delivery is strictly FIFO, and event ids are assigned monotonically
//! at enqueue, so each target observes non-decreasing ids on first
//! attempt (retries are the only reordering). Priority never reorders
//! a target's own stream: it picks which target is served next and
//! which event drops on overflow. Overflow drops the oldest
//! lowest-priority event, bumps the `queue_overflow` counter, and logs
//! the dropped id to a recovery file. Exhausted retries land in an
//! append-only dead-letter log with the final error kind.

use chrono::Utc;
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{RetryConfig, WebhookConfig};
use crate::error::{HarvestError, HarvestResult};
use crate::fetch::retry::RetrySchedule;
use crate::metrics::Metrics;

type HmacSha256 = Hmac<Sha256>;

/// Delivery priority. Higher is served first across targets (never
/// within one target's stream); lower drops first on overflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventPriority {
    Low,
    Normal,
    High,
}

/// One event to deliver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub event_id: u64,
    pub kind: String,
    pub payload: serde_json::Value,
    pub target_url: String,
    pub priority: EventPriority,
    pub created_at: chrono::DateTime<Utc>,
}

/// Dead-letter record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub event_id: u64,
    pub kind: String,
    pub target_url: String,
    pub attempts: u32,
    pub error_kind: String,
    pub error_message: String,
    pub failed_at: chrono::DateTime<Utc>,
}

/// Compute the signature header value for a payload body.
#[must_use]
pub fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .unwrap_or_else(|_| unreachable!("hmac accepts any key length"));
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Verify a delivery: constant-time HMAC comparison plus a timestamp
/// skew window.
#[must_use]
pub fn verify(
    secret: &str,
    body: &[u8],
    signature_header: &str,
    timestamp_header: &str,
    max_skew: Duration,
) -> bool {
    let Some(hex_sig) = signature_header.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_sig) else {
        return false;
    };
    let Ok(ts) = timestamp_header.parse::<i64>() else {
        return false;
    };
    let skew = (Utc::now().timestamp() - ts).unsigned_abs();
    if skew > max_skew.as_secs() {
        return false;
    }
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .unwrap_or_else(|_| unreachable!("hmac accepts any key length"));
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// Pending events, one FIFO per target URL.
///
/// Per-target FIFO is the ordering invariant: a target's events leave
/// in the order they were enqueued (non-decreasing event ids)
/// regardless of priority. Priority only decides which target's head
/// is served next and which event is sacrificed on overflow.
struct Queues {
    by_target: HashMap<String, VecDeque<WebhookEvent>>,
    total: usize,
}

impl Queues {
    fn new() -> Self {
        Self {
            by_target: HashMap::new(),
            total: 0,
        }
    }

    fn len(&self) -> usize {
        self.total
    }

    fn push(&mut self, event: WebhookEvent) {
        self.by_target
            .entry(event.target_url.clone())
            .or_default()
            .push_back(event);
        self.total += 1;
    }

    /// Pop the head of the target whose head event has the highest
    /// priority; ties go to the oldest head.
    fn pop_for_delivery(&mut self) -> Option<WebhookEvent> {
        let mut best: Option<(EventPriority, u64, &String)> = None;
        for (target, queue) in &self.by_target {
            let Some(head) = queue.front() else { continue };
            let better = match best {
                Some((priority, event_id, _)) => {
                    (head.priority, std::cmp::Reverse(head.event_id))
                        > (priority, std::cmp::Reverse(event_id))
                }
                None => true,
            };
            if better {
                best = Some((head.priority, head.event_id, target));
            }
        }
        let target = best.map(|(_, _, target)| target.clone())?;

        let queue = self.by_target.get_mut(&target)?;
        let event = queue.pop_front();
        if queue.is_empty() {
            self.by_target.remove(&target);
        }
        if event.is_some() {
            self.total -= 1;
        }
        event
    }

    /// Drop the lowest-priority event overall, oldest first. Removing
    /// from the middle of a target queue keeps the remainder in id
    /// order.
    fn drop_for_overflow(&mut self) -> Option<WebhookEvent> {
        let mut victim: Option<(EventPriority, u64, String, usize)> = None;
        for (target, queue) in &self.by_target {
            for (index, event) in queue.iter().enumerate() {
                let better = match &victim {
                    Some((priority, event_id, _, _)) => {
                        (event.priority, event.event_id) < (*priority, *event_id)
                    }
                    None => true,
                };
                if better {
                    victim = Some((event.priority, event.event_id, target.clone(), index));
                }
            }
        }
        let (_, _, target, index) = victim?;

        let queue = self.by_target.get_mut(&target)?;
        let event = queue.remove(index);
        if queue.is_empty() {
            self.by_target.remove(&target);
        }
        if event.is_some() {
            self.total -= 1;
        }
        event
    }
}

pub struct WebhookDispatcher {
    config: WebhookConfig,
    client: reqwest::Client,
    queues: Mutex<Queues>,
    notify: Notify,
    next_id: AtomicU64,
    schedule: RetrySchedule,
    dlq_path: PathBuf,
    recovery_path: PathBuf,
    metrics: Arc<Metrics>,
    delivered: AtomicU64,
    failed: AtomicU64,
}

impl WebhookDispatcher {
    pub fn new(
        config: WebhookConfig,
        data_dir: &std::path::Path,
        client: reqwest::Client,
        metrics: Arc<Metrics>,
    ) -> HarvestResult<Arc<Self>> {
        let dir = data_dir.join("webhooks");
        std::fs::create_dir_all(&dir)?;
        // Webhook backoff starts at 2s and doubles, per delivery
        // contract; attempts come from configuration.
        let schedule = RetrySchedule::new(RetryConfig {
            max_attempts: config.max_attempts.max(1),
            base_backoff_ms: 2_000,
            backoff_factor: 2.0,
            max_backoff_ms: 30_000,
            jitter: 0.2,
        });
        Ok(Arc::new(Self {
            config,
            client,
            queues: Mutex::new(Queues::new()),
            notify: Notify::new(),
            next_id: AtomicU64::new(1),
            schedule,
            dlq_path: dir.join("dlq.jsonl"),
            recovery_path: dir.join("dropped.jsonl"),
            metrics,
            delivered: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }))
    }

    /// Queue an event for delivery. Returns its assigned event id.
    pub fn enqueue(
        &self,
        kind: &str,
        payload: serde_json::Value,
        target_url: &str,
        priority: EventPriority,
    ) -> u64 {
        let event_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let event = WebhookEvent {
            event_id,
            kind: kind.to_string(),
            payload,
            target_url: target_url.to_string(),
            priority,
            created_at: Utc::now(),
        };

        {
            let mut queues = self.queues.lock();
            if queues.len() >= self.config.queue_size {
                if let Some(dropped) = queues.drop_for_overflow() {
                    self.metrics.inc("queue_overflow", "");
                    warn!(
                        dropped_event = dropped.event_id,
                        kind = %dropped.kind,
                        "webhook queue overflow"
                    );
                    self.append_json(
                        &self.recovery_path,
                        &serde_json::json!({
                            "event_id": dropped.event_id,
                            "kind": dropped.kind,
                            "target_url": dropped.target_url,
                            "dropped_at": Utc::now(),
                        }),
                    );
                }
            }
            queues.push(event);
        }
        self.notify.notify_one();
        event_id
    }

    /// Queued events not yet delivered.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.queues.lock().len()
    }

    /// (delivered, failed) since startup.
    #[must_use]
    pub fn counters(&self) -> (u64, u64) {
        (
            self.delivered.load(Ordering::Relaxed),
            self.failed.load(Ordering::Relaxed),
        )
    }

    /// Run the delivery loop until cancelled. Spawn this once.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!("webhook dispatcher started");
        loop {
            let event = { self.queues.lock().pop_for_delivery() };
            match event {
                Some(event) => self.deliver_with_retries(event, &cancel).await,
                None => {
                    tokio::select! {
                        () = self.notify.notified() => {}
                        () = cancel.cancelled() => break,
                    }
                }
            }
            if cancel.is_cancelled() && self.pending() == 0 {
                break;
            }
        }
        info!("webhook dispatcher stopped");
    }

    async fn deliver_with_retries(&self, event: WebhookEvent, cancel: &CancellationToken) {
        let body = match serde_json::to_vec(&event.payload) {
            Ok(body) => body,
            Err(e) => {
                warn!(event_id = event.event_id, error = %e, "unserializable payload");
                self.dead_letter(&event, 0, "CorruptArtifact", &e.to_string());
                return;
            }
        };

        let max_attempts = self.schedule.max_attempts();
        let mut last_error = (String::from("InternalError"), String::new());

        for attempt in 1..=max_attempts {
            match self.attempt(&event, &body).await {
                Ok(status) => {
                    debug!(
                        event_id = event.event_id,
                        status,
                        attempt,
                        "webhook delivered"
                    );
                    self.delivered.fetch_add(1, Ordering::Relaxed);
                    self.metrics.inc("webhook_delivered", "");
                    return;
                }
                Err(e) => {
                    warn!(
                        event_id = event.event_id,
                        attempt,
                        error = %e,
                        "webhook attempt failed"
                    );
                    last_error = (e.kind().to_string(), e.to_string());
                    if attempt < max_attempts {
                        let wait = self.schedule.backoff(attempt);
                        tokio::select! {
                            () = tokio::time::sleep(wait) => {}
                            () = cancel.cancelled() => {
                                self.dead_letter(&event, attempt, "Cancelled", "shutdown");
                                return;
                            }
                        }
                    }
                }
            }
        }

        self.failed.fetch_add(1, Ordering::Relaxed);
        self.metrics.inc("webhook_failed", "");
        self.dead_letter(&event, max_attempts, &last_error.0, &last_error.1);
    }

    async fn attempt(&self, event: &WebhookEvent, body: &[u8]) -> HarvestResult<u16> {
        let secret = self.config.signing_secret.as_deref().unwrap_or_default();
        let signature = sign(secret, body);
        let timestamp = Utc::now().timestamp().to_string();

        let response = self
            .client
            .post(&event.target_url)
            .timeout(Duration::from_millis(self.config.timeout_ms))
            .header("Content-Type", "application/json")
            .header("X-Signature", signature)
            .header("X-Event-Id", event.event_id.to_string())
            .header("X-Timestamp", timestamp)
            .body(body.to_vec())
            .send()
            .await
            .map_err(HarvestError::from)?;

        let status = response.status().as_u16();
        if response.status().is_success() {
            Ok(status)
        } else {
            Err(HarvestError::HttpStatus(status))
        }
    }

    fn dead_letter(&self, event: &WebhookEvent, attempts: u32, kind: &str, message: &str) {
        let record = DeadLetter {
            event_id: event.event_id,
            kind: event.kind.clone(),
            target_url: event.target_url.clone(),
            attempts,
            error_kind: kind.to_string(),
            error_message: message.to_string(),
            failed_at: Utc::now(),
        };
        if let Ok(value) = serde_json::to_value(&record) {
            self.append_json(&self.dlq_path, &value);
        }
    }

    fn append_json(&self, path: &PathBuf, value: &serde_json::Value) {
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut f| writeln!(f, "{value}"));
        if let Err(e) = result {
            warn!(error = %e, "failed to append webhook log");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_matches_known_hmac() {
        // Any byte change in payload or key moves the signature.
        let sig = sign("s", br#"{"a":1}"#);
        assert!(sig.starts_with("sha256="));
        let altered = sign("s", br#"{"a":2}"#);
        assert_ne!(sig, altered);
        let other_key = sign("t", br#"{"a":1}"#);
        assert_ne!(sig, other_key);
    }

    #[test]
    fn verify_round_trips_and_rejects_tampering() {
        let body = br#"{"hello":"world"}"#;
        let sig = sign("secret", body);
        let ts = Utc::now().timestamp().to_string();
        assert!(verify("secret", body, &sig, &ts, Duration::from_secs(300)));
        assert!(!verify("secret", b"tampered", &sig, &ts, Duration::from_secs(300)));
        assert!(!verify("wrong", body, &sig, &ts, Duration::from_secs(300)));
    }

    #[test]
    fn verify_rejects_stale_timestamp() {
        let body = b"x";
        let sig = sign("k", body);
        let stale = (Utc::now().timestamp() - 3_600).to_string();
        assert!(!verify("k", body, &sig, &stale, Duration::from_secs(300)));
    }

    fn dispatcher(queue_size: usize) -> (tempfile::TempDir, Arc<WebhookDispatcher>) {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = WebhookConfig {
            queue_size,
            signing_secret: Some("s".into()),
            ..WebhookConfig::default()
        };
        let dispatcher = WebhookDispatcher::new(
            config,
            dir.path(),
            reqwest::Client::new(),
            Arc::new(Metrics::new()),
        )
        .expect("dispatcher");
        (dir, dispatcher)
    }

    #[test]
    fn overflow_drops_lowest_priority_oldest() {
        let (_dir, d) = dispatcher(2);
        let first = d.enqueue("a", serde_json::json!(1), "http://t", EventPriority::Low);
        let second = d.enqueue("b", serde_json::json!(2), "http://t", EventPriority::High);
        assert_eq!(d.pending(), 2);

        let third = d.enqueue("c", serde_json::json!(3), "http://t", EventPriority::Normal);
        assert_eq!(d.pending(), 2, "overflow keeps the queue at capacity");

        // The dropped event is the oldest low-priority one; the
        // survivors still leave in id order.
        {
            let mut queues = d.queues.lock();
            let pop1 = queues.pop_for_delivery().expect("event");
            let pop2 = queues.pop_for_delivery().expect("event");
            assert_eq!(pop1.event_id, second);
            assert_eq!(pop2.event_id, third);
            assert!(queues.pop_for_delivery().is_none());
        }
        let recovery = std::fs::read_to_string(
            _dir.path().join("webhooks").join("dropped.jsonl"),
        )
        .expect("recovery log");
        assert!(recovery.contains(&format!("\"event_id\":{first}")));
    }

    #[test]
    fn priority_never_reorders_one_targets_stream() {
        let (_dir, d) = dispatcher(100);
        let low = d.enqueue("a", serde_json::json!(1), "http://t", EventPriority::Low);
        let high = d.enqueue("b", serde_json::json!(2), "http://t", EventPriority::High);

        let mut queues = d.queues.lock();
        let pop1 = queues.pop_for_delivery().expect("event");
        let pop2 = queues.pop_for_delivery().expect("event");
        assert_eq!(pop1.event_id, low, "earlier id leaves first despite priority");
        assert_eq!(pop2.event_id, high);
    }

    #[test]
    fn priority_orders_across_targets() {
        let (_dir, d) = dispatcher(100);
        let low = d.enqueue("a", serde_json::json!(1), "http://t1", EventPriority::Low);
        let high = d.enqueue("b", serde_json::json!(2), "http://t2", EventPriority::High);

        let mut queues = d.queues.lock();
        let pop1 = queues.pop_for_delivery().expect("event");
        let pop2 = queues.pop_for_delivery().expect("event");
        assert_eq!(pop1.event_id, high, "high-priority target served first");
        assert_eq!(pop2.event_id, low);
    }

    #[test]
    fn event_ids_are_monotonic() {
        let (_dir, d) = dispatcher(100);
        let a = d.enqueue("k", serde_json::json!({}), "http://t", EventPriority::Normal);
        let b = d.enqueue("k", serde_json::json!({}), "http://t", EventPriority::Normal);
        let c = d.enqueue("k", serde_json::json!({}), "http://t", EventPriority::High);
        assert!(a < b && b < c);
    }
}
