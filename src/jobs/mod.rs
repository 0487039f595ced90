//! Async job manager
//!
//! Batch tool invocations run as persistent jobs: a three-level
//! priority queue (FIFO within a level), exclusive single-worker
//! leases, progress snapshots throttled to one persist per second,
//! cooperative cancellation, and retention-based expiry that purges
//! records and result blobs. Job ids are random 128-bit values, so a
//! status poll cannot guess another caller's job.

pub mod store;

use chrono::{Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::JobConfig;
use crate::error::{HarvestError, HarvestResult};

pub use store::{JobPriority, JobRecord, JobStatus, JobStore};

/// Executes one job kind. The engine registers a dispatcher that maps
/// `kind` to the matching core operation; components reference each
/// other only through ids.
pub trait JobExecutor: Send + Sync {
    fn execute<'a>(
        &'a self,
        record: &'a JobRecord,
        ctx: JobContext,
    ) -> BoxFuture<'a, HarvestResult<serde_json::Value>>;
}

/// Handed to executors: cancellation plus throttled progress
/// reporting.
#[derive(Clone)]
pub struct JobContext {
    pub cancel: CancellationToken,
    manager: Arc<JobManagerInner>,
    job_id: String,
}

impl JobContext {
    /// Record progress in `[0, 1]`; persisted at most once per second.
    pub fn progress(&self, fraction: f64) {
        self.manager.update_progress(&self.job_id, fraction.clamp(0.0, 1.0));
    }
}

struct QueueSet {
    high: VecDeque<String>,
    normal: VecDeque<String>,
    low: VecDeque<String>,
}

impl QueueSet {
    fn push(&mut self, priority: JobPriority, job_id: String) {
        match priority {
            JobPriority::High => self.high.push_back(job_id),
            JobPriority::Normal => self.normal.push_back(job_id),
            JobPriority::Low => self.low.push_back(job_id),
        }
    }

    fn pop(&mut self) -> Option<String> {
        self.high
            .pop_front()
            .or_else(|| self.normal.pop_front())
            .or_else(|| self.low.pop_front())
    }

    fn len(&self) -> usize {
        self.high.len() + self.normal.len() + self.low.len()
    }
}

struct JobManagerInner {
    config: JobConfig,
    store: JobStore,
    records: DashMap<String, JobRecord>,
    queues: Mutex<QueueSet>,
    notify: Notify,
    cancel_tokens: DashMap<String, CancellationToken>,
    last_persisted: DashMap<String, Instant>,
}

impl JobManagerInner {
    /// Advance a job's status, enforcing monotonicity; persists.
    fn transition(&self, job_id: &str, status: JobStatus) -> bool {
        let Some(mut record) = self.records.get_mut(job_id) else {
            return false;
        };
        if status.rank() < record.status.rank()
            || (record.status.is_terminal() && record.status != status)
        {
            debug!(
                job_id = %job_id,
                from = record.status.as_str(),
                to = status.as_str(),
                "transition refused"
            );
            return false;
        }
        if record.status == status {
            return false;
        }
        record.status = status;
        record.updated_at = Utc::now();
        let snapshot = record.clone();
        drop(record);
        if let Err(e) = self.store.save(&snapshot) {
            warn!(job_id = %job_id, error = %e, "job persist failed");
        }
        true
    }

    fn update_progress(&self, job_id: &str, fraction: f64) {
        let Some(mut record) = self.records.get_mut(job_id) else {
            return;
        };
        record.progress = fraction;
        record.updated_at = Utc::now();
        let snapshot = record.clone();
        drop(record);

        // Persist at most once per second per job.
        let now = Instant::now();
        let due = self
            .last_persisted
            .get(job_id)
            .is_none_or(|t| now.duration_since(*t) >= Duration::from_secs(1));
        if due {
            self.last_persisted.insert(job_id.to_string(), now);
            if let Err(e) = self.store.save(&snapshot) {
                warn!(job_id = %job_id, error = %e, "progress persist failed");
            }
        }
    }
}

pub struct JobManager {
    inner: Arc<JobManagerInner>,
}

impl JobManager {
    pub fn new(config: JobConfig, data_dir: &std::path::Path) -> HarvestResult<Self> {
        let store = JobStore::new(data_dir)?;
        let inner = Arc::new(JobManagerInner {
            config,
            store,
            records: DashMap::new(),
            queues: Mutex::new(QueueSet {
                high: VecDeque::new(),
                normal: VecDeque::new(),
                low: VecDeque::new(),
            }),
            notify: Notify::new(),
            cancel_tokens: DashMap::new(),
            last_persisted: DashMap::new(),
        });

        let manager = Self { inner };
        manager.recover();
        Ok(manager)
    }

    /// Reconcile disk state after a restart: queued jobs re-enqueue,
    /// jobs left `running` by a dead process fail, expired ones purge.
    fn recover(&self) {
        let now = Utc::now();
        for mut record in self.inner.store.load_all() {
            if record.is_expired_at(now) {
                self.inner.store.purge(&record.job_id);
                continue;
            }
            match record.status {
                JobStatus::Queued => {
                    self.inner
                        .queues
                        .lock()
                        .push(record.priority, record.job_id.clone());
                    self.inner.records.insert(record.job_id.clone(), record);
                }
                JobStatus::Running => {
                    warn!(job_id = %record.job_id, "orphaned running job marked failed");
                    record.status = JobStatus::Failed;
                    record.error_kind = Some("WorkerCrashed".into());
                    record.error_message = Some("interrupted by restart".into());
                    record.updated_at = now;
                    let _ = self.inner.store.save(&record);
                    self.inner.records.insert(record.job_id.clone(), record);
                }
                _ => {
                    self.inner.records.insert(record.job_id.clone(), record);
                }
            }
        }
        self.inner.notify.notify_waiters();
    }

    /// Persist and enqueue a new job; returns its id.
    pub fn submit(
        &self,
        kind: &str,
        params: serde_json::Value,
        priority: JobPriority,
    ) -> HarvestResult<String> {
        {
            let queues = self.inner.queues.lock();
            if queues.len() >= self.inner.config.queue_size {
                return Err(HarvestError::QueueOverflow("job queue"));
            }
        }

        let job_id = format!("{:032x}", rand::random::<u128>());
        let now = Utc::now();
        let record = JobRecord {
            job_id: job_id.clone(),
            kind: kind.to_string(),
            params,
            status: JobStatus::Queued,
            priority,
            progress: 0.0,
            created_at: now,
            updated_at: now,
            expires_at: now + ChronoDuration::milliseconds(self.inner.config.retention_ms as i64),
            error_kind: None,
            error_message: None,
        };

        // Persist before acknowledging the submission.
        self.inner.store.save(&record)?;
        self.inner.records.insert(job_id.clone(), record);
        self.inner.queues.lock().push(priority, job_id.clone());
        self.inner.notify.notify_one();
        info!(job_id = %job_id, kind = %kind, "job queued");
        Ok(job_id)
    }

    /// Current record for a job.
    pub fn status(&self, job_id: &str) -> HarvestResult<JobRecord> {
        let record = self
            .inner
            .records
            .get(job_id)
            .map(|r| r.clone())
            .ok_or_else(|| HarvestError::JobNotFound(job_id.to_string()))?;
        if record.is_expired_at(Utc::now()) && !record.status.is_terminal() {
            self.inner.transition(job_id, JobStatus::Expired);
            return self.status(job_id);
        }
        Ok(record)
    }

    /// Stored result of a completed job.
    pub fn result(&self, job_id: &str) -> HarvestResult<serde_json::Value> {
        let record = self.status(job_id)?;
        match record.status {
            JobStatus::Completed => self.inner.store.read_result(job_id),
            JobStatus::Cancelled => Err(HarvestError::JobCancelled(job_id.to_string())),
            JobStatus::Expired => Err(HarvestError::JobExpired(job_id.to_string())),
            _ => Err(HarvestError::InvalidArgument(format!(
                "job {job_id} is {}",
                record.status.as_str()
            ))),
        }
    }

    /// Request cancellation. Queued jobs cancel immediately; running
    /// jobs are signalled and marked once the worker yields.
    pub fn cancel(&self, job_id: &str) -> HarvestResult<JobRecord> {
        let record = self.status(job_id)?;
        match record.status {
            JobStatus::Queued => {
                self.inner.transition(job_id, JobStatus::Cancelled);
            }
            JobStatus::Running => {
                if let Some(token) = self.inner.cancel_tokens.get(job_id) {
                    token.cancel();
                }
                self.inner.transition(job_id, JobStatus::Cancelled);
            }
            _ => {}
        }
        self.status(job_id)
    }

    /// Jobs currently queued.
    #[must_use]
    pub fn queue_depth(&self) -> usize {
        self.inner.queues.lock().len()
    }

    /// Purge expired jobs and their results; returns how many.
    pub fn reap_expired(&self) -> usize {
        let now = Utc::now();
        let expired: Vec<String> = self
            .inner
            .records
            .iter()
            .filter(|r| r.value().is_expired_at(now))
            .map(|r| r.key().clone())
            .collect();
        let count = expired.len();
        for job_id in expired {
            self.inner.transition(&job_id, JobStatus::Expired);
            self.inner.records.remove(&job_id);
            self.inner.cancel_tokens.remove(&job_id);
            self.inner.store.purge(&job_id);
            debug!(job_id = %job_id, "job reaped");
        }
        count
    }

    /// Run `worker_count` executor loops plus the expiry reaper until
    /// `shutdown` fires.
    pub fn run(
        &self,
        executor: Arc<dyn JobExecutor>,
        shutdown: CancellationToken,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::new();
        for worker in 0..self.inner.config.workers.max(1) {
            let inner = Arc::clone(&self.inner);
            let executor = Arc::clone(&executor);
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                worker_loop(worker, inner, executor, shutdown).await;
            }));
        }

        // Reaper: hourly expiry sweep.
        let inner = Arc::clone(&self.inner);
        let shutdown_reaper = shutdown.clone();
        handles.push(tokio::spawn(async move {
            let manager = JobManager { inner };
            loop {
                tokio::select! {
                    () = tokio::time::sleep(Duration::from_secs(3_600)) => {
                        let reaped = manager.reap_expired();
                        if reaped > 0 {
                            info!(reaped, "expired jobs purged");
                        }
                    }
                    () = shutdown_reaper.cancelled() => break,
                }
            }
        }));
        handles
    }
}

async fn worker_loop(
    worker: usize,
    inner: Arc<JobManagerInner>,
    executor: Arc<dyn JobExecutor>,
    shutdown: CancellationToken,
) {
    debug!(worker, "job worker started");
    loop {
        let job_id = { inner.queues.lock().pop() };
        let Some(job_id) = job_id else {
            tokio::select! {
                () = inner.notify.notified() => continue,
                () = shutdown.cancelled() => break,
            }
        };

        // Lease: only the worker that flips queued -> running owns the
        // job; anything else (cancelled while queued) is skipped.
        if !inner.transition(&job_id, JobStatus::Running) {
            continue;
        }
        let Some(record) = inner.records.get(&job_id).map(|r| r.clone()) else {
            continue;
        };

        let cancel = CancellationToken::new();
        inner.cancel_tokens.insert(job_id.clone(), cancel.clone());
        let ctx = JobContext {
            cancel: cancel.clone(),
            manager: Arc::clone(&inner),
            job_id: job_id.clone(),
        };

        info!(worker, job_id = %job_id, kind = %record.kind, "job leased");
        let outcome = tokio::select! {
            outcome = executor.execute(&record, ctx) => outcome,
            () = shutdown.cancelled() => Err(HarvestError::Cancelled),
        };

        match outcome {
            Ok(result) => {
                if let Err(e) = inner.store.write_result(&job_id, &result) {
                    warn!(job_id = %job_id, error = %e, "result persist failed");
                }
                if inner.transition(&job_id, JobStatus::Completed) {
                    inner.update_progress(&job_id, 1.0);
                }
            }
            Err(HarvestError::Cancelled) | Err(HarvestError::JobCancelled(_)) => {
                inner.transition(&job_id, JobStatus::Cancelled);
            }
            Err(e) => {
                if let Some(mut r) = inner.records.get_mut(&job_id) {
                    r.error_kind = Some(e.kind().to_string());
                    r.error_message = Some(e.to_string());
                }
                inner.transition(&job_id, JobStatus::Failed);
                warn!(job_id = %job_id, error = %e, "job failed");
            }
        }
        inner.cancel_tokens.remove(&job_id);
    }
    debug!(worker, "job worker stopped");
}
