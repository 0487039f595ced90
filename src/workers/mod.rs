//! Bounded CPU worker pool
//!
//! Parsing, hashing, and scoring run here instead of on the async
//! runtime. Concurrency is bounded by a worker semaphore; a second
//! queue semaphore bounds how much work may pile up behind it, so
//! submission exerts back-pressure instead of growing without limit.
//! Each task has a timeout; a task that overruns is abandoned (its
//! thread cannot be killed) but its worker slot is only released when
//! the task actually finishes, keeping the concurrency bound truthful.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::WorkerConfig;
use crate::error::{HarvestError, HarvestResult};

pub struct WorkerPool {
    workers: Arc<Semaphore>,
    queue: Arc<Semaphore>,
    task_timeout: Duration,
    active: Arc<AtomicUsize>,
    timed_out: AtomicU64,
    crashed: AtomicU64,
}

impl WorkerPool {
    #[must_use]
    pub fn new(config: &WorkerConfig, worker_count: usize) -> Self {
        Self {
            workers: Arc::new(Semaphore::new(worker_count.max(1))),
            queue: Arc::new(Semaphore::new(config.queue_size.max(1))),
            task_timeout: Duration::from_millis(config.task_timeout_ms),
            active: Arc::new(AtomicUsize::new(0)),
            timed_out: AtomicU64::new(0),
            crashed: AtomicU64::new(0),
        }
    }

    /// Run a CPU-bound closure on the pool.
    ///
    /// Blocks (asynchronously) while the queue is full, honors `cancel`
    /// while waiting, and applies the per-task timeout once running.
    pub async fn submit<T, F>(&self, cancel: &CancellationToken, f: F) -> HarvestResult<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let queue_permit = tokio::select! {
            permit = Arc::clone(&self.queue).acquire_owned() => {
                permit.map_err(|_| HarvestError::internal("worker queue closed"))?
            }
            () = cancel.cancelled() => return Err(HarvestError::Cancelled),
        };

        let worker_permit = tokio::select! {
            permit = Arc::clone(&self.workers).acquire_owned() => {
                permit.map_err(|_| HarvestError::internal("worker pool closed"))?
            }
            () = cancel.cancelled() => return Err(HarvestError::Cancelled),
        };
        drop(queue_permit);

        self.active.fetch_add(1, Ordering::Relaxed);
        let active = Arc::clone(&self.active);
        let mut handle = tokio::task::spawn_blocking(f);

        let result = tokio::time::timeout(self.task_timeout, &mut handle).await;
        match result {
            Ok(join) => {
                active.fetch_sub(1, Ordering::Relaxed);
                drop(worker_permit);
                match join {
                    Ok(value) => Ok(value),
                    Err(e) => {
                        self.crashed.fetch_add(1, Ordering::Relaxed);
                        Err(HarvestError::WorkerCrashed(e.to_string()))
                    }
                }
            }
            Err(_) => {
                self.timed_out.fetch_add(1, Ordering::Relaxed);
                warn!(timeout_ms = self.task_timeout.as_millis() as u64, "worker task timed out");
                // The blocking thread cannot be interrupted. Park the
                // permit with the runaway task so capacity returns only
                // when the thread is really done.
                tokio::spawn(async move {
                    let _worker_permit = worker_permit;
                    let _ = handle.await;
                    active.fetch_sub(1, Ordering::Relaxed);
                });
                Err(HarvestError::Timeout(self.task_timeout))
            }
        }
    }

    /// Tasks currently executing (including abandoned overruns).
    #[must_use]
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// (timed_out, crashed) counters since startup.
    #[must_use]
    pub fn failure_counters(&self) -> (u64, u64) {
        (
            self.timed_out.load(Ordering::Relaxed),
            self.crashed.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(workers: usize, queue: usize, timeout_ms: u64) -> WorkerPool {
        WorkerPool::new(
            &WorkerConfig {
                count: workers,
                queue_size: queue,
                task_timeout_ms: timeout_ms,
            },
            workers,
        )
    }

    #[tokio::test]
    async fn runs_closures_and_returns_values() {
        let pool = pool(2, 8, 5_000);
        let cancel = CancellationToken::new();
        let out = pool.submit(&cancel, || 21 * 2).await.expect("result");
        assert_eq!(out, 42);
    }

    #[tokio::test]
    async fn panicking_task_reports_worker_crashed() {
        let pool = pool(1, 8, 5_000);
        let cancel = CancellationToken::new();
        let err = pool
            .submit(&cancel, || -> u32 { panic!("boom") })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "WorkerCrashed");
        assert_eq!(pool.failure_counters().1, 1);
    }

    #[tokio::test]
    async fn overrunning_task_times_out_submitter() {
        let pool = pool(1, 8, 50);
        let cancel = CancellationToken::new();
        let err = pool
            .submit(&cancel, || {
                std::thread::sleep(Duration::from_millis(300));
                0u8
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "Timeout");
        assert_eq!(pool.failure_counters().0, 1);
        // After the thread really finishes, capacity returns.
        tokio::time::sleep(Duration::from_millis(400)).await;
        let out = pool.submit(&cancel, || 7u8).await.expect("recovered");
        assert_eq!(out, 7);
    }

    #[tokio::test]
    async fn cancellation_unblocks_waiting_submitter() {
        let pool = Arc::new(pool(1, 1, 5_000));
        let cancel = CancellationToken::new();

        let busy = Arc::clone(&pool);
        let blocker_cancel = cancel.child_token();
        let blocker = tokio::spawn(async move {
            busy.submit(&blocker_cancel, || {
                std::thread::sleep(Duration::from_millis(200));
            })
            .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let waiter_cancel = CancellationToken::new();
        waiter_cancel.cancel();
        let err = pool.submit(&waiter_cancel, || ()).await.unwrap_err();
        assert_eq!(err.kind(), "Cancelled");
        let _ = blocker.await;
    }
}
