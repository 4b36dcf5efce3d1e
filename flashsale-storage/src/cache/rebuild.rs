//! Bounded pool for background cache rebuilds.
//!
//! Rebuilds run as tokio tasks gated by a semaphore, so at most `workers`
//! loaders run at once no matter how many keys expire together. Every
//! submission returns a [`RebuildHandle`] that resolves with the outcome.

use flashsale_core::CacheError;
use futures_util::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{oneshot, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// How a rebuild ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebuildOutcome {
    /// Loader returned a value; the entry was rewritten with a new deadline.
    Refreshed,
    /// Loader found nothing; the entry was removed.
    Evicted,
    /// Another rebuild had already refreshed the entry.
    AlreadyFresh,
    Failed(String),
}

/// Completion handle for one submitted rebuild.
#[derive(Debug)]
pub struct RebuildHandle {
    key: String,
    rx: oneshot::Receiver<RebuildOutcome>,
}

impl RebuildHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Wait for the rebuild to finish.
    pub async fn wait(self) -> Result<RebuildOutcome, CacheError> {
        self.rx
            .await
            .map_err(|_| CacheError::RebuildCancelled { key: self.key })
    }
}

#[derive(Debug, Default)]
struct PoolCounters {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    in_flight: AtomicU64,
}

/// Snapshot of pool metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RebuildMetrics {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub in_flight: u64,
}

#[derive(Debug)]
pub struct RebuildPool {
    workers: usize,
    permits: Arc<Semaphore>,
    tasks: Mutex<JoinSet<()>>,
    counters: Arc<PoolCounters>,
    closed: AtomicBool,
}

impl RebuildPool {
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        Self {
            workers,
            permits: Arc::new(Semaphore::new(workers)),
            tasks: Mutex::new(JoinSet::new()),
            counters: Arc::new(PoolCounters::default()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Queue a rebuild job. Must be called from within a tokio runtime.
    pub fn submit<F>(&self, key: impl Into<String>, job: F) -> Result<RebuildHandle, CacheError>
    where
        F: Future<Output = RebuildOutcome> + Send + 'static,
    {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CacheError::PoolClosed);
        }
        let key = key.into();
        let (tx, rx) = oneshot::channel();
        let permits = Arc::clone(&self.permits);
        let counters = Arc::clone(&self.counters);
        let task_key = key.clone();

        let mut tasks = self.tasks.lock().map_err(|_| CacheError::PoolClosed)?;
        while tasks.try_join_next().is_some() {}

        counters.submitted.fetch_add(1, Ordering::Relaxed);
        tasks.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                let _ = tx.send(RebuildOutcome::Failed("rebuild pool closed".to_string()));
                return;
            };
            counters.in_flight.fetch_add(1, Ordering::Relaxed);
            let outcome = AssertUnwindSafe(job)
                .catch_unwind()
                .await
                .unwrap_or_else(|_| RebuildOutcome::Failed("rebuild panicked".to_string()));
            counters.in_flight.fetch_sub(1, Ordering::Relaxed);

            match &outcome {
                RebuildOutcome::Failed(reason) => {
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    warn!(key = %task_key, reason = %reason, "cache rebuild failed");
                }
                other => {
                    counters.completed.fetch_add(1, Ordering::Relaxed);
                    debug!(key = %task_key, outcome = ?other, "cache rebuild finished");
                }
            }
            let _ = tx.send(outcome);
        });

        Ok(RebuildHandle { key, rx })
    }

    pub fn metrics(&self) -> RebuildMetrics {
        RebuildMetrics {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            in_flight: self.counters.in_flight.load(Ordering::Relaxed),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop accepting work, wait up to `grace` for queued rebuilds, then
    /// abort whatever is left.
    pub async fn shutdown(&self, grace: Duration) -> RebuildMetrics {
        self.closed.store(true, Ordering::SeqCst);
        let mut tasks = match self.tasks.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(_) => JoinSet::new(),
        };

        let drained = tokio::time::timeout(grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                remaining = tasks.len(),
                "rebuild pool did not drain within grace period, aborting"
            );
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }
        self.permits.close();

        let metrics = self.metrics();
        info!(
            submitted = metrics.submitted,
            completed = metrics.completed,
            failed = metrics.failed,
            "rebuild pool stopped"
        );
        metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_handle_reports_outcome() {
        let pool = RebuildPool::new(2);
        let handle = pool
            .submit("cache:1", async { RebuildOutcome::Refreshed })
            .unwrap();
        assert_eq!(handle.key(), "cache:1");
        assert_eq!(handle.wait().await.unwrap(), RebuildOutcome::Refreshed);

        let handle = pool
            .submit("cache:2", async { RebuildOutcome::Failed("boom".into()) })
            .unwrap();
        assert!(matches!(handle.wait().await.unwrap(), RebuildOutcome::Failed(_)));

        let metrics = pool.metrics();
        assert_eq!(metrics.submitted, 2);
        assert_eq!(metrics.completed, 1);
        assert_eq!(metrics.failed, 1);
        assert_eq!(metrics.in_flight, 0);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let pool = RebuildPool::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..8 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            handles.push(
                pool.submit(format!("k{}", i), async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    RebuildOutcome::Refreshed
                })
                .unwrap(),
            );
        }
        for handle in handles {
            handle.wait().await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_panicking_job_is_reported_as_failure() {
        let pool = RebuildPool::new(1);
        let handle = pool
            .submit("k", async {
                if true {
                    panic!("loader bug");
                }
                RebuildOutcome::Refreshed
            })
            .unwrap();
        assert!(matches!(handle.wait().await.unwrap(), RebuildOutcome::Failed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_aborts_after_grace() {
        let pool = RebuildPool::new(1);
        let handle = pool
            .submit("slow", async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                RebuildOutcome::Refreshed
            })
            .unwrap();

        pool.shutdown(Duration::from_secs(1)).await;
        assert!(pool.is_closed());
        assert!(matches!(
            handle.wait().await,
            Err(CacheError::RebuildCancelled { .. })
        ));
        assert!(matches!(
            pool.submit("late", async { RebuildOutcome::Refreshed }),
            Err(CacheError::PoolClosed)
        ));
    }
}
