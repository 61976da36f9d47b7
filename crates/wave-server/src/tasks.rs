//! Bounded pool for fire-and-forget background work.
//!
//! Handlers hand off work that must not delay their response. Work that has
//! to happen (stopping a controller after a delete) waits for a worker;
//! best-effort work (bumping activity counters) is dropped when the pool is
//! busy. A panicking task is logged and counted; it never takes the server
//! down.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, warn};

/// Process activity counters.
#[derive(Debug, Default)]
pub struct ActivityCounters {
    spawned: AtomicU64,
    queued: AtomicU64,
    completed: AtomicU64,
    rejected: AtomicU64,
    panics: AtomicU64,
    renderers: Mutex<BTreeMap<String, u64>>,
}

impl ActivityCounters {
    /// Count one more block created with `view`.
    pub fn record_renderer(&self, view: &str) {
        let mut renderers = self.renderers.lock().unwrap_or_else(PoisonError::into_inner);
        *renderers.entry(view.to_string()).or_default() += 1;
    }

    pub fn renderers(&self) -> BTreeMap<String, u64> {
        self.renderers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn spawned(&self) -> u64 {
        self.spawned.load(Ordering::Relaxed)
    }

    /// Tasks spawned but still waiting for a worker.
    pub fn queued(&self) -> u64 {
        self.queued.load(Ordering::Relaxed)
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    pub fn panics(&self) -> u64 {
        self.panics.load(Ordering::Relaxed)
    }
}

#[derive(Clone, Debug)]
pub struct TaskPool {
    permits: Arc<Semaphore>,
    counters: Arc<ActivityCounters>,
}

impl TaskPool {
    pub fn new(workers: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(workers.max(1))),
            counters: Arc::new(ActivityCounters::default()),
        }
    }

    pub fn counters(&self) -> &Arc<ActivityCounters> {
        &self.counters
    }

    /// Workers not currently running a task.
    pub fn idle(&self) -> usize {
        self.permits.available_permits()
    }

    /// Run `task` once a worker frees up. The task is never dropped.
    pub fn spawn<F>(&self, name: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.counters.spawned.fetch_add(1, Ordering::Relaxed);
        self.counters.queued.fetch_add(1, Ordering::Relaxed);
        let permits = self.permits.clone();
        let counters = self.counters.clone();
        tokio::spawn(async move {
            let permit = permits.acquire_owned().await;
            counters.queued.fetch_sub(1, Ordering::Relaxed);
            match permit {
                Ok(permit) => supervise(name, task, permit, counters).await,
                Err(_) => error!(task = name, "background pool closed, task dropped"),
            }
        });
    }

    /// Run `task` on a free worker. Returns false, dropping the task, when
    /// every worker is busy.
    pub fn try_spawn<F>(&self, name: &'static str, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permit = match self.permits.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(task = name, "background pool exhausted, task dropped");
                return false;
            }
        };
        self.counters.spawned.fetch_add(1, Ordering::Relaxed);
        tokio::spawn(supervise(name, task, permit, self.counters.clone()));
        true
    }
}

async fn supervise<F>(
    name: &'static str,
    task: F,
    _permit: OwnedSemaphorePermit,
    counters: Arc<ActivityCounters>,
) where
    F: Future<Output = ()> + Send + 'static,
{
    match tokio::spawn(task).await {
        Ok(()) => {
            counters.completed.fetch_add(1, Ordering::Relaxed);
            debug!(task = name, "background task finished");
        }
        Err(e) if e.is_panic() => {
            counters.panics.fetch_add(1, Ordering::Relaxed);
            error!(task = name, "background task panicked");
        }
        Err(_) => debug!(task = name, "background task cancelled"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::oneshot;

    async fn settle(pool: &TaskPool, workers: usize) {
        for _ in 0..100 {
            if pool.idle() == workers {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("pool never went idle");
    }

    #[tokio::test]
    async fn runs_tasks_and_counts_them() {
        let pool = TaskPool::new(2);
        let (tx, rx) = oneshot::channel();
        assert!(pool.try_spawn("send", async move {
            let _ = tx.send(7);
        }));
        assert_eq!(rx.await.unwrap(), 7);
        settle(&pool, 2).await;
        assert_eq!(pool.counters().spawned(), 1);
        assert_eq!(pool.counters().completed(), 1);
    }

    #[tokio::test]
    async fn panics_are_contained() {
        let pool = TaskPool::new(1);
        assert!(pool.try_spawn("boom", async { panic!("boom") }));
        settle(&pool, 1).await;
        assert_eq!(pool.counters().panics(), 1);

        // the worker is usable again
        let (tx, rx) = oneshot::channel();
        assert!(pool.try_spawn("after", async move {
            let _ = tx.send(());
        }));
        rx.await.unwrap();
    }

    #[tokio::test]
    async fn full_pool_rejects() {
        let pool = TaskPool::new(1);
        let (release, wait) = oneshot::channel::<()>();
        assert!(pool.try_spawn("hold", async move {
            let _ = wait.await;
        }));
        assert!(!pool.try_spawn("extra", async {}));
        assert_eq!(pool.counters().rejected(), 1);
        release.send(()).unwrap();
        settle(&pool, 1).await;
    }

    #[tokio::test]
    async fn full_pool_queues_required_work() {
        let pool = TaskPool::new(2);
        let (release, wait) = tokio::sync::watch::channel(false);
        for _ in 0..2 {
            let mut wait = wait.clone();
            pool.spawn("hold", async move {
                let _ = wait.wait_for(|go| *go).await;
            });
        }
        let done = Arc::new(AtomicU64::new(0));
        for _ in 0..10 {
            let done = done.clone();
            pool.spawn("stop", async move {
                done.fetch_add(1, Ordering::SeqCst);
            });
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(done.load(Ordering::SeqCst), 0);
        assert_eq!(pool.counters().queued(), 10);

        release.send(true).unwrap();
        for _ in 0..100 {
            if done.load(Ordering::SeqCst) == 10 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(done.load(Ordering::SeqCst), 10);
        assert_eq!(pool.counters().rejected(), 0);
        settle(&pool, 2).await;
        assert_eq!(pool.counters().completed(), 12);
    }

    #[test]
    fn renderer_counts() {
        let counters = ActivityCounters::default();
        counters.record_renderer("term");
        counters.record_renderer("term");
        counters.record_renderer("preview");
        assert_eq!(counters.renderers().get("term"), Some(&2));
        assert_eq!(counters.renderers().len(), 2);
    }
}
