//! Per-group bounded worker pools.
//!
//! Each (pool group, [`TaskCategory`]) pair gets its own semaphore, created
//! on first use, so a busy group cannot starve the others and no group runs
//! more than the configured number of concurrent network operations per
//! category. Every spawned task is tracked by one [`TaskTracker`] so
//! shutdown can drain all of them.
//!
//! # Tiger Style
//!
//! - Bounded concurrency: pool sizes are capped by `MAX_WORKERS_PER_CATEGORY`
//! - Explicit cancellation via `CancellationToken` (per task, per operation, global)
//! - No lock is held while a task runs

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;
use tracing::info;

use crate::constants::DEFAULT_REQUEST_WORKERS;
use crate::constants::DEFAULT_SCAN_WORKERS;
use crate::constants::DEFAULT_VERIFY_WORKERS;
use crate::constants::MAX_WORKERS_PER_CATEGORY;
use crate::stats::ResilienceStats;

/// Kind of work, each with its own worker pool per group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskCategory {
    /// Pool scans.
    Scan,
    /// File verifications.
    Verify,
    /// Copy and remove requests.
    Request,
}

impl TaskCategory {
    /// Stable name used in statistics.
    pub fn name(self) -> &'static str {
        match self {
            TaskCategory::Scan => "scan",
            TaskCategory::Verify => "verify",
            TaskCategory::Request => "request",
        }
    }
}

/// Worker pool sizes per group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSizes {
    /// Concurrent scans.
    pub scan: u32,
    /// Concurrent verifications.
    pub verify: u32,
    /// Concurrent copy/remove requests.
    pub request: u32,
}

impl Default for WorkerSizes {
    fn default() -> Self {
        Self {
            scan: DEFAULT_SCAN_WORKERS,
            verify: DEFAULT_VERIFY_WORKERS,
            request: DEFAULT_REQUEST_WORKERS,
        }
    }
}

impl WorkerSizes {
    fn for_category(&self, category: TaskCategory) -> usize {
        let size = match category {
            TaskCategory::Scan => self.scan,
            TaskCategory::Verify => self.verify,
            TaskCategory::Request => self.request,
        };
        size.clamp(1, MAX_WORKERS_PER_CATEGORY) as usize
    }
}

/// Handle to one submitted task.
#[derive(Debug)]
pub struct TaskHandle {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl TaskHandle {
    /// Request cancellation; the task stops at its next await point.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token cancelled together with this task.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Whether the task has finished.
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the task to finish. Returns false if it was cancelled.
    pub async fn join(self) -> bool {
        let cancelled = self.cancel.clone();
        match self.join.await {
            Ok(()) => !cancelled.is_cancelled(),
            Err(_) => false,
        }
    }
}

#[derive(Debug)]
struct OperationTokens {
    generation: u64,
    token: CancellationToken,
    live: usize,
}

type OperationMap = Arc<Mutex<HashMap<String, OperationTokens>>>;

/// Routes work onto bounded per-group worker pools.
#[derive(Debug)]
pub struct TaskScheduler {
    sizes: WorkerSizes,
    pools: Mutex<HashMap<(String, TaskCategory), Arc<Semaphore>>>,
    operations: OperationMap,
    next_generation: Mutex<u64>,
    root: CancellationToken,
    tracker: TaskTracker,
    stats: Arc<ResilienceStats>,
}

impl TaskScheduler {
    /// Create a scheduler; pools are created lazily.
    pub fn new(sizes: WorkerSizes, stats: Arc<ResilienceStats>) -> Self {
        Self {
            sizes,
            pools: Mutex::new(HashMap::new()),
            operations: Arc::new(Mutex::new(HashMap::new())),
            next_generation: Mutex::new(0),
            root: CancellationToken::new(),
            tracker: TaskTracker::new(),
            stats,
        }
    }

    /// Run `task` on the pool of (`group`, `category`).
    ///
    /// The task waits for a free worker slot before it starts. When
    /// `operation_key` is set, [`cancel_operation`](Self::cancel_operation)
    /// on that key cancels the task.
    pub fn submit<F>(&self, group: &str, category: TaskCategory, operation_key: Option<&str>, task: F) -> TaskHandle
    where F: Future<Output = ()> + Send + 'static {
        let semaphore = self.pool(group, category);
        self.stats.record_submission(group, category);

        let (cancel, registration) = match operation_key {
            Some(key) => {
                let (parent, generation) = self.operation_token(key);
                (parent.child_token(), Some((key.to_string(), generation)))
            }
            None => (self.root.child_token(), None),
        };

        let token = cancel.clone();
        let operations = Arc::clone(&self.operations);
        let join = self.tracker.spawn(async move {
            let permit = tokio::select! {
                biased;
                _ = token.cancelled() => None,
                permit = semaphore.acquire_owned() => permit.ok(),
            };
            if let Some(_permit) = permit {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => {}
                    _ = task => {}
                }
            }
            if let Some((key, generation)) = registration {
                release_operation(&operations, &key, generation);
            }
        });

        TaskHandle { cancel, join }
    }

    /// Run `task` outside the worker pools (timers, background loops).
    ///
    /// The task is still tracked and stopped by [`shutdown`](Self::shutdown).
    pub fn spawn<F>(&self, task: F) -> TaskHandle
    where F: Future<Output = ()> + Send + 'static {
        let cancel = self.root.child_token();
        let token = cancel.clone();
        let join = self.tracker.spawn(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => {}
                _ = task => {}
            }
        });
        TaskHandle { cancel, join }
    }

    /// Cancel every task submitted for `key`. Returns true if any was live.
    pub fn cancel_operation(&self, key: &str) -> bool {
        match self.operations.lock().remove(key) {
            Some(entry) => {
                entry.token.cancel();
                debug!(key, live = entry.live, "operation tasks cancelled");
                true
            }
            None => false,
        }
    }

    /// Number of spawned tasks that have not finished.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Free worker slots of one pool, or the full size if it was never used.
    pub fn available_workers(&self, group: &str, category: TaskCategory) -> usize {
        self.pools
            .lock()
            .get(&(group.to_string(), category))
            .map(|s| s.available_permits())
            .unwrap_or_else(|| self.sizes.for_category(category))
    }

    /// Cancel every task and wait for all of them to stop.
    pub async fn shutdown(&self) {
        info!(in_flight = self.tracker.len(), "stopping worker pools");
        self.root.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        for semaphore in self.pools.lock().values() {
            semaphore.close();
        }
        info!("worker pools stopped");
    }

    fn pool(&self, group: &str, category: TaskCategory) -> Arc<Semaphore> {
        let mut pools = self.pools.lock();
        let semaphore = pools
            .entry((group.to_string(), category))
            .or_insert_with(|| Arc::new(Semaphore::new(self.sizes.for_category(category))));
        Arc::clone(semaphore)
    }

    fn operation_token(&self, key: &str) -> (CancellationToken, u64) {
        let mut operations = self.operations.lock();
        if let Some(entry) = operations.get_mut(key) {
            entry.live += 1;
            return (entry.token.clone(), entry.generation);
        }
        let generation = {
            let mut next = self.next_generation.lock();
            *next += 1;
            *next
        };
        let token = self.root.child_token();
        operations.insert(key.to_string(), OperationTokens {
            generation,
            token: token.clone(),
            live: 1,
        });
        (token, generation)
    }
}

fn release_operation(operations: &OperationMap, key: &str, generation: u64) {
    let mut operations = operations.lock();
    if let Some(entry) = operations.get_mut(key) {
        if entry.generation != generation {
            return;
        }
        entry.live = entry.live.saturating_sub(1);
        if entry.live == 0 {
            operations.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use tokio::sync::oneshot;

    use super::*;
    use crate::stats::StatsSnapshot;

    fn scheduler(request: u32) -> TaskScheduler {
        let sizes = WorkerSizes {
            scan: 1,
            verify: 2,
            request,
        };
        TaskScheduler::new(sizes, Arc::default())
    }

    #[tokio::test]
    async fn test_pool_bounds_concurrency() {
        let scheduler = scheduler(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                scheduler.submit("g", TaskCategory::Request, None, async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for handle in handles {
            assert!(handle.join().await);
        }
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_groups_do_not_share_pools() {
        let scheduler = scheduler(1);
        let (tx, rx) = oneshot::channel::<()>();
        // Occupy the only request worker of group a.
        let blocked = scheduler.submit("a", TaskCategory::Request, None, async move {
            let _ = rx.await;
        });
        let other = scheduler.submit("b", TaskCategory::Request, None, async {});
        assert!(other.join().await);
        assert_eq!(scheduler.available_workers("a", TaskCategory::Request), 0);
        tx.send(()).unwrap();
        assert!(blocked.join().await);
    }

    #[tokio::test]
    async fn test_cancel_operation() {
        let scheduler = scheduler(4);
        let handle = scheduler.submit("g", TaskCategory::Request, Some("g.f1"), std::future::pending::<()>());
        assert!(scheduler.cancel_operation("g.f1"));
        assert!(!handle.join().await);
        assert!(!scheduler.cancel_operation("g.f1"));
    }

    #[tokio::test]
    async fn test_finished_operation_token_released() {
        let scheduler = scheduler(4);
        let handle = scheduler.submit("g", TaskCategory::Verify, Some("g.f1"), async {});
        assert!(handle.join().await);
        assert!(!scheduler.cancel_operation("g.f1"));
    }

    #[tokio::test]
    async fn test_shutdown_drains() {
        let stats = Arc::new(ResilienceStats::default());
        let scheduler = TaskScheduler::new(WorkerSizes::default(), Arc::clone(&stats));
        let handle = scheduler.submit("g", TaskCategory::Scan, None, std::future::pending::<()>());
        scheduler.shutdown().await;
        assert!(handle.is_finished());
        assert_eq!(scheduler.in_flight(), 0);

        let snapshot: StatsSnapshot = stats.snapshot(0);
        assert_eq!(snapshot.submitted("g", TaskCategory::Scan), 1);
    }
}
