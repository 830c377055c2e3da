//! Bounded execution pool for blocking storage work
//!
//! Network-facing tasks must never perform file I/O on their own thread. The
//! storage layer hands every blocking operation to an [`ExecutionPool`] and
//! awaits the result through a oneshot channel instead.
//!
//! # Sizing
//!
//! - `core_threads` workers are started with the pool and live until shutdown
//! - when more jobs are queued than there are idle workers, burst workers are
//!   started up to `max_threads`
//! - a burst worker that stays idle for `keep_alive` retires
//!
//! The work queue itself is unbounded.
//!
//! # Failures
//!
//! Every job runs under `catch_unwind`. A panicking job is logged, counted and
//! handed to the optional [`TaskFailureObserver`]; the worker thread keeps
//! running. [`ExecutionPool::run`] additionally returns the failure to the
//! caller as [`Error::TaskPanicked`].
//!
//! # Example
//!
//! ```rust,ignore
//! use fastmq_core::{ExecutionPool, PoolConfig};
//!
//! let pool = ExecutionPool::new(PoolConfig::default())?;
//! let len = pool.run(|| std::fs::read("segment.log").map(|b| b.len())).await??;
//! ```

use crate::config::PoolConfig;
use crate::metrics::StorageMetrics;
use crate::{Error, Result};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::any::Any;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A job that panicked inside the pool
#[derive(Debug, Clone)]
pub struct TaskFailure {
    /// Pool name
    pub pool: String,
    /// Worker thread the job ran on
    pub worker: String,
    /// Panic message
    pub message: String,
}

/// Receives every job failure caught by the pool
pub trait TaskFailureObserver: Send + Sync {
    fn on_failure(&self, failure: &TaskFailure);
}

impl<F> TaskFailureObserver for F
where
    F: Fn(&TaskFailure) + Send + Sync,
{
    fn on_failure(&self, failure: &TaskFailure) {
        self(failure)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerKind {
    Core,
    Burst,
}

/// Handle to a shared worker pool. Clones share the same workers.
///
/// The pool shuts down once the last handle is dropped; queued jobs are still
/// drained by the remaining workers.
#[derive(Clone)]
pub struct ExecutionPool {
    inner: Arc<PoolInner>,
    _guard: Arc<ShutdownGuard>,
}

struct PoolInner {
    config: PoolConfig,
    sender: Mutex<Option<Sender<Job>>>,
    receiver: Receiver<Job>,
    live: AtomicUsize,
    idle: AtomicUsize,
    next_worker_id: AtomicUsize,
    observer: Option<Arc<dyn TaskFailureObserver>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    stats: PoolStats,
}

struct ShutdownGuard {
    inner: Arc<PoolInner>,
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        self.inner.sender.lock().take();
    }
}

impl ExecutionPool {
    /// Create a pool and start its core workers
    pub fn new(config: PoolConfig) -> Result<Self> {
        Self::build(config, None)
    }

    /// Create a pool that reports every job failure to `observer`
    pub fn with_failure_observer(
        config: PoolConfig,
        observer: Arc<dyn TaskFailureObserver>,
    ) -> Result<Self> {
        Self::build(config, Some(observer))
    }

    fn build(config: PoolConfig, observer: Option<Arc<dyn TaskFailureObserver>>) -> Result<Self> {
        config.validate()?;
        let (sender, receiver) = unbounded();
        let inner = Arc::new(PoolInner {
            config,
            sender: Mutex::new(Some(sender)),
            receiver,
            live: AtomicUsize::new(0),
            idle: AtomicUsize::new(0),
            next_worker_id: AtomicUsize::new(0),
            observer,
            handles: Mutex::new(Vec::new()),
            stats: PoolStats::default(),
        });

        for _ in 0..inner.config.core_threads {
            inner.live.fetch_add(1, Ordering::AcqRel);
            PoolInner::spawn_worker(&inner, WorkerKind::Core)?;
        }

        debug!(
            "Started pool {} with {} core threads (max {})",
            inner.config.name, inner.config.core_threads, inner.config.max_threads
        );

        Ok(Self {
            _guard: Arc::new(ShutdownGuard {
                inner: Arc::clone(&inner),
            }),
            inner,
        })
    }

    /// Pool name
    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    /// Submit a job without waiting for it. A panic inside the job is only
    /// visible through logs, stats and the failure observer.
    pub fn execute<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(Box::new(job))
    }

    /// Run `job` on the pool and await its result.
    ///
    /// Returns [`Error::TaskPanicked`] if the job panicked and
    /// [`Error::PoolShutdown`] if the pool no longer accepts work.
    pub async fn run<F, T>(&self, job: F) -> Result<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel::<std::result::Result<T, String>>();
        self.submit(Box::new(move || {
            match catch_unwind(AssertUnwindSafe(job)) {
                Ok(value) => {
                    let _ = tx.send(Ok(value));
                }
                Err(payload) => {
                    let _ = tx.send(Err(panic_message(payload.as_ref())));
                    // Re-raise so the worker loop records the failure
                    resume_unwind(payload);
                }
            }
        }))?;

        match rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(message)) => Err(Error::TaskPanicked(message)),
            Err(_) => Err(Error::PoolShutdown),
        }
    }

    fn submit(&self, job: Job) -> Result<()> {
        let sender = self
            .inner
            .sender
            .lock()
            .as_ref()
            .cloned()
            .ok_or(Error::PoolShutdown)?;

        sender.send(job).map_err(|_| Error::PoolShutdown)?;
        self.inner.stats.submitted.fetch_add(1, Ordering::Relaxed);
        PoolInner::maybe_spawn_burst(&self.inner);
        Ok(())
    }

    /// Stop accepting work, let workers drain the queue and join them.
    ///
    /// Blocks the calling thread; must not be called from a pool job.
    pub fn shutdown(&self) {
        self.inner.sender.lock().take();
        let handles: Vec<_> = self.inner.handles.lock().drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                warn!("Worker of pool {} exited abnormally", self.inner.config.name);
            }
        }
        debug!("Pool {} shut down", self.inner.config.name);
    }

    /// Whether the pool still accepts work
    pub fn is_shutdown(&self) -> bool {
        self.inner.sender.lock().is_none()
    }

    /// Get pool statistics
    ///
    /// `completed` and `failed` are counted once the job has returned, which
    /// can be after a [`run`](Self::run) caller already received the result.
    pub fn stats(&self) -> PoolStatsSnapshot {
        PoolStatsSnapshot {
            live_threads: self.inner.live.load(Ordering::Acquire),
            idle_threads: self.inner.idle.load(Ordering::Acquire),
            queued: self.inner.receiver.len(),
            submitted: self.inner.stats.submitted.load(Ordering::Relaxed),
            completed: self.inner.stats.completed.load(Ordering::Relaxed),
            failed: self.inner.stats.failed.load(Ordering::Relaxed),
            burst_started: self.inner.stats.burst_started.load(Ordering::Relaxed),
            burst_retired: self.inner.stats.burst_retired.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for ExecutionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionPool")
            .field("name", &self.inner.config.name)
            .field("stats", &self.stats())
            .finish()
    }
}

impl PoolInner {
    /// Start a worker. The caller must already have counted it in `live`.
    fn spawn_worker(inner: &Arc<PoolInner>, kind: WorkerKind) -> Result<()> {
        let id = inner.next_worker_id.fetch_add(1, Ordering::Relaxed);
        let name = format!("{}-{}", inner.config.name, id);
        let worker_inner = Arc::clone(inner);
        let worker_name = name.clone();

        let spawned = std::thread::Builder::new()
            .name(name)
            .spawn(move || worker_loop(worker_inner, kind, worker_name));

        match spawned {
            Ok(handle) => {
                let mut handles = inner.handles.lock();
                handles.retain(|h| !h.is_finished());
                handles.push(handle);
                StorageMetrics::set_pool_threads(&inner.config.name, inner.live.load(Ordering::Acquire));
                Ok(())
            }
            Err(e) => {
                inner.live.fetch_sub(1, Ordering::AcqRel);
                Err(Error::IoError(e))
            }
        }
    }

    /// Start a burst worker when queued jobs outnumber idle workers
    fn maybe_spawn_burst(inner: &Arc<PoolInner>) {
        if inner.sender.lock().is_none() {
            return;
        }
        loop {
            let live = inner.live.load(Ordering::Acquire);
            if live >= inner.config.max_threads {
                return;
            }
            if inner.receiver.len() <= inner.idle.load(Ordering::Acquire) {
                return;
            }
            if inner
                .live
                .compare_exchange(live, live + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                inner.stats.burst_started.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = PoolInner::spawn_worker(inner, WorkerKind::Burst) {
                    warn!("Failed to start burst worker for {}: {}", inner.config.name, e);
                }
                return;
            }
        }
    }

    fn run_job(&self, job: Job, worker: &str) {
        match catch_unwind(AssertUnwindSafe(job)) {
            Ok(()) => {
                self.stats.completed.fetch_add(1, Ordering::Relaxed);
            }
            Err(payload) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                let failure = TaskFailure {
                    pool: self.config.name.clone(),
                    worker: worker.to_string(),
                    message: panic_message(payload.as_ref()),
                };
                error!(
                    "Task failed on {} ({}): {}",
                    failure.worker, failure.pool, failure.message
                );
                StorageMetrics::increment_pool_task_failures(&self.config.name);
                if let Some(observer) = &self.observer {
                    observer.on_failure(&failure);
                }
            }
        }
    }
}

fn worker_loop(inner: Arc<PoolInner>, kind: WorkerKind, name: String) {
    loop {
        inner.idle.fetch_add(1, Ordering::AcqRel);
        let next = match kind {
            WorkerKind::Core => inner.receiver.recv().ok(),
            WorkerKind::Burst => match inner.receiver.recv_timeout(inner.config.keep_alive) {
                Ok(job) => Some(job),
                Err(RecvTimeoutError::Timeout) => {
                    inner.stats.burst_retired.fetch_add(1, Ordering::Relaxed);
                    debug!("Burst worker {} retired after idle timeout", name);
                    None
                }
                Err(RecvTimeoutError::Disconnected) => None,
            },
        };
        inner.idle.fetch_sub(1, Ordering::AcqRel);

        match next {
            Some(job) => {
                // This worker counted as idle until now; recheck the backlog
                PoolInner::maybe_spawn_burst(&inner);
                inner.run_job(job, &name);
            }
            None => break,
        }
    }

    let live = inner.live.fetch_sub(1, Ordering::AcqRel) - 1;
    StorageMetrics::set_pool_threads(&inner.config.name, live);
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[derive(Default)]
struct PoolStats {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    burst_started: AtomicU64,
    burst_retired: AtomicU64,
}

/// Snapshot of pool statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStatsSnapshot {
    /// Worker threads currently alive
    pub live_threads: usize,
    /// Workers waiting for a job
    pub idle_threads: usize,
    /// Jobs waiting in the queue
    pub queued: usize,
    /// Jobs accepted
    pub submitted: u64,
    /// Jobs that returned normally
    pub completed: u64,
    /// Jobs that panicked
    pub failed: u64,
    /// Burst workers started
    pub burst_started: u64,
    /// Burst workers retired after idling
    pub burst_retired: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::time::{Duration, Instant};

    fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    #[tokio::test]
    async fn test_run_returns_result() {
        let pool = ExecutionPool::new(PoolConfig::single_threaded()).unwrap();
        let value = pool.run(|| 21 * 2).await.unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn test_panic_is_typed_and_worker_survives() {
        let pool = ExecutionPool::new(PoolConfig::single_threaded()).unwrap();

        let err = pool
            .run(|| -> u32 { panic!("disk on fire") })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TaskPanicked(ref msg) if msg == "disk on fire"));

        // The only worker is still alive
        assert_eq!(pool.run(|| 7).await.unwrap(), 7);
        // Counters move after the caller already has its result
        assert!(wait_until(Duration::from_secs(2), || {
            let stats = pool.stats();
            stats.completed == 1 && stats.failed == 1
        }));
        assert_eq!(pool.stats().live_threads, 1);
    }

    #[tokio::test]
    async fn test_failure_observer_sees_execute_panics() {
        let failures = Arc::new(Mutex::new(Vec::<TaskFailure>::new()));
        let sink = Arc::clone(&failures);
        let observer: Arc<dyn TaskFailureObserver> =
            Arc::new(move |failure: &TaskFailure| sink.lock().push(failure.clone()));

        let pool = ExecutionPool::with_failure_observer(
            PoolConfig::single_threaded().with_name("observed"),
            observer,
        )
        .unwrap();

        pool.execute(|| panic!("boom")).unwrap();
        // Single worker: this runs after the panicking job
        pool.run(|| ()).await.unwrap();

        let failures = failures.lock();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].pool, "observed");
        assert_eq!(failures[0].message, "boom");
        assert!(failures[0].worker.starts_with("observed-"));
    }

    #[tokio::test]
    async fn test_single_threaded_pool_preserves_order() {
        let pool = ExecutionPool::new(PoolConfig::single_threaded()).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for i in 0..50 {
            let seen = Arc::clone(&seen);
            pool.execute(move || seen.lock().push(i)).unwrap();
        }
        pool.run(|| ()).await.unwrap();

        assert_eq!(*seen.lock(), (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn test_burst_workers_start_and_retire() {
        let config = PoolConfig::single_threaded()
            .with_max_threads(3)
            .with_keep_alive(Duration::from_millis(50));
        let pool = ExecutionPool::new(config).unwrap();

        let started = Arc::new(AtomicUsize::new(0));
        let release = Arc::new(AtomicBool::new(false));
        for _ in 0..3 {
            let started = Arc::clone(&started);
            let release = Arc::clone(&release);
            pool.execute(move || {
                started.fetch_add(1, Ordering::SeqCst);
                while !release.load(Ordering::SeqCst) {
                    std::thread::sleep(Duration::from_millis(1));
                }
            })
            .unwrap();
        }

        // All three blocking jobs run concurrently
        assert!(wait_until(Duration::from_secs(5), || {
            started.load(Ordering::SeqCst) == 3
        }));
        assert_eq!(pool.stats().live_threads, 3);

        release.store(true, Ordering::SeqCst);

        // Burst workers retire, the core worker stays
        assert!(wait_until(Duration::from_secs(5), || {
            pool.stats().live_threads == 1
        }));
        assert_eq!(pool.stats().burst_retired, 2);
    }

    #[test]
    fn test_never_exceeds_max_threads() {
        let config = PoolConfig::single_threaded().with_max_threads(2);
        let pool = ExecutionPool::new(config).unwrap();
        let release = Arc::new(AtomicBool::new(false));

        for _ in 0..10 {
            let release = Arc::clone(&release);
            pool.execute(move || {
                while !release.load(Ordering::SeqCst) {
                    std::thread::sleep(Duration::from_millis(1));
                }
            })
            .unwrap();
        }

        assert!(pool.stats().live_threads <= 2);
        release.store(true, Ordering::SeqCst);
        assert!(wait_until(Duration::from_secs(5), || {
            pool.stats().completed == 10
        }));
    }

    #[tokio::test]
    async fn test_shutdown_drains_and_rejects() {
        let pool = ExecutionPool::new(PoolConfig::single_threaded()).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..20 {
            let counter = Arc::clone(&counter);
            pool.execute(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        pool.shutdown();

        assert_eq!(counter.load(Ordering::SeqCst), 20);
        assert!(pool.is_shutdown());
        assert!(matches!(pool.execute(|| ()), Err(Error::PoolShutdown)));
        assert!(matches!(pool.run(|| 1).await, Err(Error::PoolShutdown)));
        assert_eq!(pool.stats().live_threads, 0);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = PoolConfig::default().with_core_threads(0);
        assert!(matches!(
            ExecutionPool::new(config),
            Err(Error::InvalidConfig(_))
        ));
    }
}
