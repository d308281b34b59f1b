/// Worker Pool Manager
///
/// Runs every engine operation off the caller's thread:
/// - Storage pool for store I/O, queries and the mutation pipeline
/// - Event pool for firing events, so a slow subscriber cannot starve storage
/// - Lock-free per-pool counters
/// - Task results delivered through futures (`TaskHandle`)

use std::collections::HashMap;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use rayon::{ThreadPool, ThreadPoolBuilder};
use tokio::sync::oneshot;

use crate::config::EngineConfig;
use crate::error::{panic_message, EngineError, EngineResult};

/// Thread pool categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolCategory {
    /// Store I/O, index population and pipeline steps
    Storage,
    /// Event delivery
    Events,
}

/// Configuration for the worker pools
#[derive(Debug, Clone)]
pub struct ThreadPoolConfig {
    pub storage_threads: usize,
    pub event_threads: usize,
    /// Enable thread naming
    pub enable_thread_names: bool,
    /// Stack size for worker threads (in bytes)
    pub stack_size: Option<usize>,
}

impl Default for ThreadPoolConfig {
    fn default() -> Self {
        Self {
            storage_threads: num_cpus::get().max(4),
            event_threads: 1,
            enable_thread_names: true,
            stack_size: Some(2 * 1024 * 1024), // 2MB stack per thread
        }
    }
}

impl From<&EngineConfig> for ThreadPoolConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            storage_threads: config.storage_threads,
            event_threads: config.event_threads,
            ..Default::default()
        }
    }
}

/// Lock-free statistics counters for each pool
#[derive(Debug, Default)]
pub struct PoolCounters {
    pub tasks_submitted: AtomicU64,
    pub tasks_completed: AtomicU64,
    pub tasks_panicked: AtomicU64,
    pub total_execution_time_ns: AtomicU64,
    pub active_tasks: AtomicUsize,
}

/// Snapshot of one pool's counters
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PoolMetrics {
    pub active_tasks: usize,
    pub tasks_submitted: u64,
    pub tasks_completed: u64,
    pub tasks_panicked: u64,
    pub average_execution_time_ms: f64,
}

/// Owns the engine's worker pools
pub struct ThreadPoolManager {
    storage_pool: Arc<ThreadPool>,
    event_pool: Arc<ThreadPool>,
    /// Drives timers and other waits without parking a worker
    watcher: futures::executor::ThreadPool,
    pool_counters: HashMap<PoolCategory, Arc<PoolCounters>>,
}

impl ThreadPoolManager {
    pub fn new(config: ThreadPoolConfig) -> EngineResult<Self> {
        let storage_pool = Self::build_pool(&config, PoolCategory::Storage, config.storage_threads)?;
        let event_pool = Self::build_pool(&config, PoolCategory::Events, config.event_threads)?;
        let watcher = futures::executor::ThreadPool::builder()
            .pool_size(1)
            .name_prefix("structure-watch-")
            .create()?;

        let mut pool_counters = HashMap::new();
        for &category in &[PoolCategory::Storage, PoolCategory::Events] {
            pool_counters.insert(category, Arc::new(PoolCounters::default()));
        }

        log::debug!(
            "Worker pools started: {} storage threads, {} event threads",
            config.storage_threads,
            config.event_threads
        );

        Ok(Self {
            storage_pool,
            event_pool,
            watcher,
            pool_counters,
        })
    }

    fn build_pool(
        config: &ThreadPoolConfig,
        category: PoolCategory,
        threads: usize,
    ) -> EngineResult<Arc<ThreadPool>> {
        let mut builder = ThreadPoolBuilder::new().num_threads(threads.max(1));

        if config.enable_thread_names {
            let category_name = format!("{:?}", category).to_lowercase();
            builder = builder.thread_name(move |idx| format!("structure-{}-{}", category_name, idx));
        }

        if let Some(stack_size) = config.stack_size {
            builder = builder.stack_size(stack_size);
        }

        builder.build().map(Arc::new).map_err(|e| EngineError::Config {
            message: format!("Failed to create {:?} pool: {}", category, e),
        })
    }

    fn pool(&self, category: PoolCategory) -> &Arc<ThreadPool> {
        match category {
            PoolCategory::Storage => &self.storage_pool,
            PoolCategory::Events => &self.event_pool,
        }
    }

    fn submit(&self, category: PoolCategory) -> Option<Arc<PoolCounters>> {
        let counters = self.pool_counters.get(&category).cloned();
        mark_submitted(counters.as_deref());
        counters
    }

    /// Run `task` on a pool and hand back a future for its result.
    ///
    /// A panic inside `task` resolves the handle to `TaskAborted` instead of
    /// unwinding through the worker.
    pub fn spawn<F, R>(&self, category: PoolCategory, name: &str, task: F) -> TaskHandle<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let counters = self.submit(category);

        let task_name = name.to_string();
        self.pool(category).spawn(move || {
            let result = run_counted(counters.as_deref(), &task_name, task);
            // The caller may have dropped its handle
            let _ = tx.send(result);
        });

        TaskHandle {
            name: name.to_string(),
            rx,
        }
    }

    /// Run `task` on `first`, then hand its output to `continuation` on `then`.
    ///
    /// No worker waits for the other stage: `continuation` is queued only once
    /// `task` has finished. A panic in either stage resolves to `TaskAborted`.
    pub fn spawn_then<F, A, G, R>(
        &self,
        first: PoolCategory,
        then: PoolCategory,
        name: &str,
        task: F,
        continuation: G,
    ) -> TaskHandle<R>
    where
        F: FnOnce() -> A + Send + 'static,
        A: Send + 'static,
        G: FnOnce(A) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let first_counters = self.submit(first);
        let then_counters = self.pool_counters.get(&then).cloned();
        let then_pool = Arc::clone(self.pool(then));

        let task_name = name.to_string();
        self.pool(first).spawn(move || {
            match run_counted(first_counters.as_deref(), &task_name, task) {
                Ok(value) => {
                    mark_submitted(then_counters.as_deref());
                    then_pool.spawn(move || {
                        let result = run_counted(then_counters.as_deref(), &task_name, move || {
                            continuation(value)
                        });
                        let _ = tx.send(result);
                    });
                }
                Err(message) => {
                    let _ = tx.send(Err(message));
                }
            }
        });

        TaskHandle {
            name: name.to_string(),
            rx,
        }
    }

    /// Drive a future to completion on the watcher thread.
    ///
    /// For waits (timeouts, delivery reports); the future must not block.
    pub fn watch<Fut>(&self, future: Fut)
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.watcher.spawn_ok(future);
    }

    /// Get real-time pool metrics
    pub fn metrics(&self, category: PoolCategory) -> PoolMetrics {
        self.pool_counters
            .get(&category)
            .map(|counters| {
                let completed = counters.tasks_completed.load(Ordering::Relaxed);
                let total_ns = counters.total_execution_time_ns.load(Ordering::Relaxed);
                PoolMetrics {
                    active_tasks: counters.active_tasks.load(Ordering::Relaxed),
                    tasks_submitted: counters.tasks_submitted.load(Ordering::Relaxed),
                    tasks_completed: completed,
                    tasks_panicked: counters.tasks_panicked.load(Ordering::Relaxed),
                    average_execution_time_ms: if completed > 0 {
                        (total_ns as f64) / (completed as f64) / 1_000_000.0
                    } else {
                        0.0
                    },
                }
            })
            .unwrap_or_default()
    }
}

fn mark_submitted(counters: Option<&PoolCounters>) {
    if let Some(counters) = counters {
        counters.tasks_submitted.fetch_add(1, Ordering::Relaxed);
        counters.active_tasks.fetch_add(1, Ordering::Relaxed);
    }
}

/// Run one task body, catching panics and updating its pool's counters
fn run_counted<F, R>(counters: Option<&PoolCounters>, name: &str, task: F) -> Result<R, String>
where
    F: FnOnce() -> R,
{
    let start = std::time::Instant::now();
    let result = catch_unwind(AssertUnwindSafe(task)).map_err(|payload| {
        let message = panic_message(payload.as_ref());
        log::error!("Task {} panicked: {}", name, message);
        message
    });

    if let Some(counters) = counters {
        let elapsed_ns = start.elapsed().as_nanos() as u64;
        if result.is_err() {
            counters.tasks_panicked.fetch_add(1, Ordering::Relaxed);
        }
        counters.tasks_completed.fetch_add(1, Ordering::Relaxed);
        counters
            .total_execution_time_ns
            .fetch_add(elapsed_ns, Ordering::Relaxed);
        counters.active_tasks.fetch_sub(1, Ordering::Relaxed);
    }
    result
}

/// Result of work running on a worker pool
pub struct TaskHandle<T> {
    name: String,
    rx: oneshot::Receiver<Result<T, String>>,
}

impl<T> TaskHandle<T> {
    /// A handle that is already resolved
    pub fn ready(name: &str, value: T) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Ok(value));
        Self {
            name: name.to_string(),
            rx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Block the current thread until the task finishes
    pub fn wait(self) -> EngineResult<T> {
        futures::executor::block_on(self)
    }
}

impl<T> Future for TaskHandle<T> {
    type Output = EngineResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(Ok(value))) => Poll::Ready(Ok(value)),
            Poll::Ready(Ok(Err(message))) => Poll::Ready(Err(EngineError::TaskAborted {
                task: format!("{} ({})", self.name, message),
            })),
            Poll::Ready(Err(_)) => Poll::Ready(Err(EngineError::TaskAborted {
                task: self.name.clone(),
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_manager() -> ThreadPoolManager {
        ThreadPoolManager::new(ThreadPoolConfig {
            storage_threads: 2,
            event_threads: 1,
            ..Default::default()
        })
        .expect("Failed to create ThreadPoolManager for test")
    }

    #[test]
    fn test_task_execution() {
        let manager = small_manager();
        let result = manager
            .spawn(PoolCategory::Storage, "add", || 1 + 1)
            .wait()
            .expect("task should complete");
        assert_eq!(result, 2);

        let metrics = manager.metrics(PoolCategory::Storage);
        assert_eq!(metrics.tasks_submitted, 1);
        assert_eq!(metrics.tasks_completed, 1);
        assert_eq!(metrics.active_tasks, 0);
    }

    #[test]
    fn test_tasks_run_off_caller_thread() {
        let manager = small_manager();
        let caller = std::thread::current().id();
        let (worker, name) = manager
            .spawn(PoolCategory::Events, "whoami", || {
                let current = std::thread::current();
                (current.id(), current.name().map(str::to_string))
            })
            .wait()
            .expect("task should complete");
        assert_ne!(worker, caller);
        assert_eq!(name.as_deref(), Some("structure-events-0"));
    }

    #[test]
    fn test_panicking_task_resolves_to_aborted() {
        let manager = small_manager();
        let handle = manager.spawn(PoolCategory::Storage, "explode", || -> u32 {
            panic!("boom");
        });
        match handle.wait() {
            Err(EngineError::TaskAborted { task }) => assert!(task.contains("boom")),
            other => panic!("expected TaskAborted, got {:?}", other.map(|_| ())),
        }
        assert_eq!(manager.metrics(PoolCategory::Storage).tasks_panicked, 1);

        // Pool keeps working afterwards
        assert_eq!(manager.spawn(PoolCategory::Storage, "after", || 7).wait().ok(), Some(7));
    }

    #[test]
    fn test_spawn_then_runs_each_stage_on_its_pool() {
        let manager = small_manager();
        let (first, second) = manager
            .spawn_then(
                PoolCategory::Events,
                PoolCategory::Storage,
                "staged",
                || std::thread::current().name().map(str::to_string),
                |first| (first, std::thread::current().name().map(str::to_string)),
            )
            .wait()
            .expect("task should complete");
        assert_eq!(first.as_deref(), Some("structure-events-0"));
        assert!(second.map_or(false, |name| name.starts_with("structure-storage-")));

        assert_eq!(manager.metrics(PoolCategory::Events).tasks_completed, 1);
        assert_eq!(manager.metrics(PoolCategory::Storage).tasks_completed, 1);
    }

    #[test]
    fn test_spawn_then_skips_continuation_after_panic() {
        let manager = small_manager();
        let ran = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&ran);
        let handle = manager.spawn_then(
            PoolCategory::Events,
            PoolCategory::Storage,
            "broken-stage",
            || -> u32 { panic!("first stage") },
            move |value| {
                seen.fetch_add(1, Ordering::SeqCst);
                value
            },
        );
        assert!(matches!(handle.wait(), Err(EngineError::TaskAborted { .. })));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(manager.metrics(PoolCategory::Storage).tasks_submitted, 0);
    }

    #[test]
    fn test_watched_future_completes() {
        let manager = small_manager();
        let (tx, rx) = oneshot::channel();
        let inner = manager.spawn(PoolCategory::Events, "value", || 5);
        manager.watch(async move {
            let _ = tx.send(inner.await.ok());
        });
        assert_eq!(futures::executor::block_on(rx).ok().flatten(), Some(5));
    }

    #[test]
    fn test_ready_handle() {
        let handle = TaskHandle::ready("noop", "done");
        assert_eq!(handle.name(), "noop");
        assert_eq!(handle.wait().ok(), Some("done"));
    }
}
