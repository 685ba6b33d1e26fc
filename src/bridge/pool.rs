use std::panic;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, trace};

use super::affinity::AffinityThread;
use super::context;
use crate::core::{ModelError, Result};

lazy_static::lazy_static! {
    static ref DEFAULT_POOL: Arc<WorkerPool> = Arc::new(WorkerPool::new(num_cpus::get().max(1)));
}

/// Bounded pool of blocking workers
///
/// Every call takes a permit, runs on the runtime's blocking thread pool and
/// releases the permit when the call returns, even if the awaiting future was
/// dropped in the meantime.
#[derive(Debug)]
pub struct WorkerPool {
    /// Maximum concurrent calls
    max_workers: usize,
    /// Semaphore for limiting concurrency
    semaphore: Arc<Semaphore>,
    /// How long to wait for a permit, `None` waits forever
    acquire_timeout: Option<Duration>,
    in_flight: Arc<AtomicUsize>,
    completed: Arc<AtomicU64>,
}

impl WorkerPool {
    pub fn new(max_workers: usize) -> Self {
        let max_workers = max_workers.max(1);
        Self {
            max_workers,
            semaphore: Arc::new(Semaphore::new(max_workers)),
            acquire_timeout: None,
            in_flight: Arc::new(AtomicUsize::new(0)),
            completed: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Process-wide pool used when no explicit executor is configured.
    pub fn global() -> Arc<WorkerPool> {
        Arc::clone(&DEFAULT_POOL)
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = Some(timeout);
        self
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Stop accepting calls. Calls already running finish normally.
    pub fn shutdown(&self) {
        debug!(max_workers = self.max_workers, "worker pool shut down");
        self.semaphore.close();
    }

    pub fn is_shutdown(&self) -> bool {
        self.semaphore.is_closed()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            max_workers: self.max_workers,
            available: self.semaphore.available_permits(),
            in_flight: self.in_flight.load(Ordering::SeqCst),
            completed: self.completed.load(Ordering::SeqCst),
        }
    }

    /// Run a blocking function on a pool worker and await its result.
    ///
    /// A panic inside `func` resumes on the awaiting task.
    pub async fn run<F, R>(&self, func: F) -> Result<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let handle = tokio::runtime::Handle::try_current().map_err(|_| {
            ModelError::Scheduling("no async runtime is running on this thread".into())
        })?;

        let permit = self.acquire().await?;
        let in_flight = Arc::clone(&self.in_flight);
        let completed = Arc::clone(&self.completed);
        in_flight.fetch_add(1, Ordering::SeqCst);
        trace!(in_flight = in_flight.load(Ordering::SeqCst), "dispatching blocking call");

        let join = handle.spawn_blocking(move || {
            let _permit = permit;
            let _done = Finished {
                in_flight,
                completed,
            };
            context::as_worker(func)
        });

        match join.await {
            Ok(result) => Ok(result),
            Err(err) if err.is_panic() => panic::resume_unwind(err.into_panic()),
            Err(err) => Err(ModelError::Scheduling(format!(
                "blocking call was cancelled: {}",
                err
            ))),
        }
    }

    /// Run `func` on a dedicated thread while holding one of this pool's
    /// permits.
    ///
    /// The permit travels with the job and is released when it returns, so
    /// affinity threads count against the same bound as pool workers.
    pub async fn run_on<F, R>(&self, thread: &AffinityThread, func: F) -> Result<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let permit = self.acquire().await?;
        let in_flight = Arc::clone(&self.in_flight);
        let completed = Arc::clone(&self.completed);
        in_flight.fetch_add(1, Ordering::SeqCst);
        trace!(thread = thread.name(), "dispatching thread-sensitive call");

        thread
            .run(move || {
                let _permit = permit;
                let _done = Finished {
                    in_flight,
                    completed,
                };
                func()
            })
            .await
    }

    async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        let semaphore = Arc::clone(&self.semaphore);
        let permit = match self.acquire_timeout {
            Some(timeout) => tokio::time::timeout(timeout, semaphore.acquire_owned())
                .await
                .map_err(|_| {
                    ModelError::Scheduling(format!(
                        "worker pool exhausted: no worker free within {:?}",
                        timeout
                    ))
                })?,
            None => semaphore.acquire_owned().await,
        };

        permit.map_err(|_| ModelError::Scheduling("worker pool is shut down".into()))
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(num_cpus::get())
    }
}

struct Finished {
    in_flight: Arc<AtomicUsize>,
    completed: Arc<AtomicU64>,
}

impl Drop for Finished {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.completed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Worker pool statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub max_workers: usize,
    pub available: usize,
    pub in_flight: usize,
    pub completed: u64,
}

impl std::fmt::Display for PoolStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Pool Stats: {}/{} busy, {} completed",
            self.in_flight, self.max_workers, self.completed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_returns_value() {
        let pool = WorkerPool::new(2);
        let value = pool.run(|| 40 + 2).await.unwrap();
        assert_eq!(value, 42);
        assert_eq!(pool.stats().completed, 1);
        assert_eq!(pool.available_permits(), 2);
    }

    #[tokio::test]
    async fn test_worker_can_block() {
        let pool = WorkerPool::new(1);
        assert!(pool.run(context::can_block).await.unwrap());
    }

    #[tokio::test]
    async fn test_shutdown_rejects_calls() {
        let pool = WorkerPool::new(1);
        pool.shutdown();
        let err = pool.run(|| ()).await.unwrap_err();
        assert!(err.is_scheduling());
    }

    #[tokio::test]
    async fn test_acquire_timeout() {
        let pool = Arc::new(WorkerPool::new(1).with_acquire_timeout(Duration::from_millis(20)));
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();

        let busy = Arc::clone(&pool);
        let holder = tokio::spawn(async move {
            busy.run(move || {
                let _ = release_rx.recv();
            })
            .await
        });

        while pool.available_permits() > 0 {
            tokio::task::yield_now().await;
        }

        let err = pool.run(|| ()).await.unwrap_err();
        assert!(err.is_scheduling());

        release_tx.send(()).unwrap();
        holder.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_run_on_takes_a_permit() {
        let pool = WorkerPool::new(1);
        let thread = AffinityThread::spawn().unwrap();
        let held = pool.run_on(&thread, || 0).await.unwrap();
        assert_eq!(held, 0);
        assert_eq!(pool.stats().completed, 1);
        assert_eq!(pool.available_permits(), 1);

        pool.shutdown();
        let err = pool.run_on(&thread, || ()).await.unwrap_err();
        assert!(err.is_scheduling());
        thread.shutdown();
    }

    #[test]
    fn test_run_without_runtime_fails() {
        let pool = WorkerPool::new(1);
        let err = futures::executor::block_on(pool.run(|| ())).unwrap_err();
        assert!(err.is_scheduling());
    }

    #[tokio::test]
    #[should_panic(expected = "worker exploded")]
    async fn test_panic_resumes_on_caller() {
        let pool = WorkerPool::new(1);
        let _ = pool.run(|| -> u8 { panic!("worker exploded") }).await;
    }
}
