use std::sync::Arc;

use tracing::trace;

use super::affinity::{self, AffinityThread};
use super::context;
use super::pool::WorkerPool;
use crate::core::Result;

/// Where a bridged blocking call runs.
#[derive(Debug, Clone)]
pub(crate) struct Placement {
    pub thread_sensitive: bool,
    pub executor: Option<Arc<WorkerPool>>,
    pub thread: Option<AffinityThread>,
}

impl Placement {
    /// Run `func` per this placement and await its result.
    pub(crate) async fn dispatch<F, R>(&self, func: F) -> Result<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let pool = self.pool();
        if let Some(thread) = &self.thread {
            return pool.run_on(thread, func).await;
        }

        if self.thread_sensitive {
            if context::on_affinity_thread() {
                return Ok(func());
            }
            if let Some(thread) = affinity::current_thread() {
                trace!(thread = thread.name(), "thread-sensitive call");
                return pool.run_on(&thread, func).await;
            }
        }

        pool.run(func).await
    }

    fn pool(&self) -> Arc<WorkerPool> {
        match &self.executor {
            Some(pool) => Arc::clone(pool),
            None => WorkerPool::global(),
        }
    }
}

/// A blocking callable made awaitable
///
/// Awaiting [`SyncToAsync::call`] runs the callable on a worker thread and
/// resumes with exactly its return value. Thread-sensitive calls (the
/// default) made inside one [`thread_sensitive_scope`] all run on that
/// scope's dedicated thread; elsewhere they run on the pool like any other
/// call. Either way each call holds a pool permit while it runs.
///
/// [`thread_sensitive_scope`]: super::thread_sensitive_scope
///
/// ```ignore
/// let lookup = sync_to_async(|id: i64| store.fetch(id));
/// let row = lookup.call(7).await?;
/// ```
pub struct SyncToAsync<F> {
    func: Arc<F>,
    placement: Placement,
}

/// Wrap a blocking callable. Thread-sensitive by default.
pub fn sync_to_async<F>(func: F) -> SyncToAsync<F> {
    SyncToAsync {
        func: Arc::new(func),
        placement: Placement {
            thread_sensitive: true,
            executor: None,
            thread: None,
        },
    }
}

impl<F> SyncToAsync<F> {
    /// Toggle per-task thread affinity.
    pub fn thread_sensitive(mut self, sensitive: bool) -> Self {
        self.placement.thread_sensitive = sensitive;
        self
    }

    /// Run on an explicit pool. An explicit executor disables thread affinity.
    pub fn executor(mut self, pool: Arc<WorkerPool>) -> Self {
        self.placement.executor = Some(pool);
        self.placement.thread_sensitive = false;
        self
    }

    /// Always run on the given dedicated thread.
    pub fn pinned_to(mut self, thread: AffinityThread) -> Self {
        self.placement.thread = Some(thread);
        self
    }

    pub fn is_thread_sensitive(&self) -> bool {
        self.placement.thread_sensitive
    }

    /// Invoke the callable with `args` on a worker and await its result.
    ///
    /// The only error introduced here is [`ModelError::Scheduling`]; whatever
    /// the callable returns comes back untouched.
    ///
    /// [`ModelError::Scheduling`]: crate::ModelError::Scheduling
    pub async fn call<A, R>(&self, args: A) -> Result<R>
    where
        F: Fn(A) -> R + Send + Sync + 'static,
        A: Send + 'static,
        R: Send + 'static,
    {
        let func = Arc::clone(&self.func);
        self.placement.dispatch(move || func(args)).await
    }
}

impl<F> Clone for SyncToAsync<F> {
    fn clone(&self) -> Self {
        Self {
            func: Arc::clone(&self.func),
            placement: self.placement.clone(),
        }
    }
}
