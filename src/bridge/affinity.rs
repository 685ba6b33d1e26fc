//! Dedicated threads for thread-sensitive calls.
//!
//! An [`AffinityThread`] owns one OS thread and runs submitted calls on it in
//! submission order. A logical task binds its own thread for the duration of
//! [`thread_sensitive_scope`]; calls made outside any scope go to the worker
//! pool instead.

use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};

use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::context;
use crate::core::{ModelError, Result};

type Job = Box<dyn FnOnce() + Send + 'static>;

static NEXT_THREAD: AtomicU64 = AtomicU64::new(1);

tokio::task_local! {
    static TASK_THREAD: AffinityThread;
}

struct Inner {
    name: String,
    thread_id: ThreadId,
    sender: Mutex<Option<mpsc::Sender<Job>>>,
}

/// Handle to a dedicated worker thread. Cloning shares the thread.
#[derive(Clone)]
pub struct AffinityThread {
    inner: Arc<Inner>,
}

impl AffinityThread {
    /// Start a new dedicated thread.
    pub fn spawn() -> Result<Self> {
        let name = format!("asyncmodel-affinity-{}", NEXT_THREAD.fetch_add(1, Ordering::Relaxed));
        let (sender, receiver) = mpsc::channel::<Job>();

        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                context::mark_affinity_thread();
                context::as_worker(|| {
                    for job in receiver {
                        job();
                    }
                });
            })
            .map_err(|e| ModelError::Scheduling(format!("cannot start affinity thread: {}", e)))?;

        debug!(thread = %name, "affinity thread started");

        Ok(Self {
            inner: Arc::new(Inner {
                name,
                thread_id: handle.thread().id(),
                sender: Mutex::new(Some(sender)),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn thread_id(&self) -> ThreadId {
        self.inner.thread_id
    }

    pub fn is_current(&self) -> bool {
        thread::current().id() == self.inner.thread_id
    }

    /// Run `func` on this thread and await its result.
    ///
    /// Calls issued from the thread itself run inline.
    pub async fn run<F, R>(&self, func: F) -> Result<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.is_current() {
            return Ok(func());
        }

        let (tx, rx) = oneshot::channel();
        let job: Job = Box::new(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(func));
            // The caller may have been cancelled; the result is dropped then.
            let _ = tx.send(outcome);
        });

        {
            let sender = self.inner.sender.lock()?;
            let sender = sender.as_ref().ok_or_else(|| {
                ModelError::Scheduling(format!("affinity thread '{}' is shut down", self.inner.name))
            })?;
            sender.send(job).map_err(|_| {
                ModelError::Scheduling(format!("affinity thread '{}' has stopped", self.inner.name))
            })?;
        }

        match rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(payload)) => panic::resume_unwind(payload),
            Err(_) => Err(ModelError::Scheduling(format!(
                "affinity thread '{}' dropped the call",
                self.inner.name
            ))),
        }
    }

    /// Stop accepting calls; queued calls still run, then the thread exits.
    pub fn shutdown(&self) {
        match self.inner.sender.lock() {
            Ok(mut sender) => {
                if sender.take().is_some() {
                    debug!(thread = %self.inner.name, "affinity thread shut down");
                }
            }
            Err(err) => warn!(thread = %self.inner.name, "affinity sender poisoned: {}", err),
        }
    }
}

impl std::fmt::Debug for AffinityThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AffinityThread")
            .field("name", &self.inner.name)
            .field("thread_id", &self.inner.thread_id)
            .finish()
    }
}

/// Run `fut` with a dedicated thread bound to it; every thread-sensitive
/// call made while `fut` runs lands on that thread.
pub async fn thread_sensitive_scope<F>(fut: F) -> Result<F::Output>
where
    F: Future,
{
    let thread = AffinityThread::spawn()?;
    let scoped = thread.clone();
    let output = TASK_THREAD.scope(scoped, fut).await;
    thread.shutdown();
    Ok(output)
}

/// Thread bound to the current task, if any.
pub fn current_thread() -> Option<AffinityThread> {
    TASK_THREAD.try_with(Clone::clone).ok()
}
