use std::future::Future;
use std::panic;

use tokio::runtime::{Builder, Handle, RuntimeFlavor};
use tracing::debug;

use crate::core::{ModelError, Result};

/// An async callable made callable from synchronous code
///
/// [`AsyncToSync::call`] blocks the calling thread until the future produced
/// by the callable completes. An existing runtime is reused when the thread
/// may block on it; otherwise a transient current-thread runtime is created
/// for the call and torn down afterwards.
pub struct AsyncToSync<F> {
    func: F,
    force_new_loop: bool,
    runtime: Option<Handle>,
}

/// Wrap an async callable for synchronous callers.
pub fn async_to_sync<F>(func: F) -> AsyncToSync<F> {
    AsyncToSync {
        func,
        force_new_loop: false,
        runtime: None,
    }
}

impl<F> AsyncToSync<F> {
    /// Always run on a fresh transient runtime.
    pub fn force_new_loop(mut self, force: bool) -> Self {
        self.force_new_loop = force;
        self
    }

    /// Reuse this runtime when called from a thread outside any runtime.
    pub fn on_runtime(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    /// Run the callable with `args` to completion and return its output.
    pub fn call<A, Fut>(&self, args: A) -> Result<Fut::Output>
    where
        F: Fn(A) -> Fut,
        Fut: Future + Send,
        Fut::Output: Send,
    {
        let fut = (self.func)(args);
        block_on(fut, self.force_new_loop, self.runtime.as_ref())
    }
}

/// Drive `fut` to completion from synchronous code.
pub(crate) fn block_on<Fut>(
    fut: Fut,
    force_new_loop: bool,
    runtime: Option<&Handle>,
) -> Result<Fut::Output>
where
    Fut: Future + Send,
    Fut::Output: Send,
{
    match Handle::try_current() {
        Ok(handle) if !force_new_loop && is_multi_thread(&handle) => {
            // Only a multi-thread runtime can hand this worker's tasks to
            // another worker while we block.
            Ok(tokio::task::block_in_place(|| handle.block_on(fut)))
        }
        Ok(_) => {
            // This thread drives a runtime it must not block; run a transient
            // runtime on a helper thread instead.
            std::thread::scope(|scope| {
                scope
                    .spawn(|| run_transient(fut))
                    .join()
                    .unwrap_or_else(|payload| panic::resume_unwind(payload))
            })
        }
        Err(_) => match runtime {
            Some(handle) if !force_new_loop => Ok(handle.block_on(fut)),
            _ => run_transient(fut),
        },
    }
}

fn is_multi_thread(handle: &Handle) -> bool {
    matches!(handle.runtime_flavor(), RuntimeFlavor::MultiThread)
}

fn run_transient<Fut: Future>(fut: Fut) -> Result<Fut::Output> {
    let runtime = Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| ModelError::Scheduling(format!("cannot build transient runtime: {}", e)))?;
    debug!("transient runtime started");
    let output = runtime.block_on(fut);
    drop(runtime);
    debug!("transient runtime torn down");
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runs_without_runtime() {
        let add = async_to_sync(|(a, b): (i32, i32)| async move { a + b });
        assert_eq!(add.call((2, 3)).unwrap(), 5);
    }

    #[test]
    fn test_reuses_explicit_runtime() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();

        let flavor = async_to_sync(|_: ()| async { Handle::current().runtime_flavor() })
            .on_runtime(runtime.handle().clone());
        assert_eq!(flavor.call(()).unwrap(), RuntimeFlavor::MultiThread);

        let forced = async_to_sync(|_: ()| async { Handle::current().runtime_flavor() })
            .on_runtime(runtime.handle().clone())
            .force_new_loop(true);
        assert_eq!(forced.call(()).unwrap(), RuntimeFlavor::CurrentThread);
    }

    #[tokio::test]
    async fn test_inside_current_thread_runtime_uses_helper() {
        let caller = std::thread::current().id();
        let on = async_to_sync(|_: ()| async { std::thread::current().id() });
        assert_ne!(on.call(()).unwrap(), caller);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_inside_multi_thread_runtime_reuses_it() {
        let flavor = async_to_sync(|_: ()| async { Handle::current().runtime_flavor() });
        assert_eq!(flavor.call(()).unwrap(), RuntimeFlavor::MultiThread);
    }

    #[test]
    fn test_async_errors_pass_through() {
        let failing = async_to_sync(|_: ()| async { Err::<(), _>(ModelError::NotSupported("x".into())) });
        assert!(failing.call(()).unwrap().unwrap_err().is_not_supported());
    }
}
