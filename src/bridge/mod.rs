//! Sync/async bridge.
//!
//! `sync_to_async` lets async code await blocking calls without stalling the
//! runtime; `async_to_sync` lets blocking code wait for async operations.
//! [`Bridge`] is the handle the query and model layers use to run every
//! executing operation.

pub mod affinity;
pub mod async_to_sync;
pub mod config;
pub mod context;
pub mod pool;
pub mod sync_to_async;

use std::sync::Arc;

use tracing::debug;

pub use affinity::{AffinityThread, thread_sensitive_scope};
pub use async_to_sync::{AsyncToSync, async_to_sync};
pub use config::BridgeConfig;
pub use context::can_block;
pub use pool::{PoolStats, WorkerPool};
pub use sync_to_async::{SyncToAsync, sync_to_async};

use crate::core::Result;
use sync_to_async::Placement;

/// Scheduling policy shared by proxies and records of one database handle.
#[derive(Debug, Clone)]
pub struct Bridge {
    placement: Placement,
    pool: Arc<WorkerPool>,
}

impl Bridge {
    pub fn new(config: &BridgeConfig) -> Self {
        let mut pool = WorkerPool::new(config.max_workers);
        if let Some(timeout) = config.acquire_timeout {
            pool = pool.with_acquire_timeout(timeout);
        }
        Self::with_pool(Arc::new(pool), config.thread_sensitive)
    }

    pub fn with_pool(pool: Arc<WorkerPool>, thread_sensitive: bool) -> Self {
        Self {
            placement: Placement {
                thread_sensitive,
                executor: Some(Arc::clone(&pool)),
                thread: None,
            },
            pool,
        }
    }

    /// Bridge over the process-wide pool.
    pub fn global(thread_sensitive: bool) -> Self {
        Self::with_pool(WorkerPool::global(), thread_sensitive)
    }

    pub fn is_thread_sensitive(&self) -> bool {
        self.placement.thread_sensitive
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Copy of this bridge that pins every call to `thread`.
    pub fn pinned_to(&self, thread: AffinityThread) -> Self {
        let mut bridge = self.clone();
        bridge.placement.thread = Some(thread);
        bridge
    }

    /// Run a blocking call and await its value.
    pub async fn run<F, R>(&self, func: F) -> Result<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.placement.dispatch(func).await
    }

    /// Run a fallible blocking call; its error is returned as-is.
    pub async fn call<F, T>(&self, op: &'static str, func: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        debug!(op, thread_sensitive = self.placement.thread_sensitive, "bridged call");
        self.placement.dispatch(func).await?
    }
}

impl Default for Bridge {
    fn default() -> Self {
        Self::new(&BridgeConfig::default())
    }
}
