//! Execution-context capability queries.
//!
//! A thread may block when it is not driving an async runtime, or when it is
//! one of the bridge's own worker threads.

use std::cell::Cell;
use std::thread::ThreadId;

thread_local! {
    static BRIDGE_WORKER: Cell<bool> = const { Cell::new(false) };
    static AFFINITY_THREAD: Cell<Option<ThreadId>> = const { Cell::new(None) };
}

/// True when the calling thread is allowed to issue blocking calls.
pub fn can_block() -> bool {
    in_bridge_worker() || tokio::runtime::Handle::try_current().is_err()
}

/// True while the calling thread is executing a bridged blocking call.
pub fn in_bridge_worker() -> bool {
    BRIDGE_WORKER.with(Cell::get)
}

/// Run `func` with the current thread flagged as a bridge worker.
pub(crate) fn as_worker<R>(func: impl FnOnce() -> R) -> R {
    struct Reset(bool);

    impl Drop for Reset {
        fn drop(&mut self) {
            BRIDGE_WORKER.with(|flag| flag.set(self.0));
        }
    }

    let _reset = Reset(BRIDGE_WORKER.with(|flag| flag.replace(true)));
    func()
}

pub(crate) fn mark_affinity_thread() {
    AFFINITY_THREAD.with(|slot| slot.set(Some(std::thread::current().id())));
}

/// True when the calling thread is a dedicated affinity thread.
pub fn on_affinity_thread() -> bool {
    AFFINITY_THREAD.with(Cell::get) == Some(std::thread::current().id())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_thread_can_block() {
        assert!(can_block());
        assert!(!in_bridge_worker());
    }

    #[tokio::test]
    async fn test_runtime_thread_cannot_block() {
        assert!(!can_block());
        assert!(as_worker(can_block));
        assert!(!can_block());
    }

    #[test]
    fn test_worker_flag_resets_after_panic() {
        let result = std::panic::catch_unwind(|| as_worker(|| -> u8 { panic!("boom") }));
        assert!(result.is_err());
        assert!(!in_bridge_worker());
    }
}
