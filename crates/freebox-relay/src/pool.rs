//! Shared worker pool for asynchronous completion callbacks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::runtime::Handle;

/// Runs completion callbacks on the runtime's blocking pool so they never
/// execute inline on the task that performed the network I/O.
///
/// Once [`shutdown`](Self::shutdown) is called every later submission is
/// silently dropped.
#[derive(Clone, Debug)]
pub struct CallbackPool {
    runtime: Handle,
    closed: Arc<AtomicBool>,
}

impl CallbackPool {
    pub fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Queue a callback. Returns `false` if the pool was already shut down.
    pub fn submit<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_shutdown() {
            tracing::debug!("callback pool shut down, dropping completion");
            return false;
        }
        self.runtime.spawn_blocking(task);
        true
    }

    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_submit_runs_callback() {
        let pool = CallbackPool::new(Handle::current());
        let (tx, rx) = tokio::sync::oneshot::channel();
        assert!(pool.submit(move || {
            let _ = tx.send(7);
        }));
        let value = tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .expect("callback never ran")
            .unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_is_noop() {
        let pool = CallbackPool::new(Handle::current());
        pool.shutdown();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        assert!(!pool.submit(move || {
            let _ = tx.send(());
        }));
        // The closure was dropped without running, so the sender is gone.
        assert!(rx.await.is_err());
    }
}
