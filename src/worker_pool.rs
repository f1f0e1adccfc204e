//! Bounded worker pool (component L).
//!
//! The reference source's `async/core.py` reactor offloads blocking work
//! (password hashing, disk-backed DB calls) onto a small thread pool fed
//! through a `Trigger` wakeup socket. Tokio's own executor already wakes a
//! task when a future it's polling completes, so there is no native
//! equivalent of that socket here (§9's Trigger-variant removal) — this
//! pool is just `spawn_blocking` gated by a [`tokio::sync::Semaphore`] so
//! the crate still honors a configured concurrency ceiling instead of
//! handing every blocking call straight to Tokio's own (much larger)
//! blocking thread pool.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinError;

use crate::error::XmppError;

/// Bounded pool of permits for offloaded blocking work. Default capacity
/// is 5, matching the configuration default in §6.
#[derive(Clone)]
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
}

impl WorkerPool {
    pub fn new(capacity: usize) -> Self {
        WorkerPool { semaphore: Arc::new(Semaphore::new(capacity.max(1))) }
    }

    /// Runs `f` on a blocking thread, queuing behind the pool's semaphore
    /// if every permit is currently in use.
    pub async fn run<F, T>(&self, f: F) -> Result<T, XmppError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| XmppError::internal("worker pool semaphore closed"))?;
        let result = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            f()
        })
        .await;
        map_join_result(result)
    }

    /// Runs an async future under the pool's concurrency gate, for work
    /// that is I/O-bound rather than CPU-bound (e.g. a libsql query) but
    /// should still respect the configured ceiling.
    pub async fn run_async<F, T>(&self, fut: F) -> Result<T, XmppError>
    where
        F: Future<Output = T>,
    {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| XmppError::internal("worker pool semaphore closed"))?;
        Ok(fut.await)
    }

    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }
}

fn map_join_result<T>(result: Result<T, JoinError>) -> Result<T, XmppError> {
    result.map_err(|e| XmppError::internal(format!("worker pool task panicked: {e}")))
}
