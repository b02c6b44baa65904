//! Bounded blocking pool
//!
//! Store calls are synchronous. They run on tokio's blocking threads, at most
//! `workers` at a time, so a slow database cannot starve the runtime.

use relay_foundation::{Error, Result};
use std::sync::Arc;
use tokio::sync::Semaphore;

#[derive(Clone)]
pub struct BlockingPool {
    permits: Arc<Semaphore>,
    workers: usize,
}

impl BlockingPool {
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        Self {
            permits: Arc::new(Semaphore::new(workers)),
            workers,
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Run `f` on a blocking thread once a worker slot is free
    pub async fn run<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| Error::Internal("blocking pool closed".into()))?;

        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            f()
        })
        .await
        .map_err(|e| Error::Internal(format!("blocking task failed: {e}")))?
    }
}

impl Default for BlockingPool {
    fn default() -> Self {
        Self::new(8)
    }
}
