//! Bounded concurrency for async units of work.
//!
//! Backed by a `tokio::sync::Semaphore`, which is fair: waiters are admitted
//! in the order they started waiting, each as soon as a running unit
//! releases its permit. The permit is released however the unit ends
//! (success, error, panic unwind, or the future being dropped).

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;

#[derive(Clone)]
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    limit: usize,
}

impl ConcurrencyLimiter {
    /// A limiter admitting at most `limit` units (minimum one).
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Units currently holding a slot.
    pub fn active(&self) -> usize {
        self.limit - self.semaphore.available_permits()
    }

    /// Run `fut` once a slot is free.
    pub async fn run<F, T>(&self, fut: F) -> T
    where
        F: Future<Output = T>,
    {
        // The semaphore is never closed, so acquire cannot fail.
        let _permit = self.semaphore.acquire().await.ok();
        fut.await
    }
}
