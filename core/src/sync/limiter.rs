use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;

/// Caps the number of concurrently running operations. Callers beyond the limit wait in
/// arrival order.
#[derive(Clone)]
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    limit: usize,
}

impl ConcurrencyLimiter {
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self { semaphore: Arc::new(Semaphore::new(limit)), limit }
    }

    /// Run `operation` once a slot is free. The slot is given back when it completes, fails or
    /// is dropped.
    pub async fn run<F: Future>(&self, operation: F) -> F::Output {
        let _permit = self.semaphore.acquire().await.expect("limiter semaphore is never closed");
        operation.await
    }

    pub fn limit(&self) -> usize { self.limit }

    /// Operations currently holding a slot
    pub fn in_flight(&self) -> usize { self.limit - self.semaphore.available_permits() }
}

impl std::fmt::Debug for ConcurrencyLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrencyLimiter").field("limit", &self.limit).field("in_flight", &self.in_flight()).finish()
    }
}
