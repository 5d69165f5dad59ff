//! Concurrency primitives: named locks, a concurrency ceiling and observable tasks.

mod advisory_lock;
mod limiter;
mod tracker;

pub use advisory_lock::{AdvisoryGuard, AdvisoryLocks};
pub use limiter::ConcurrencyLimiter;
pub use tracker::{TaskState, TaskTracker, TrackedTask};
