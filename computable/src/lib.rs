//! # Computable
//!
//! An incremental computation engine for UIs and services that derive values from a remote,
//! slowly changing resource graph.
//!
//! ## Key Features
//!
//! - **Lazy memoized cells**: a [`Computable`] runs its evaluation function on demand and keeps
//!   the result until something it read changes
//! - **Watcher based invalidation**: data sources hand out [`ChangeSource`]s; evaluations attach
//!   their watcher and get re-run after the next `mark_changed`
//! - **Stabilization**: evaluations can flag a value as not final yet, and callers can wait for
//!   a stable one with a timeout or a cancellation token
//! - **Resource pooling**: reference counted pools with serial disposal and LRU layers
//! - **Polling**: a single loop polls remote state, paused while nobody listens
//!
//! ## Core Concepts
//!
//! - **Watcher**: a one-shot "something changed" flag, possibly linked under a parent
//! - **Change source**: the thing that fires watchers when the data it guards changes
//! - **Cell**: a [`Computable`], an evaluation function plus its memoized state
//! - **Hooks**: an observer a data source attaches to learn whether a cell is still listened to
//!
//! ## Example
//!
//! ```rust
//! # use computable::{ChangeSource, Computable};
//! # use std::sync::{Arc, atomic::{AtomicU32, Ordering}};
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let source = Arc::new(ChangeSource::new());
//!     let counter = Arc::new(AtomicU32::new(1));
//!
//!     let doubled = {
//!         let (source, counter) = (source.clone(), counter.clone());
//!         Computable::make(move |ctx| {
//!             source.attach_watcher(ctx.watcher());
//!             Ok(counter.load(Ordering::SeqCst) * 2)
//!         })
//!     };
//!     assert_eq!(doubled.get_value()?, 2);
//!
//!     counter.store(5, Ordering::SeqCst);
//!     source.mark_changed(None);
//!     assert_eq!(doubled.await_stable_value(None).await?, 10);
//! #   Ok(())
//! # }
//! ```

pub use computable_core as core;
pub use computable_signals as signals;

// Re-export commonly used types
pub use computable_core::{
    computable::{CellId, ComputableCtx, ComputableHooks, ComputableOptions, ComputableValue, RenderingMode, StabilizeOptions, StableValue, ValueOrError, ValueTag},
    config::EngineConfig,
    error::{ComputableError, PoolError, TaskError, TreeError},
    poll::{PollActor, PollComputablePool, PollPool, PollPoolOptions, PollSource},
    pool::{hash_json_key, OwnerLru, PoolEntry, PoolKey, PoolLru, PoolSpec, RefCountPool},
    sync::{AdvisoryGuard, AdvisoryLocks, ConcurrencyLimiter, TaskState, TaskTracker, TrackedTask},
    tree::{MemoryTree, NodeReader, NodeView, TreePoller, TreeSnapshot, TreeSource},
    Computable,
};
pub use computable_signals::{CancellationToken, ChangeSource, KeyedChangeSource, Watcher};
