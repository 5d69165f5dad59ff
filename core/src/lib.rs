//! Incremental computation engine: memoized cells invalidated through watchers, reference
//! counted resource pools, polling of remote state and a few async coordination primitives.

pub mod computable;
pub mod config;
pub mod error;
pub mod poll;
pub mod pool;
pub mod sync;
pub mod tree;
pub mod util;

pub use computable::{Computable, ComputableCtx, ComputableOptions, RenderingMode, StabilizeOptions, ValueOrError};
pub use config::EngineConfig;
pub use error::{ComputableError, PoolError, TaskError, TreeError};

pub use computable_signals as signals;
pub use computable_signals::{CancellationToken, ChangeSource, KeyedChangeSource, Watcher};
