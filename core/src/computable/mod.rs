//! Lazily evaluated, memoized cells invalidated through watchers.

mod cell;
mod ctx;
mod hooks;
mod state;

pub use cell::{Computable, ComputableOptions, RenderingMode, StabilizeOptions, StableValue};
pub use ctx::ComputableCtx;
pub use hooks::{CellId, ComputableHooks};
pub use state::{ComputableValue, ValueOrError, ValueTag};
