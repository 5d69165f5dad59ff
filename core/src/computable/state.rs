use std::any::Any;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use super::hooks::HookSet;
use crate::error::ComputableError;
use computable_signals::Watcher;

/// Identifies one computed state of a cell. A new tag is minted every time a cell swaps in a
/// freshly evaluated state, so "did anything change since tag X" is a plain comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ValueTag(Ulid);

impl ValueTag {
    pub(crate) fn new() -> Self { Self(Ulid::new()) }
}

impl std::fmt::Display for ValueTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { write!(f, "{}", self.0) }
}

/// A snapshot read of a cell
#[derive(Debug, Clone, PartialEq)]
pub struct ComputableValue<T> {
    pub value: T,
    /// False if the evaluation (or a nested one) marked itself unstable, or the inputs changed
    /// while it was running
    pub stable: bool,
    /// First marker passed to `mark_unstable`
    pub unstable_marker: Option<String>,
    pub tag: ValueTag,
}

pub(crate) type DestroyCallback = Box<dyn FnOnce() + Send>;

/// Values kept by a cell across its evaluations
pub(crate) type ContextStore = HashMap<String, Box<dyn Any + Send + Sync>>;

/// Outcome of [`Computable::wrap_error`](super::Computable::wrap_error): the value of the wrapped
/// cell, or its error rendered as a message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueOrError<T> {
    Value(T),
    Error(String),
}

impl<T> ValueOrError<T> {
    pub fn is_value(&self) -> bool { matches!(self, Self::Value(_)) }

    pub fn into_result(self) -> Result<T, String> {
        match self {
            Self::Value(value) => Ok(value),
            Self::Error(message) => Err(message),
        }
    }
}

/// Result of one evaluation, kept until the watcher fires and a newer state replaces it
pub(crate) struct CellState<T> {
    pub outcome: Result<T, ComputableError>,
    pub watcher: Watcher,
    pub stable: bool,
    pub unstable_marker: Option<String>,
    pub tag: ValueTag,
    pub hooks: HookSet,
    on_destroy: Vec<DestroyCallback>,
}

impl<T: Clone> CellState<T> {
    pub fn new(
        outcome: Result<T, ComputableError>,
        watcher: Watcher,
        stable: bool,
        unstable_marker: Option<String>,
        hooks: HookSet,
        on_destroy: Vec<DestroyCallback>,
    ) -> Self {
        Self { outcome, watcher, stable, unstable_marker, tag: ValueTag::new(), hooks, on_destroy }
    }

    pub fn snapshot(&self) -> Snapshot<T> {
        Snapshot {
            outcome: self.outcome.clone(),
            watcher: self.watcher.clone(),
            stable: self.stable && !self.watcher.is_changed(),
            unstable_marker: self.unstable_marker.clone(),
            tag: self.tag,
            hooks: self.hooks.clone(),
        }
    }
}

impl<T> Drop for CellState<T> {
    fn drop(&mut self) {
        for callback in self.on_destroy.drain(..) {
            callback();
        }
    }
}

/// Everything a reader needs from a state, detached from the cell's lock
pub(crate) struct Snapshot<T> {
    pub outcome: Result<T, ComputableError>,
    pub watcher: Watcher,
    pub stable: bool,
    pub unstable_marker: Option<String>,
    pub tag: ValueTag,
    pub hooks: HookSet,
}

impl<T> Snapshot<T> {
    pub fn into_value(self) -> Result<ComputableValue<T>, ComputableError> {
        Ok(ComputableValue { value: self.outcome?, stable: self.stable, unstable_marker: self.unstable_marker, tag: self.tag })
    }
}
