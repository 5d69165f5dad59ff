//! Public error types of the engine.
//!
//! User callbacks (evaluators, pool constructors, poll sources) return `anyhow::Result`; their
//! failures are wrapped into the enums below at the API boundary.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::pool::PoolKey;

/// Error type for reads of a [`Computable`](crate::computable::Computable).
///
/// Clone because evaluation errors are memoized until the cell's watcher fires.
#[derive(Debug, Clone, Error)]
pub enum ComputableError {
    /// The evaluation function (or a hook it relies on) failed
    #[error("computable {key} failed: {cause:#}")]
    Evaluation { key: String, cause: Arc<anyhow::Error> },

    /// Stabilization did not reach a stable value in time
    #[error("computable {key} did not stabilize within {elapsed:?} (last unstable marker: {marker:?})")]
    Timeout { key: String, elapsed: Duration, marker: Option<String> },

    /// The cancellation token passed to a wait was triggered
    #[error("computable {key}: wait aborted")]
    Aborted { key: String },

    /// `reset_state` was called while this read was evaluating
    #[error("computable {key}: state was reset during evaluation")]
    StateReset { key: String },
}

impl ComputableError {
    pub(crate) fn evaluation(key: &str, cause: anyhow::Error) -> Self { Self::Evaluation { key: key.to_owned(), cause: Arc::new(cause) } }

    /// The key of the cell that produced this error
    pub fn key(&self) -> &str {
        match self {
            Self::Evaluation { key, .. } | Self::Timeout { key, .. } | Self::Aborted { key } | Self::StateReset { key } => key,
        }
    }

    /// True for errors produced by user code, as opposed to waits that ran out or were cancelled
    pub fn is_evaluation(&self) -> bool { matches!(self, Self::Evaluation { .. }) }
}

/// Error type for [`RefCountPool`](crate::pool::RefCountPool) operations.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The resource constructor failed; nothing was inserted into the pool
    #[error("failed to construct pooled resource {key}: {cause:#}")]
    Construction { key: PoolKey, cause: anyhow::Error },

    /// No live entry under this key
    #[error("no pooled resource under key {0}")]
    NotFound(PoolKey),

    /// Request parameters could not be serialized into a key
    #[error("failed to derive pool key: {0}")]
    Key(#[from] serde_json::Error),
}

/// Error type for [`TrackedTask`](crate::sync::TrackedTask) results.
#[derive(Debug, Clone, Error)]
pub enum TaskError {
    /// The tracked future returned an error
    #[error("task {id} failed: {cause:#}")]
    Failed { id: u64, cause: Arc<anyhow::Error> },

    /// The tracked future panicked
    #[error("task {id} panicked: {message}")]
    Panicked { id: u64, message: String },

    /// The runtime dropped the task before it settled
    #[error("task {id} was cancelled")]
    Cancelled { id: u64 },
}

/// Error type for tree node access.
#[derive(Debug, Error)]
pub enum TreeError {
    /// The field resolved to an error instead of a node
    #[error("field {field} of node {node} resolved to an error: {message}")]
    Field { node: String, field: String, message: String },

    /// The node itself is in an error state
    #[error("node {node} is in error state: {message}")]
    Node { node: String, message: String },

    #[error("node {node} data is not valid json: {source}")]
    Json { node: String, source: serde_json::Error },

    #[error("node {node} data is not valid utf-8")]
    Utf8 { node: String },
}
