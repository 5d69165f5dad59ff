//! Read access to a synchronized remote node tree from within cell evaluations.
//!
//! The tree itself is maintained elsewhere (see [`MemoryTree`] for an in-memory rendition fed by
//! a [`TreePoller`]). Evaluations read it through [`NodeView`], which attaches the evaluation's
//! watcher to every node it touches and marks the evaluation unstable when it runs into data
//! that is not there yet.

mod memory;
mod poller;

use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;

use crate::computable::ComputableCtx;
use crate::error::TreeError;
use computable_signals::Watcher;

pub use memory::{FieldSnapshot, MemoryTree, NodeSnapshot, TreeSnapshot};
pub use poller::{TreePoller, TreeSource};

/// What a node field points to
#[derive(Clone)]
pub enum FieldRef {
    /// The field exists but has no value assigned yet
    Unset,
    Resolved(Arc<dyn NodeReader>),
    /// The field resolved to an error instead of a node
    Error(String),
}

/// A node of the synchronized tree. Every read attaches `watcher` to the node, so that the next
/// change of the node fires it.
pub trait NodeReader: Send + Sync {
    fn id(&self) -> &str;

    /// True once the node holds its final content or has failed
    fn is_ready_or_error(&self, watcher: &Watcher) -> bool;

    /// `None` if the node has no field with this name
    fn field(&self, name: &str, watcher: &Watcher) -> Option<FieldRef>;

    fn data(&self, watcher: &Watcher) -> Option<Bytes>;

    fn error(&self, watcher: &Watcher) -> Option<String>;
}

/// A node seen from one evaluation
#[derive(Clone)]
pub struct NodeView<'a> {
    ctx: &'a ComputableCtx,
    node: Arc<dyn NodeReader>,
}

impl<'a> NodeView<'a> {
    pub fn new(ctx: &'a ComputableCtx, node: Arc<dyn NodeReader>) -> Self { Self { ctx, node } }

    pub fn id(&self) -> &str { self.node.id() }

    /// Marks the evaluation unstable if the node is still being populated
    pub fn is_ready_or_error(&self) -> bool {
        let ready = self.node.is_ready_or_error(self.ctx.watcher());
        if !ready {
            self.ctx.mark_unstable(Some(&format!("not_ready:{}", self.node.id())));
        }
        ready
    }

    /// Follow the field `name`. `Ok(None)` means there is nothing there yet; the evaluation is
    /// marked unstable unless the node is final and simply has no such field.
    pub fn traverse(&self, name: &str) -> Result<Option<NodeView<'a>>, TreeError> {
        match self.node.field(name, self.ctx.watcher()) {
            Some(FieldRef::Resolved(node)) => Ok(Some(NodeView { ctx: self.ctx, node })),
            Some(FieldRef::Unset) => {
                self.ctx.mark_unstable(Some(&format!("unpopulated_field:{name}")));
                Ok(None)
            }
            Some(FieldRef::Error(message)) => {
                Err(TreeError::Field { node: self.node.id().to_owned(), field: name.to_owned(), message })
            }
            None => {
                self.is_ready_or_error();
                Ok(None)
            }
        }
    }

    pub fn traverse_path(&self, path: &[&str]) -> Result<Option<NodeView<'a>>, TreeError> {
        let mut current = self.clone();
        for name in path {
            match current.traverse(name)? {
                Some(next) => current = next,
                None => return Ok(None),
            }
        }
        Ok(Some(current))
    }

    /// Fails if the node is in an error state
    pub fn check_error(&self) -> Result<(), TreeError> {
        match self.node.error(self.ctx.watcher()) {
            Some(message) => Err(TreeError::Node { node: self.node.id().to_owned(), message }),
            None => Ok(()),
        }
    }

    /// Raw node payload. Missing data on a node that is not ready marks the evaluation unstable.
    pub fn data(&self) -> Option<Bytes> {
        let data = self.node.data(self.ctx.watcher());
        if data.is_none() {
            self.is_ready_or_error();
        }
        data
    }

    pub fn data_as_string(&self) -> Result<Option<String>, TreeError> {
        match self.data() {
            None => Ok(None),
            Some(data) => String::from_utf8(data.to_vec()).map(Some).map_err(|_| TreeError::Utf8 { node: self.node.id().to_owned() }),
        }
    }

    pub fn data_as_json<T: DeserializeOwned>(&self) -> Result<Option<T>, TreeError> {
        match self.data() {
            None => Ok(None),
            Some(data) => serde_json::from_slice(&data).map(Some).map_err(|source| TreeError::Json { node: self.node.id().to_owned(), source }),
        }
    }
}

impl std::fmt::Debug for NodeView<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.debug_struct("NodeView").field("id", &self.node.id()).finish() }
}
