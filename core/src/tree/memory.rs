use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::{FieldRef, NodeReader, NodeView};
use crate::computable::ComputableCtx;
use computable_signals::{KeyedChangeSource, Watcher};

/// Point-in-time copy of the remote tree
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TreeSnapshot {
    pub nodes: Vec<NodeSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub id: String,
    #[serde(default)]
    pub ready: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Bytes>,
    #[serde(default)]
    pub fields: BTreeMap<String, FieldSnapshot>,
}

impl NodeSnapshot {
    pub fn new(id: impl Into<String>) -> Self { Self { id: id.into(), ready: false, error: None, data: None, fields: BTreeMap::new() } }

    pub fn ready(mut self) -> Self {
        self.ready = true;
        self
    }

    pub fn with_data(mut self, data: impl Into<Bytes>) -> Self {
        self.data = Some(data.into());
        self
    }

    pub fn with_field(mut self, name: impl Into<String>, field: FieldSnapshot) -> Self {
        self.fields.insert(name.into(), field);
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error = Some(message.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldSnapshot {
    Unset,
    Node { id: String },
    Error { message: String },
}

impl FieldSnapshot {
    pub fn node(id: impl Into<String>) -> Self { Self::Node { id: id.into() } }
}

/// In-memory synchronized tree.
///
/// Each node has its own change group: applying a snapshot fires only the watchers of nodes
/// whose content differs from the previous snapshot.
#[derive(Clone, Default)]
pub struct MemoryTree {
    inner: Arc<TreeInner>,
}

#[derive(Default)]
struct TreeInner {
    nodes: RwLock<HashMap<String, NodeSnapshot>>,
    changes: KeyedChangeSource<String>,
}

impl MemoryTree {
    pub fn new() -> Self { Self::default() }

    /// Replace the tree content with `snapshot`. Returns the number of nodes that changed,
    /// appeared or disappeared.
    pub fn apply(&self, snapshot: TreeSnapshot) -> usize {
        let next: HashMap<String, NodeSnapshot> = snapshot.nodes.into_iter().map(|node| (node.id.clone(), node)).collect();
        let changed: Vec<String> = {
            let mut nodes = self.inner.nodes.write().expect("tree lock poisoned");
            let ids: HashSet<&String> = nodes.keys().chain(next.keys()).collect();
            let changed = ids.into_iter().filter(|id| nodes.get(*id) != next.get(*id)).cloned().collect();
            *nodes = next;
            changed
        };
        for id in &changed {
            self.inner.changes.mark_changed(id, Some(&format!("node:{id}")));
        }
        if !changed.is_empty() {
            tracing::trace!("tree → {} nodes changed", changed.len());
        }
        changed.len()
    }

    /// Replace the tree content and invalidate every reader, e.g. after the connection to the
    /// remote side was re-established and incremental diffs can't be trusted.
    pub fn resync(&self, snapshot: TreeSnapshot) {
        *self.inner.nodes.write().expect("tree lock poisoned") =
            snapshot.nodes.into_iter().map(|node| (node.id.clone(), node)).collect();
        self.inner.changes.mark_all_changed(Some("resync"));
        crate::action_debug!("tree", "resync");
    }

    /// Reader of the node `id`. The node does not have to exist (yet): a missing node reads
    /// as not ready.
    pub fn node(&self, id: impl Into<String>) -> Arc<dyn NodeReader> { Arc::new(TreeNode { tree: self.inner.clone(), id: id.into() }) }

    /// View of the node `id` from within `ctx`'s evaluation
    pub fn view<'a>(&self, ctx: &'a ComputableCtx, id: impl Into<String>) -> NodeView<'a> { NodeView::new(ctx, self.node(id)) }

    pub fn contains(&self, id: &str) -> bool { self.inner.nodes.read().expect("tree lock poisoned").contains_key(id) }

    pub fn len(&self) -> usize { self.inner.nodes.read().expect("tree lock poisoned").len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

struct TreeNode {
    tree: Arc<TreeInner>,
    id: String,
}

impl TreeNode {
    /// Attach `watcher` to this node and read from its current snapshot
    fn read<R>(&self, watcher: &Watcher, read: impl FnOnce(Option<&NodeSnapshot>) -> R) -> R {
        self.tree.changes.attach_watcher(&self.id, watcher);
        let nodes = self.tree.nodes.read().expect("tree lock poisoned");
        read(nodes.get(&self.id))
    }
}

impl NodeReader for TreeNode {
    fn id(&self) -> &str { &self.id }

    fn is_ready_or_error(&self, watcher: &Watcher) -> bool {
        self.read(watcher, |node| node.is_some_and(|node| node.ready || node.error.is_some()))
    }

    fn field(&self, name: &str, watcher: &Watcher) -> Option<FieldRef> {
        let field = self.read(watcher, |node| node.and_then(|node| node.fields.get(name).cloned()))?;
        Some(match field {
            FieldSnapshot::Unset => FieldRef::Unset,
            FieldSnapshot::Node { id } => FieldRef::Resolved(Arc::new(TreeNode { tree: self.tree.clone(), id })),
            FieldSnapshot::Error { message } => FieldRef::Error(message),
        })
    }

    fn data(&self, watcher: &Watcher) -> Option<Bytes> { self.read(watcher, |node| node.and_then(|node| node.data.clone())) }

    fn error(&self, watcher: &Watcher) -> Option<String> { self.read(watcher, |node| node.and_then(|node| node.error.clone())) }
}
