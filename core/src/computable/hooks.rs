use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use async_trait::async_trait;

static NEXT_CELL_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a computable cell, as reported to hooks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellId(u64);

impl CellId {
    pub(crate) fn next() -> Self { Self(NEXT_CELL_ID.fetch_add(1, Ordering::Relaxed)) }
}

impl std::fmt::Display for CellId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { write!(f, "C{}", self.0) }
}

/// Observer of the way a cell is consumed. Data sources attach hooks from inside an
/// evaluation to learn whether anybody still cares about them.
///
/// Every `on_listen_start` is eventually followed by exactly one `on_listen_stop` for the same cell.
#[async_trait]
pub trait ComputableHooks: Send + Sync {
    /// The cell was asked whether it changed
    fn on_changed_request(&self, _cell: CellId) {}

    /// A value was read from the cell
    fn on_get_value(&self, _cell: CellId) {}

    /// Somebody started waiting for the cell to change
    fn on_listen_start(&self, _cell: CellId) {}

    fn on_listen_stop(&self, _cell: CellId) {}

    /// Bring the underlying data up to date with the remote state as of now.
    async fn refresh_state(&self, _cell: CellId) -> anyhow::Result<()> { Ok(()) }
}

/// Hooks collected during one evaluation, deduplicated by identity
#[derive(Clone, Default)]
pub(crate) struct HookSet(Vec<Arc<dyn ComputableHooks>>);

impl HookSet {
    pub fn insert(&mut self, hooks: Arc<dyn ComputableHooks>) {
        if !self.0.iter().any(|existing| same_hooks(existing, &hooks)) {
            self.0.push(hooks);
        }
    }

    pub fn extend(&mut self, other: &HookSet) {
        for hooks in &other.0 {
            self.insert(hooks.clone());
        }
    }

    pub fn is_empty(&self) -> bool { self.0.is_empty() }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn ComputableHooks>> { self.0.iter() }

    pub fn for_each(&self, f: impl Fn(&dyn ComputableHooks)) {
        for hooks in &self.0 {
            f(hooks.as_ref());
        }
    }
}

fn same_hooks(a: &Arc<dyn ComputableHooks>, b: &Arc<dyn ComputableHooks>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}
