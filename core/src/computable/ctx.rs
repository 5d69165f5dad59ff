use std::any::Any;
use std::cell::RefCell;
use std::sync::Arc;

use super::cell::Computable;
use super::hooks::{ComputableHooks, HookSet};
use super::state::{ContextStore, DestroyCallback};
use crate::error::ComputableError;
use computable_signals::Watcher;

/// Attempts at reading a child whose state keeps getting reset before this evaluation gives up
const NESTED_READ_ATTEMPTS: usize = 3;

/// Handle given to an evaluation function for the duration of a single evaluation.
///
/// Everything registered through the context (watchers, hooks, destroy callbacks) belongs to
/// the state this evaluation produces. The exception is the value store ([`ComputableCtx::get`],
/// [`ComputableCtx::set`] and friends), which is carried over to the next evaluation of the same
/// cell and only cleared by [`Computable::reset_state`].
pub struct ComputableCtx {
    key: String,
    watcher: Watcher,
    inner: RefCell<CtxInner>,
}

#[derive(Default)]
struct CtxInner {
    unstable: bool,
    unstable_marker: Option<String>,
    hooks: HookSet,
    on_destroy: Vec<DestroyCallback>,
    store: ContextStore,
}

/// What an evaluation left behind in its context
pub(crate) struct CtxOutcome {
    pub unstable: bool,
    pub unstable_marker: Option<String>,
    pub hooks: HookSet,
    pub on_destroy: Vec<DestroyCallback>,
    pub store: ContextStore,
}

impl ComputableCtx {
    pub(crate) fn new(key: &str, watcher: Watcher, store: ContextStore) -> Self {
        Self { key: key.to_owned(), watcher, inner: RefCell::new(CtxInner { store, ..Default::default() }) }
    }

    /// Key of the cell being evaluated
    pub fn key(&self) -> &str { &self.key }

    /// The watcher of this evaluation. Attach it to every change source the evaluation reads from.
    pub fn watcher(&self) -> &Watcher { &self.watcher }

    /// Flag the result of this evaluation as not final. The first marker provided wins.
    pub fn mark_unstable(&self, marker: Option<&str>) {
        let mut inner = self.inner.borrow_mut();
        inner.unstable = true;
        if inner.unstable_marker.is_none() {
            inner.unstable_marker = marker.map(str::to_owned);
        }
    }

    pub fn is_unstable(&self) -> bool { self.inner.borrow().unstable }

    pub fn unstable_marker(&self) -> Option<String> { self.inner.borrow().unstable_marker.clone() }

    pub fn attach_hooks(&self, hooks: Arc<dyn ComputableHooks>) { self.inner.borrow_mut().hooks.insert(hooks); }

    /// Run `callback` once the state produced by this evaluation is discarded: replaced by a
    /// newer state, reset, or dropped together with the cell.
    pub fn add_on_destroy(&self, callback: impl FnOnce() + Send + 'static) { self.inner.borrow_mut().on_destroy.push(Box::new(callback)); }

    /// The value stored under `key` by this or an earlier evaluation of the cell. `None` if there
    /// is none or it has another type.
    pub fn get<V: Clone + Send + Sync + 'static>(&self, key: &str) -> Option<V> {
        self.inner.borrow().store.get(key).and_then(|value| value.downcast_ref::<V>()).cloned()
    }

    pub fn set<V: Send + Sync + 'static>(&self, key: impl Into<String>, value: V) {
        self.inner.borrow_mut().store.insert(key.into(), Box::new(value) as Box<dyn Any + Send + Sync>);
    }

    pub fn has(&self, key: &str) -> bool { self.inner.borrow().store.contains_key(key) }

    pub fn reset(&self, key: &str) { self.inner.borrow_mut().store.remove(key); }

    /// The stored value, or the result of `init` stored under `key` if there is no value of
    /// type `V` yet
    pub fn get_or_create<V: Clone + Send + Sync + 'static>(&self, key: &str, init: impl FnOnce() -> V) -> V {
        if let Some(value) = self.get(key) {
            return value;
        }
        let value = init();
        self.set(key, value.clone());
        value
    }

    /// Read another cell from within this evaluation.
    ///
    /// The child's watcher is linked under this evaluation's watcher, its hooks are inherited and
    /// its instability is propagated. A failed child returns its error, which the evaluation
    /// usually propagates with `?`.
    ///
    /// A child reset while it evaluates is read again. If it keeps getting reset the reset error is
    /// returned and this evaluation's watcher is fired, so the state it produces is stale and the
    /// next read evaluates again.
    pub fn read<U: Clone + Send + Sync + 'static>(&self, child: &Computable<U>) -> Result<U, ComputableError> {
        let mut attempt = 1;
        let snapshot = loop {
            match child.observed_snapshot() {
                Ok(snapshot) => break snapshot,
                Err(err) if attempt < NESTED_READ_ATTEMPTS => {
                    tracing::trace!("{} → {}, reading again", self.key, err);
                    attempt += 1;
                }
                Err(err) => {
                    let marker = format!("reset:{}", child.key());
                    self.mark_unstable(Some(&marker));
                    self.watcher.mark_changed(Some(&marker));
                    return Err(err);
                }
            }
        };
        self.watcher.add_child(&snapshot.watcher);
        self.inner.borrow_mut().hooks.extend(&snapshot.hooks);
        if !snapshot.stable {
            self.mark_unstable(snapshot.unstable_marker.as_deref());
        }
        snapshot.outcome
    }

    pub(crate) fn finish(self) -> CtxOutcome {
        let inner = self.inner.into_inner();
        CtxOutcome { unstable: inner.unstable, unstable_marker: inner.unstable_marker, hooks: inner.hooks, on_destroy: inner.on_destroy, store: inner.store }
    }
}

impl std::fmt::Debug for ComputableCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputableCtx").field("key", &self.key).field("watcher", &self.watcher).finish()
    }
}
