use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, Weak,
};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// A unique identifier for a watcher. Derived from the address of the shared state,
/// which stays reserved for as long as any handle (strong or weak) exists.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct WatcherId(usize);

impl std::fmt::Display for WatcherId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { write!(f, "W{:x}", self.0) }
}

/// Returned when waiting on a watcher is cancelled before it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("wait aborted")]
pub struct Aborted;

/// A one-shot change flag associated with a single computation attempt.
///
/// Once marked changed, a watcher stays changed forever. Change sources only hold weak
/// references to watchers, so dropping every `Watcher` handle is enough to detach it
/// from everything it was attached to.
///
/// Watchers can form a hierarchy: a child linked with [`Watcher::add_child`] propagates its
/// change to every parent that is still alive.
#[derive(Clone)]
pub struct Watcher(Arc<Inner>);

pub(crate) struct Inner {
    changed: AtomicBool,
    marker: Mutex<Option<String>>,
    notify: Notify,
    parents: Mutex<Vec<Weak<Inner>>>,
}

/// Non-owning handle to a watcher, as stored by change sources.
#[derive(Clone)]
pub(crate) struct WeakWatcher(Weak<Inner>);

impl WeakWatcher {
    pub fn upgrade(&self) -> Option<Watcher> { self.0.upgrade().map(Watcher) }

    /// True if the watcher is still alive and has not fired yet
    pub fn is_pending(&self) -> bool { self.0.upgrade().is_some_and(|inner| !inner.changed.load(Ordering::SeqCst)) }
}

impl Default for Watcher {
    fn default() -> Self { Self::new() }
}

impl Watcher {
    pub fn new() -> Self {
        Self(Arc::new(Inner {
            changed: AtomicBool::new(false),
            marker: Mutex::new(None),
            notify: Notify::new(),
            parents: Mutex::new(Vec::new()),
        }))
    }

    /// Create a watcher that fires as soon as any of the given children fires.
    /// If one of the children has already fired, the new watcher starts out changed.
    pub fn with_children<'a>(children: impl IntoIterator<Item = &'a Watcher>) -> Self {
        let watcher = Self::new();
        for child in children {
            watcher.add_child(child);
        }
        watcher
    }

    pub fn id(&self) -> WatcherId { WatcherId(Arc::as_ptr(&self.0) as usize) }

    pub fn is_changed(&self) -> bool { self.0.changed.load(Ordering::SeqCst) }

    /// The marker passed to the `mark_changed` call that fired this watcher, if any
    pub fn marker(&self) -> Option<String> { self.0.marker.lock().expect("marker lock poisoned").clone() }

    /// Flip the watcher to changed, wake every pending `changed()` future and propagate to parents.
    /// Calling this on a watcher that already fired is a no-op.
    pub fn mark_changed(&self, marker: Option<&str>) {
        if self.0.changed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(marker) = marker {
            *self.0.marker.lock().expect("marker lock poisoned") = Some(marker.to_owned());
        }
        tracing::trace!("watcher {} changed (marker: {:?})", self.id(), marker);
        self.0.notify.notify_waiters();

        // parents are released as we propagate; a fired watcher has nothing left to notify
        let parents = std::mem::take(&mut *self.0.parents.lock().expect("parents lock poisoned"));
        for parent in parents {
            if let Some(parent) = parent.upgrade() {
                Watcher(parent).mark_changed(marker);
            }
        }
    }

    /// Link `child` under this watcher so that a change of the child marks this watcher changed.
    /// The child only keeps a weak reference to the parent.
    pub fn add_child(&self, child: &Watcher) {
        if self.is_changed() || Arc::ptr_eq(&self.0, &child.0) {
            return;
        }
        if child.is_changed() {
            self.mark_changed(child.marker().as_deref());
            return;
        }
        child.0.parents.lock().expect("parents lock poisoned").push(Arc::downgrade(&self.0));
        // the child may have fired between the check above and the registration
        if child.is_changed() {
            self.mark_changed(child.marker().as_deref());
        }
    }

    /// Wait until the watcher is marked changed. Resolves immediately if it already is.
    pub async fn changed(&self, cancel: Option<&CancellationToken>) -> Result<(), Aborted> {
        loop {
            let notified = self.0.notify.notified();
            tokio::pin!(notified);
            // register before checking the flag so a concurrent mark_changed can't be missed
            notified.as_mut().enable();
            if self.is_changed() {
                return Ok(());
            }
            match cancel {
                Some(token) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = token.cancelled() => return Err(Aborted),
                    }
                }
                None => notified.await,
            }
        }
    }

    pub(crate) fn downgrade(&self) -> WeakWatcher { WeakWatcher(Arc::downgrade(&self.0)) }
}

impl std::fmt::Debug for Watcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watcher").field("id", &self.id()).field("changed", &self.is_changed()).field("marker", &self.marker()).finish()
    }
}

impl PartialEq for Watcher {
    fn eq(&self, other: &Self) -> bool { Arc::ptr_eq(&self.0, &other.0) }
}
impl Eq for Watcher {}
