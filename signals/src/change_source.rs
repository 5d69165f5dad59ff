use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;

use crate::watcher::{Watcher, WeakWatcher};

/// Number of attach operations between two housekeeping sweeps
pub const DEFAULT_RECHECK_PERIOD: usize = 17;

/// Fans out "something changed" to every watcher attached since the last change.
///
/// Only weak references are kept: a watcher dropped by its owner is pruned on the next
/// housekeeping sweep, which runs every `recheck_period` attachments.
pub struct ChangeSource {
    state: Mutex<SourceState>,
    recheck_period: usize,
}

struct SourceState {
    watchers: Vec<WeakWatcher>,
    modifications: usize,
}

impl Default for ChangeSource {
    fn default() -> Self { Self::new() }
}

impl ChangeSource {
    pub fn new() -> Self { Self::with_recheck_period(DEFAULT_RECHECK_PERIOD) }

    pub fn with_recheck_period(recheck_period: usize) -> Self {
        Self { state: Mutex::new(SourceState { watchers: Vec::new(), modifications: 0 }), recheck_period: recheck_period.max(1) }
    }

    /// Register interest of `watcher` in the next change. Already fired watchers are ignored.
    pub fn attach_watcher(&self, watcher: &Watcher) {
        if watcher.is_changed() {
            return;
        }
        let mut state = self.state.lock().expect("change source lock poisoned");
        state.watchers.push(watcher.downgrade());
        state.modifications += 1;
        if state.modifications % self.recheck_period == 0 {
            state.watchers.retain(WeakWatcher::is_pending);
        }
    }

    /// Mark every attached watcher changed and forget about them.
    pub fn mark_changed(&self, marker: Option<&str>) {
        let watchers = std::mem::take(&mut self.state.lock().expect("change source lock poisoned").watchers);
        // watchers are fired outside the lock, their parents may attach elsewhere
        fire(watchers, marker);
    }

    /// Number of registered watcher slots, including not yet swept dead ones
    pub fn watcher_count(&self) -> usize { self.state.lock().expect("change source lock poisoned").watchers.len() }
}

impl std::fmt::Debug for ChangeSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeSource").field("watchers", &self.watcher_count()).finish()
    }
}

/// A change source shared by many logical entities addressed by key.
pub struct KeyedChangeSource<K> {
    state: Mutex<KeyedState<K>>,
    recheck_period: usize,
}

struct KeyedState<K> {
    groups: HashMap<K, Vec<WeakWatcher>>,
    modifications: usize,
}

impl<K: Hash + Eq + Clone> Default for KeyedChangeSource<K> {
    fn default() -> Self { Self::new() }
}

impl<K: Hash + Eq + Clone> KeyedChangeSource<K> {
    pub fn new() -> Self { Self::with_recheck_period(DEFAULT_RECHECK_PERIOD) }

    pub fn with_recheck_period(recheck_period: usize) -> Self {
        Self { state: Mutex::new(KeyedState { groups: HashMap::new(), modifications: 0 }), recheck_period: recheck_period.max(1) }
    }

    pub fn attach_watcher(&self, key: &K, watcher: &Watcher) {
        if watcher.is_changed() {
            return;
        }
        let mut state = self.state.lock().expect("keyed change source lock poisoned");
        state.groups.entry(key.clone()).or_default().push(watcher.downgrade());
        state.modifications += 1;
        if state.modifications % self.recheck_period == 0 {
            state.groups.retain(|_, watchers| {
                watchers.retain(WeakWatcher::is_pending);
                !watchers.is_empty()
            });
        }
    }

    /// Fire and clear the watchers of a single key. Unknown keys are a no-op.
    pub fn mark_changed(&self, key: &K, marker: Option<&str>) {
        let watchers = self.state.lock().expect("keyed change source lock poisoned").groups.remove(key);
        if let Some(watchers) = watchers {
            fire(watchers, marker);
        }
    }

    /// Fire and clear the watchers of every key, e.g. after a full resync.
    pub fn mark_all_changed(&self, marker: Option<&str>) {
        let groups = std::mem::take(&mut self.state.lock().expect("keyed change source lock poisoned").groups);
        for (_, watchers) in groups {
            fire(watchers, marker);
        }
    }

    /// Number of registered watcher slots for `key`, including not yet swept dead ones
    pub fn watcher_count(&self, key: &K) -> usize {
        self.state.lock().expect("keyed change source lock poisoned").groups.get(key).map_or(0, Vec::len)
    }

    pub fn key_count(&self) -> usize { self.state.lock().expect("keyed change source lock poisoned").groups.len() }
}

impl<K> std::fmt::Debug for KeyedChangeSource<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let keys = self.state.lock().expect("keyed change source lock poisoned").groups.len();
        f.debug_struct("KeyedChangeSource").field("keys", &keys).finish()
    }
}

fn fire(watchers: Vec<WeakWatcher>, marker: Option<&str>) {
    if watchers.is_empty() {
        return;
    }
    tracing::trace!("firing {} watchers (marker: {:?})", watchers.len(), marker);
    for watcher in watchers {
        if let Some(watcher) = watcher.upgrade() {
            watcher.mark_changed(marker);
        }
    }
}
