use std::sync::{
    atomic::{AtomicU64, Ordering},
    Mutex,
};

use async_trait::async_trait;

use super::memory::{MemoryTree, TreeSnapshot};
use crate::poll::PollActor;
use computable_signals::ChangeSource;

/// Where a [`TreePoller`] gets the remote tree from
#[async_trait]
pub trait TreeSource: Send + Sync + 'static {
    async fn fetch(&self) -> anyhow::Result<TreeSnapshot>;
}

/// Keeps a [`MemoryTree`] in sync with a [`TreeSource`] when registered with a
/// [`PollPool`](crate::poll::PollPool).
pub struct TreePoller<S> {
    source: S,
    tree: MemoryTree,
    pause: Mutex<Option<u64>>,
    pause_change: ChangeSource,
    next_token: AtomicU64,
}

impl<S: TreeSource> TreePoller<S> {
    pub fn new(source: S, tree: MemoryTree) -> Self {
        Self { source, tree, pause: Mutex::new(None), pause_change: ChangeSource::new(), next_token: AtomicU64::new(1) }
    }

    pub fn tree(&self) -> &MemoryTree { &self.tree }

    /// Stop fetching after the poll that is currently running, if any
    pub fn pause(&self) {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        *self.pause.lock().expect("tree poller lock poisoned") = Some(token);
        self.pause_change.mark_changed(Some("pause"));
    }

    pub fn resume(&self) {
        *self.pause.lock().expect("tree poller lock poisoned") = None;
        self.pause_change.mark_changed(Some("resume"));
    }

    pub fn is_paused(&self) -> bool { self.pause.lock().expect("tree poller lock poisoned").is_some() }
}

#[async_trait]
impl<S: TreeSource> PollActor for TreePoller<S> {
    async fn poll(&self) -> anyhow::Result<()> {
        let snapshot = self.source.fetch().await?;
        self.tree.apply(snapshot);
        Ok(())
    }

    fn pause_request(&self) -> Option<u64> { *self.pause.lock().expect("tree poller lock poisoned") }

    fn pause_request_change(&self) -> &ChangeSource { &self.pause_change }

    fn on_pool_terminated(&self) { crate::action_debug!("tree poller", "stopped", "{} nodes", self.tree.len()); }
}
