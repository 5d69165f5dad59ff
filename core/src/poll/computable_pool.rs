use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex,
};

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::sync::oneshot;

use super::pool::{PollActor, PollPool, PollPoolOptions};
use crate::computable::{CellId, Computable, ComputableHooks, ComputableOptions};
use computable_signals::ChangeSource;

/// A remote value that can only be observed by asking for it again.
#[async_trait]
pub trait PollSource: Send + Sync + 'static {
    type Request: Send + Sync + 'static;
    type Value: Clone + Send + Sync + 'static;

    /// Requests with the same key share one polled entry
    fn key(&self, request: &Self::Request) -> String;

    async fn read_value(&self, request: &Self::Request) -> anyhow::Result<Self::Value>;

    /// Decides whether a freshly read value invalidates the cells built on the old one
    fn values_equal(&self, old: &Self::Value, new: &Self::Value) -> bool;
}

type RefreshWaiter = oneshot::Sender<Result<(), Arc<anyhow::Error>>>;

/// Translates how cells are consumed into a pause request for the poll loop.
///
/// Polling runs while at least one cell is listened to or a refresh is pending. Otherwise the
/// entry is paused, and every read while paused hands out a fresh pause token, which buys
/// exactly one more poll.
struct PauseAdapter {
    state: Mutex<PauseState>,
    change: ChangeSource,
    next_token: AtomicU64,
}

struct PauseState {
    pause_request: Option<u64>,
    /// Open listens per cell
    listening: HashMap<CellId, usize>,
    refresh_waiters: Vec<RefreshWaiter>,
}

impl PauseAdapter {
    fn new() -> Self {
        Self {
            state: Mutex::new(PauseState { pause_request: Some(0), listening: HashMap::new(), refresh_waiters: Vec::new() }),
            change: ChangeSource::new(),
            next_token: AtomicU64::new(1),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, PauseState> { self.state.lock().expect("pause adapter lock poisoned") }

    fn pause_request(&self) -> Option<u64> { self.state().pause_request }

    /// Apply `update` and notify the poll loop if the pause request moved
    fn update(&self, update: impl FnOnce(&mut PauseState)) {
        let changed = {
            let mut state = self.state();
            let before = state.pause_request;
            update(&mut state);
            if state.listening.is_empty() && state.refresh_waiters.is_empty() {
                state.pause_request = Some(self.next_token.fetch_add(1, Ordering::Relaxed));
            } else {
                state.pause_request = None;
            }
            before != state.pause_request
        };
        if changed {
            self.change.mark_changed(None);
        }
    }

    /// Waiters served by the poll that is about to start
    fn take_refresh_waiters(&self) -> Vec<RefreshWaiter> {
        let waiters = std::mem::take(&mut self.state().refresh_waiters);
        if !waiters.is_empty() {
            self.update(|_| {});
        }
        waiters
    }
}

#[async_trait]
impl ComputableHooks for PauseAdapter {
    fn on_changed_request(&self, _cell: CellId) { self.update(|_| {}); }

    fn on_get_value(&self, _cell: CellId) { self.update(|_| {}); }

    fn on_listen_start(&self, cell: CellId) {
        self.update(|state| *state.listening.entry(cell).or_default() += 1);
    }

    fn on_listen_stop(&self, cell: CellId) {
        self.update(|state| {
            if let Some(count) = state.listening.get_mut(&cell) {
                *count -= 1;
                if *count == 0 {
                    state.listening.remove(&cell);
                }
            }
        });
    }

    async fn refresh_state(&self, _cell: CellId) -> anyhow::Result<()> {
        let (tx, rx) = oneshot::channel();
        self.update(|state| state.refresh_waiters.push(tx));
        match rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(anyhow!("refresh failed: {err:#}")),
            Err(_) => Err(anyhow!("polling stopped before the refresh completed")),
        }
    }
}

struct EntryValue<V> {
    value: Option<V>,
    error: Option<Arc<anyhow::Error>>,
}

/// One polled request, shared by every cell created for the same key
pub struct PollEntry<S: PollSource> {
    source: Arc<S>,
    request: S::Request,
    key: String,
    hooks: Arc<PauseAdapter>,
    value: Mutex<EntryValue<S::Value>>,
    change: ChangeSource,
}

impl<S: PollSource> PollEntry<S> {
    fn new(source: Arc<S>, request: S::Request, key: String) -> Self {
        Self {
            source,
            request,
            key,
            hooks: Arc::new(PauseAdapter::new()),
            value: Mutex::new(EntryValue { value: None, error: None }),
            change: ChangeSource::new(),
        }
    }

    fn fail(&self, err: Arc<anyhow::Error>) {
        {
            let mut current = self.value.lock().expect("poll entry lock poisoned");
            current.value = None;
            current.error = Some(err);
        }
        self.change.mark_changed(Some(&format!("error:{}", self.key)));
    }
}

#[async_trait]
impl<S: PollSource> PollActor for PollEntry<S> {
    async fn poll(&self) -> anyhow::Result<()> {
        let waiters = self.hooks.take_refresh_waiters();
        match self.source.read_value(&self.request).await {
            Ok(value) => {
                let changed = {
                    let mut current = self.value.lock().expect("poll entry lock poisoned");
                    let changed = current.error.is_some()
                        || current.value.as_ref().map_or(true, |old| !self.source.values_equal(old, &value));
                    if changed {
                        current.value = Some(value);
                        current.error = None;
                    }
                    changed
                };
                if changed {
                    tracing::trace!("{} → new value", self.key);
                    self.change.mark_changed(None);
                }
                for waiter in waiters {
                    let _ = waiter.send(Ok(()));
                }
                Ok(())
            }
            Err(err) => {
                let err = Arc::new(err);
                self.fail(err.clone());
                for waiter in waiters {
                    let _ = waiter.send(Err(err.clone()));
                }
                Err(anyhow!("{}: {err:#}", self.key))
            }
        }
    }

    fn pause_request(&self) -> Option<u64> { self.hooks.pause_request() }

    fn pause_request_change(&self) -> &ChangeSource { &self.hooks.change }

    fn on_pool_terminated(&self) {
        // pending refreshes see their sender dropped
        drop(self.hooks.take_refresh_waiters());
        self.fail(Arc::new(anyhow!("polling pool terminated")));
    }
}

/// Turns periodically polled values into computable cells.
///
/// Each distinct request key is polled by a single entry, however many cells are built on it.
/// Polling is paused while nobody listens to those cells.
pub struct PollComputablePool<S: PollSource> {
    source: Arc<S>,
    pool: PollPool<PollEntry<S>>,
}

impl<S: PollSource> PollComputablePool<S> {
    pub fn new(source: S, options: PollPoolOptions) -> Self { Self { source: Arc::new(source), pool: PollPool::new(options) } }

    /// A cell over the polled value of `request`. It holds `None`, marked unstable, until the
    /// first poll completes.
    pub fn get(&self, request: S::Request) -> Computable<Option<S::Value>> {
        let key = self.source.key(&request);
        let source = self.source.clone();
        let entry = self.pool.create_if_absent(key.clone(), {
            let key = key.clone();
            move || PollEntry::new(source, request, key)
        });

        Computable::make_with(
            move |ctx| {
                ctx.attach_hooks(entry.hooks.clone());
                entry.change.attach_watcher(ctx.watcher());
                let current = entry.value.lock().expect("poll entry lock poisoned");
                if let Some(err) = &current.error {
                    return Err(anyhow!("{err:#}"));
                }
                if current.value.is_none() {
                    ctx.mark_unstable(Some(&format!("not_polled:{}", entry.key)));
                }
                Ok(current.value.clone())
            },
            ComputableOptions::default().with_key(format!("poll:{key}")),
        )
    }

    /// Number of live polled entries
    pub fn len(&self) -> usize { self.pool.len() }

    pub fn is_empty(&self) -> bool { self.pool.is_empty() }

    pub async fn terminate(&self) { self.pool.terminate().await; }
}
