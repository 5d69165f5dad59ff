use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex, Weak,
};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::DEFAULT_POLL_MIN_DELAY;
use computable_signals::{ChangeSource, Watcher};

#[derive(Debug, Clone)]
pub struct PollPoolOptions {
    /// Minimal delay between the starts of two polling cycles
    pub min_delay: Duration,
}

impl Default for PollPoolOptions {
    fn default() -> Self { Self { min_delay: DEFAULT_POLL_MIN_DELAY } }
}

/// Something a [`PollPool`] calls periodically.
#[async_trait]
pub trait PollActor: Send + Sync + 'static {
    /// Do one round of work. Errors are logged by the pool and do not stop polling.
    async fn poll(&self) -> anyhow::Result<()>;

    /// `None` asks to be polled on every cycle. A `Some` token pauses the actor for as long as
    /// it stays the same; switching to a new token guarantees one more poll.
    fn pause_request(&self) -> Option<u64>;

    /// Must fire whenever [`PollActor::pause_request`] changes
    fn pause_request_change(&self) -> &ChangeSource;

    /// Called once after the pool stopped
    fn on_pool_terminated(&self) {}
}

/// Registry key of an actor
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ActorKey {
    Named(String),
    Anonymous(u64),
}

/// A single polling loop shared by many actors.
///
/// Actors are held weakly: dropping the last strong reference to an actor removes it from the
/// pool. When every actor is paused the loop sleeps until one of them changes its pause request
/// or a new actor is added.
///
/// Must be created within a tokio runtime.
pub struct PollPool<A: PollActor> {
    shared: Arc<PollShared<A>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

struct PollShared<A> {
    actors: Mutex<HashMap<ActorKey, Weak<A>>>,
    /// Bumped on every registration, so the loop can tell it missed one
    generation: AtomicU64,
    actors_change: ChangeSource,
    terminate: CancellationToken,
    next_anonymous: AtomicU64,
    options: PollPoolOptions,
}

impl<A: PollActor> PollPool<A> {
    pub fn new(options: PollPoolOptions) -> Self {
        let shared = Arc::new(PollShared {
            actors: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
            actors_change: ChangeSource::new(),
            terminate: CancellationToken::new(),
            next_anonymous: AtomicU64::new(1),
            options,
        });
        let handle = tokio::spawn(run(shared.clone()));
        Self { shared, handle: Mutex::new(Some(handle)) }
    }

    /// The live actor registered under `key`, or a new one built by `factory`
    pub fn create_if_absent(&self, key: impl Into<String>, factory: impl FnOnce() -> A) -> Arc<A> {
        let key = ActorKey::Named(key.into());
        let mut actors = self.shared.actors.lock().expect("poll pool lock poisoned");
        if let Some(actor) = actors.get(&key).and_then(Weak::upgrade) {
            return actor;
        }
        let actor = Arc::new(factory());
        actors.insert(key, Arc::downgrade(&actor));
        drop(actors);
        self.registered();
        actor
    }

    pub fn add(&self, actor: &Arc<A>) -> ActorKey {
        let key = ActorKey::Anonymous(self.shared.next_anonymous.fetch_add(1, Ordering::Relaxed));
        self.shared.actors.lock().expect("poll pool lock poisoned").insert(key.clone(), Arc::downgrade(actor));
        self.registered();
        key
    }

    pub fn remove(&self, key: &ActorKey) -> bool { self.shared.actors.lock().expect("poll pool lock poisoned").remove(key).is_some() }

    /// Number of registered actors that are still alive
    pub fn len(&self) -> usize {
        self.shared.actors.lock().expect("poll pool lock poisoned").values().filter(|actor| actor.strong_count() > 0).count()
    }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn is_terminated(&self) -> bool { self.shared.terminate.is_cancelled() }

    /// Stop the loop and wait for it to finish the current cycle
    pub async fn terminate(&self) {
        crate::action_info!("poll pool", "terminate", "{} actors", self.len());
        self.shared.terminate.cancel();
        let handle = self.handle.lock().expect("poll pool lock poisoned").take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                tracing::warn!("poll loop ended abnormally: {err}");
            }
        }
    }

    fn registered(&self) {
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        self.shared.actors_change.mark_changed(Some("actor added"));
    }
}

impl<A: PollActor> Drop for PollPool<A> {
    fn drop(&mut self) { self.shared.terminate.cancel(); }
}

async fn run<A: PollActor>(shared: Arc<PollShared<A>>) {
    crate::action_debug!("poll pool", "started", "min delay {:?}", shared.options.min_delay);
    // pause request observed for each actor on the previous cycle
    let mut last_seen: HashMap<ActorKey, (Weak<A>, Option<u64>)> = HashMap::new();

    while !shared.terminate.is_cancelled() {
        let generation = shared.generation.load(Ordering::SeqCst);
        let registered: Vec<(ActorKey, Weak<A>)> = {
            let mut actors = shared.actors.lock().expect("poll pool lock poisoned");
            actors.retain(|_, actor| actor.strong_count() > 0);
            actors.iter().map(|(key, actor)| (key.clone(), actor.clone())).collect()
        };

        let mut active = Vec::new();
        let mut live = Vec::new();
        let mut seen = HashMap::with_capacity(registered.len());
        for (key, weak) in registered {
            let Some(actor) = weak.upgrade() else {
                continue;
            };
            let pause = actor.pause_request();
            // a new incarnation under an old key starts with a clean slate
            let previous = last_seen.remove(&key).filter(|(previous, _)| previous.ptr_eq(&weak)).map(|(_, pause)| pause);
            if pause.is_none() || previous != Some(pause) {
                active.push(actor.clone());
            }
            live.push((actor, pause));
            seen.insert(key, (weak, pause));
        }
        last_seen = seen;

        if active.is_empty() {
            let watcher = Watcher::new();
            shared.actors_change.attach_watcher(&watcher);
            for (actor, _) in &live {
                actor.pause_request_change().attach_watcher(&watcher);
            }
            // anything that changed before the watcher was attached would otherwise be missed
            let missed = shared.generation.load(Ordering::SeqCst) != generation
                || live.iter().any(|(actor, pause)| actor.pause_request() != *pause);
            drop(live);
            if !missed {
                let _ = watcher.changed(Some(&shared.terminate)).await;
            }
            continue;
        }
        drop(live);

        let begin = Instant::now();
        for actor in &active {
            if let Err(err) = actor.poll().await {
                crate::action_warn!("poll pool", "actor failed", "{:#}", err);
            }
        }
        drop(active);

        let delay = shared.options.min_delay.saturating_sub(begin.elapsed());
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shared.terminate.cancelled() => {}
        }
    }

    let actors: Vec<Weak<A>> = shared.actors.lock().expect("poll pool lock poisoned").values().cloned().collect();
    for actor in actors.iter().filter_map(Weak::upgrade) {
        actor.on_pool_terminated();
    }
    crate::action_debug!("poll pool", "terminated");
}
