use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex, MutexGuard, PoisonError,
};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::ctx::ComputableCtx;
use super::hooks::{CellId, HookSet};
use super::state::{CellState, ComputableValue, ContextStore, Snapshot, ValueOrError, ValueTag};
use crate::config::DEFAULT_STABILIZE_BACKOFF;
use crate::error::ComputableError;
use computable_signals::Watcher;

static EPHEMERAL_KEYS: AtomicU64 = AtomicU64::new(1);

type Evaluate<T> = dyn Fn(&ComputableCtx) -> anyhow::Result<T> + Send + Sync;
type Recover<T> = dyn Fn(&ComputableError) -> anyhow::Result<T> + Send + Sync;

/// Which states [`Computable::get_rendered_value`] exposes a value for
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RenderingMode {
    /// Every state, stable or not
    #[default]
    Live,
    /// Only stable states; nothing while unstable
    StableOnlyLive,
    /// Only stable states; while unstable the last stable value is kept
    StableOnlyRetentive,
}

#[derive(Debug, Clone, Default)]
pub struct ComputableOptions {
    /// Stable identity used in logs and errors. An ephemeral key is generated when absent.
    pub key: Option<String>,
    /// Forget the last good value (see [`Computable::peek`]) when an evaluation fails
    pub reset_value_on_error: bool,
    pub mode: RenderingMode,
}

impl ComputableOptions {
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_reset_value_on_error(mut self, reset: bool) -> Self {
        self.reset_value_on_error = reset;
        self
    }

    pub fn with_mode(mut self, mode: RenderingMode) -> Self {
        self.mode = mode;
        self
    }
}

/// Options of the stabilization loop
#[derive(Debug, Clone)]
pub struct StabilizeOptions {
    pub timeout: Option<Duration>,
    pub cancel: Option<CancellationToken>,
    /// Delay before an unstable value is evaluated again if nothing fires in the meantime
    pub backoff: Duration,
}

impl Default for StabilizeOptions {
    fn default() -> Self { Self { timeout: None, cancel: None, backoff: DEFAULT_STABILIZE_BACKOFF } }
}

impl StabilizeOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }
}

/// Result of a stabilization
#[derive(Debug, Clone, PartialEq)]
pub struct StableValue<T> {
    pub value: T,
    pub tag: ValueTag,
    /// True if at least one intermediate evaluation was unstable
    pub unstable_observed: bool,
}

/// A lazily evaluated, memoized value.
///
/// The evaluation function runs on demand and attaches the evaluation's watcher to whatever it
/// reads. The result is reused until that watcher fires; the next read then evaluates again.
/// Concurrent readers share a single evaluation.
///
/// Clones share the same cell.
pub struct Computable<T>(Arc<Cell<T>>);

struct Cell<T> {
    id: CellId,
    key: String,
    evaluate: Box<Evaluate<T>>,
    recover: Option<Box<Recover<T>>>,
    reset_value_on_error: bool,
    mode: RenderingMode,
    /// Held for the whole evaluation; readers that find a stale state queue up here
    evaluation: Mutex<()>,
    slot: Mutex<Slot<T>>,
}

struct Slot<T> {
    /// Bumped by `reset_state` so that results of in-flight evaluations are discarded
    epoch: u64,
    state: Option<CellState<T>>,
    last_value: Option<T>,
    last_stable_value: Option<T>,
    /// Handed to each evaluation and taken back when its state is committed
    store: ContextStore,
}

impl<T> Clone for Computable<T> {
    fn clone(&self) -> Self { Self(self.0.clone()) }
}

impl<T: Clone + Send + Sync + 'static> Computable<T> {
    pub fn make(evaluate: impl Fn(&ComputableCtx) -> anyhow::Result<T> + Send + Sync + 'static) -> Self {
        Self::make_with(evaluate, ComputableOptions::default())
    }

    pub fn make_with(evaluate: impl Fn(&ComputableCtx) -> anyhow::Result<T> + Send + Sync + 'static, options: ComputableOptions) -> Self {
        Self::build(Box::new(evaluate), None, options)
    }

    /// Like [`Computable::make_with`], but a failed evaluation is handed to `recover`, whose
    /// value becomes the value of the state. A failing `recover` leaves the state failed.
    pub fn make_with_recover(
        evaluate: impl Fn(&ComputableCtx) -> anyhow::Result<T> + Send + Sync + 'static,
        recover: impl Fn(&ComputableError) -> anyhow::Result<T> + Send + Sync + 'static,
        options: ComputableOptions,
    ) -> Self {
        Self::build(Box::new(evaluate), Some(Box::new(recover)), options)
    }

    fn build(evaluate: Box<Evaluate<T>>, recover: Option<Box<Recover<T>>>, options: ComputableOptions) -> Self {
        let key = options.key.unwrap_or_else(|| format!("__ephkey_{}", EPHEMERAL_KEYS.fetch_add(1, Ordering::Relaxed)));
        Self(Arc::new(Cell {
            id: CellId::next(),
            key,
            evaluate,
            recover,
            reset_value_on_error: options.reset_value_on_error,
            mode: options.mode,
            evaluation: Mutex::new(()),
            slot: Mutex::new(Slot { epoch: 0, state: None, last_value: None, last_stable_value: None, store: ContextStore::new() }),
        }))
    }

    /// A cell that never fails: the value of this cell, or its error as a message
    pub fn wrap_error(&self) -> Computable<ValueOrError<T>> {
        let wrapped = self.clone();
        Computable::make_with_recover(
            move |ctx| Ok(ValueOrError::Value(ctx.read(&wrapped)?)),
            |err| {
                Ok(ValueOrError::Error(match err {
                    ComputableError::Evaluation { cause, .. } => format!("{cause:#}"),
                    other => other.to_string(),
                }))
            },
            ComputableOptions::default().with_key(format!("{}:wrap_error", self.0.key)),
        )
    }

    pub fn id(&self) -> CellId { self.0.id }

    pub fn key(&self) -> &str { &self.0.key }

    fn slot(&self) -> MutexGuard<'_, Slot<T>> { self.0.slot.lock().expect("computable slot lock poisoned") }

    /// The current state, unless its watcher fired or it is the state tagged `stale`
    fn fresh_snapshot(slot: &Slot<T>, stale: Option<&ValueTag>) -> Option<Snapshot<T>> {
        slot.state.as_ref().filter(|state| !state.watcher.is_changed() && stale != Some(&state.tag)).map(CellState::snapshot)
    }

    /// Current state, evaluating first if there is none or its watcher fired.
    /// Only fails with [`ComputableError::StateReset`]; evaluation errors live in the snapshot.
    fn snapshot_excluding(&self, stale: Option<&ValueTag>) -> Result<Snapshot<T>, ComputableError> {
        if let Some(snapshot) = Self::fresh_snapshot(&self.slot(), stale) {
            return Ok(snapshot);
        }

        // a panicking evaluation leaves nothing behind that needs protecting
        let _evaluation = self.0.evaluation.lock().unwrap_or_else(PoisonError::into_inner);
        let (epoch, store) = {
            let mut slot = self.slot();
            // somebody else may have evaluated while we were queued
            if let Some(snapshot) = Self::fresh_snapshot(&slot, stale) {
                return Ok(snapshot);
            }
            (slot.epoch, std::mem::take(&mut slot.store))
        };

        let watcher = Watcher::new();
        let ctx = ComputableCtx::new(&self.0.key, watcher.clone(), store);
        tracing::trace!("{} → evaluating", self.0.key);
        let result = (self.0.evaluate)(&ctx);
        let outcome = ctx.finish();

        let result = match result {
            Ok(value) => Ok(value),
            Err(err) => self.recover(ComputableError::evaluation(&self.0.key, err)),
        };
        let state = CellState::new(result, watcher, !outcome.unstable, outcome.unstable_marker, outcome.hooks, outcome.on_destroy);
        let snapshot = state.snapshot();

        let mut slot = self.slot();
        if slot.epoch != epoch {
            drop(slot);
            // dropping the state runs the destroy callbacks registered by this evaluation
            drop(state);
            return Err(ComputableError::StateReset { key: self.0.key.clone() });
        }
        slot.store = outcome.store;
        match &state.outcome {
            Ok(value) => {
                slot.last_value = Some(value.clone());
                if snapshot.stable {
                    slot.last_stable_value = Some(value.clone());
                }
            }
            Err(_) if self.0.reset_value_on_error => {
                slot.last_value = None;
                slot.last_stable_value = None;
            }
            Err(_) => {}
        }
        let previous = slot.state.replace(state);
        drop(slot);
        drop(previous);
        Ok(snapshot)
    }

    fn recover(&self, err: ComputableError) -> Result<T, ComputableError> {
        let Some(recover) = &self.0.recover else {
            crate::action_debug!(self.0.key, "evaluation failed", "{}", err);
            return Err(err);
        };
        match recover(&err) {
            Ok(value) => {
                crate::action_debug!(self.0.key, "recovered", "{}", err);
                Ok(value)
            }
            Err(cause) => {
                let err = ComputableError::evaluation(&self.0.key, cause.context(format!("recovery failed after: {err}")));
                crate::action_debug!(self.0.key, "evaluation failed", "{}", err);
                Err(err)
            }
        }
    }

    /// Snapshot read that is reported to the hooks of the state it returns
    pub(crate) fn observed_snapshot(&self) -> Result<Snapshot<T>, ComputableError> { self.observed_snapshot_excluding(None) }

    fn observed_snapshot_excluding(&self, stale: Option<&ValueTag>) -> Result<Snapshot<T>, ComputableError> {
        let snapshot = self.snapshot_excluding(stale)?;
        snapshot.hooks.for_each(|hooks| hooks.on_get_value(self.0.id));
        Ok(snapshot)
    }

    /// Read the current value, evaluating only if an input changed since the last evaluation.
    /// Never waits for anything but a concurrent evaluation of the same cell.
    pub fn get_full_value(&self) -> Result<ComputableValue<T>, ComputableError> { self.observed_snapshot()?.into_value() }

    pub fn get_value(&self) -> Result<T, ComputableError> { self.get_full_value().map(|value| value.value) }

    /// The last successfully computed value, without evaluating anything
    pub fn peek(&self) -> Option<T> { self.slot().last_value.clone() }

    /// Read the current value as the cell's [`RenderingMode`] presents it: `None` while the state
    /// is unstable in [`RenderingMode::StableOnlyLive`], the last stable value (if any) in
    /// [`RenderingMode::StableOnlyRetentive`]. Errors are returned as by
    /// [`Computable::get_value`].
    pub fn get_rendered_value(&self) -> Result<Option<T>, ComputableError> {
        let snapshot = self.observed_snapshot()?;
        let value = snapshot.outcome?;
        Ok(match self.0.mode {
            RenderingMode::Live => Some(value),
            _ if snapshot.stable => Some(value),
            RenderingMode::StableOnlyLive => None,
            RenderingMode::StableOnlyRetentive => self.slot().last_stable_value.clone(),
        })
    }

    fn current_hooks(&self) -> HookSet { self.slot().state.as_ref().map(|state| state.hooks.clone()).unwrap_or_default() }

    fn changed_since(&self, tag: Option<&ValueTag>) -> bool {
        match &self.slot().state {
            None => true,
            Some(state) => state.watcher.is_changed() || tag.is_some_and(|tag| *tag != state.tag),
        }
    }

    /// True if the next read would evaluate again. With a tag, also true if the current
    /// state is not the one the tag was taken from.
    pub fn is_changed(&self, tag: Option<&ValueTag>) -> bool {
        self.current_hooks().for_each(|hooks| hooks.on_changed_request(self.0.id));
        self.changed_since(tag)
    }

    /// Ask every data source the last evaluation relied on to catch up with the remote state.
    /// Once this resolves, the next read reflects everything written before the call.
    pub async fn refresh_state(&self) -> Result<(), ComputableError> {
        let hooks = self.current_hooks();
        if hooks.is_empty() {
            return Ok(());
        }
        let results = futures::future::join_all(hooks.iter().map(|hooks| hooks.refresh_state(self.0.id))).await;
        results.into_iter().collect::<anyhow::Result<Vec<()>>>().map_err(|err| ComputableError::evaluation(&self.0.key, err))?;
        Ok(())
    }

    /// Wait until the current state becomes stale. Resolves right away if it already is.
    /// While waiting, the hooks of the current state see this cell as listened to.
    pub async fn await_change(&self, cancel: Option<&CancellationToken>, tag: Option<&ValueTag>) -> Result<(), ComputableError> {
        let (watcher, hooks) = {
            let slot = self.slot();
            match &slot.state {
                Some(state) if !state.watcher.is_changed() && tag.map_or(true, |tag| *tag == state.tag) => {
                    (Some(state.watcher.clone()), state.hooks.clone())
                }
                state => (None, state.as_ref().map(|state| state.hooks.clone()).unwrap_or_default()),
            }
        };

        let Some(watcher) = watcher else {
            hooks.for_each(|hooks| hooks.on_changed_request(self.0.id));
            tokio::task::yield_now().await;
            return match cancel {
                Some(token) if token.is_cancelled() => Err(ComputableError::Aborted { key: self.0.key.clone() }),
                _ => Ok(()),
            };
        };

        let _listening = ListenGuard::start(self.0.id, hooks);
        watcher.changed(cancel).await.map_err(|_| ComputableError::Aborted { key: self.0.key.clone() })
    }

    /// Evaluate until a stable value is produced: one whose evaluation did not mark itself unstable
    /// and whose inputs did not change while it ran. Evaluation errors are returned immediately,
    /// unless the failed state is already outdated.
    pub async fn await_stable(&self, options: StabilizeOptions) -> Result<StableValue<T>, ComputableError> {
        let started = Instant::now();
        let deadline = options.timeout.map(|timeout| started + timeout);
        let mut unstable_observed = false;
        let mut last_marker: Option<String> = None;
        // an unstable state is evaluated again after the backoff even if nothing fired
        let mut stale: Option<ValueTag> = None;

        loop {
            if options.cancel.as_ref().is_some_and(CancellationToken::is_cancelled) {
                return Err(ComputableError::Aborted { key: self.0.key.clone() });
            }

            let tag = match self.observed_snapshot_excluding(stale.as_ref()) {
                Ok(snapshot) => {
                    let outdated = snapshot.watcher.is_changed();
                    match snapshot.outcome {
                        // an error of a state that is already outdated is evaluated again
                        Err(err) if !outdated => return Err(err),
                        Ok(value) if snapshot.stable && !outdated => {
                            return Ok(StableValue { value, tag: snapshot.tag, unstable_observed });
                        }
                        _ => {}
                    }
                    if snapshot.unstable_marker.is_some() {
                        last_marker = snapshot.unstable_marker;
                    }
                    Some(snapshot.tag)
                }
                Err(ComputableError::StateReset { .. }) => None,
                Err(err) => return Err(err),
            };
            unstable_observed = true;
            stale = tag;
            tracing::trace!("{} → unstable ({:?}), waiting", self.0.key, last_marker);

            let wait = async {
                match tag {
                    Some(tag) => tokio::select! {
                        result = self.await_change(options.cancel.as_ref(), Some(&tag)) => result,
                        _ = tokio::time::sleep(options.backoff) => Ok(()),
                    },
                    None => {
                        tokio::time::sleep(options.backoff).await;
                        Ok(())
                    }
                }
            };
            match deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, wait).await {
                    Ok(result) => result?,
                    Err(_) => {
                        return Err(ComputableError::Timeout { key: self.0.key.clone(), elapsed: started.elapsed(), marker: last_marker });
                    }
                },
                None => wait.await?,
            }
        }
    }

    /// Stabilize with the default backoff and an optional timeout, returning only the value
    pub async fn await_stable_value(&self, timeout: Option<Duration>) -> Result<T, ComputableError> {
        let options = StabilizeOptions { timeout, ..Default::default() };
        Ok(self.await_stable(options).await?.value)
    }

    pub async fn await_stable_full_value(&self, cancel: Option<CancellationToken>) -> Result<StableValue<T>, ComputableError> {
        self.await_stable(StabilizeOptions { cancel, ..Default::default() }).await
    }

    /// Drop the current state and the values stored through the context, running the state's
    /// destroy callbacks. An evaluation in flight when this is called has its result discarded.
    pub fn reset_state(&self) {
        let (previous, _store) = {
            let mut slot = self.slot();
            slot.epoch += 1;
            slot.last_value = None;
            slot.last_stable_value = None;
            (slot.state.take(), std::mem::take(&mut slot.store))
        };
        if previous.is_some() {
            crate::action_debug!(self.0.key, "reset");
        }
        drop(previous);
    }
}

impl<T> std::fmt::Debug for Computable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Computable").field("id", &self.0.id).field("key", &self.0.key).finish()
    }
}

/// Reports listen start on creation and listen stop on drop, so a cancelled wait is balanced too
struct ListenGuard {
    cell: CellId,
    hooks: HookSet,
}

impl ListenGuard {
    fn start(cell: CellId, hooks: HookSet) -> Self {
        hooks.for_each(|hooks| hooks.on_listen_start(cell));
        Self { cell, hooks }
    }
}

impl Drop for ListenGuard {
    fn drop(&mut self) { self.hooks.for_each(|hooks| hooks.on_listen_stop(self.cell)); }
}
