//! The store: wires reducers, middleware, effects and selectors together.
//!
//! Writes are serialized by one mutex around the core reduce-and-publish
//! step. The published snapshot lives in an `ArcSwap`, so readers never
//! take that lock. Middleware composes outside it, which keeps re-entrant
//! dispatches (error middleware, effects, timers) deadlock-free.

use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use arc_swap::ArcSwap;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

use crate::action::{
    create_action, Action, ActionCreator, ActionPool, INIT_STORE, UPDATE_REDUCER,
};
use crate::config::StoreConfig;
use crate::effects::{EffectsManager, EffectsModule};
use crate::error::{ErrorReport, StoreError, StoreResult};
use crate::middleware::{Chain, Dispatch, Dispatched, Middleware};
use crate::reducer::{Reducer, ReducerManager};
use crate::selector::Selector;
use crate::state::State;

/// One committed transition, as broadcast to state subscribers.
#[derive(Debug, Clone)]
pub struct StateChange {
    pub action: Action,
    pub previous: State,
    pub current: State,
}

const RUNNING: u8 = 0;
const TEARING_DOWN: u8 = 1;
const TORN_DOWN: u8 = 2;

struct StoreInner {
    config: StoreConfig,
    pool: Arc<ActionPool>,
    core: Mutex<ReducerManager>,
    state: ArcSwap<State>,
    chain: ArcSwap<Chain>,
    middlewares: Mutex<Vec<Middleware>>,
    effects: EffectsManager,
    actions_tx: broadcast::Sender<Action>,
    state_tx: broadcast::Sender<StateChange>,
    errors_tx: broadcast::Sender<ErrorReport>,
    lifecycle: AtomicU8,
}

/// Shared handle to a store. Cloning is cheap.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

/// Non-owning handle given to middleware and effects. Operations on a
/// handle whose store was dropped fail with [`StoreError::TornDown`].
#[derive(Clone)]
pub struct StoreHandle {
    inner: Weak<StoreInner>,
}

impl Store {
    pub fn new(config: StoreConfig) -> StoreResult<Self> {
        config.validate()?;

        let (actions_tx, _) = broadcast::channel(config.action_channel_capacity);
        let (state_tx, _) = broadcast::channel(config.state_channel_capacity);
        let (errors_tx, _) = broadcast::channel(config.error_channel_capacity);
        let core =
            ReducerManager::new().with_unknown_action_warnings(config.warn_unknown_actions);
        let effects = EffectsManager::new(&config);

        let inner = Arc::new_cyclic(|weak: &Weak<StoreInner>| {
            let handle = StoreHandle {
                inner: weak.clone(),
            };
            StoreInner {
                pool: Arc::new(ActionPool::new()),
                core: Mutex::new(core),
                state: ArcSwap::from_pointee(State::new()),
                chain: ArcSwap::from_pointee(Chain::compose(
                    &handle,
                    &[],
                    core_dispatch(&handle),
                )),
                middlewares: Mutex::new(Vec::new()),
                effects,
                actions_tx,
                state_tx,
                errors_tx,
                lifecycle: AtomicU8::new(RUNNING),
                config,
            }
        });

        tracing::debug!("Store created");
        Ok(Self { inner })
    }

    pub fn handle(&self) -> StoreHandle {
        StoreHandle {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    pub fn pool(&self) -> &Arc<ActionPool> {
        &self.inner.pool
    }

    /// Action creator backed by this store's pool.
    pub fn create_action(&self, action_type: &str) -> ActionCreator {
        create_action(&self.inner.pool, action_type)
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// Send `action` through the middleware chain to the reducers.
    ///
    /// Failures are reported on [`Store::errors`]. They are returned here
    /// only when no installed middleware handles errors.
    pub fn dispatch(&self, action: Action) -> StoreResult<()> {
        self.inner.dispatch(action)
    }

    /// Await `future` on a spawned task and dispatch the action it yields.
    pub fn dispatch_future<F>(&self, future: F) -> StoreResult<JoinHandle<StoreResult<()>>>
    where
        F: Future<Output = anyhow::Result<Action>> + Send + 'static,
    {
        self.inner.ensure_running()?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            StoreError::Config("dispatch_future requires a running tokio runtime".to_string())
        })?;
        let handle = self.handle();
        Ok(runtime.spawn(async move {
            match future.await {
                Ok(action) => handle.dispatch(action),
                Err(reason) => {
                    let err = StoreError::Action {
                        action_type: "<future>".to_string(),
                        reason: format!("{reason:#}"),
                    };
                    handle.report(&err, None);
                    Err(err)
                }
            }
        }))
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    /// Register the root feature reducers and run `[Root] Init Store`.
    pub fn register_root<I, K>(&self, reducers: I) -> StoreResult<()>
    where
        I: IntoIterator<Item = (K, Arc<dyn Reducer>)>,
        K: AsRef<str>,
    {
        let reducers: Vec<(K, Arc<dyn Reducer>)> = reducers.into_iter().collect();
        let count = reducers.len();
        self.inner.apply_registration(self.inner.pool.get(INIT_STORE, None), |core| {
            for (key, reducer) in reducers {
                core.add_reducer(key.as_ref(), reducer);
            }
            Ok(())
        })?;
        tracing::info!(features = count, "Root reducers registered");
        Ok(())
    }

    /// Add a feature at runtime. Effective for the next dispatch.
    pub fn register_feature(&self, key: &str, reducer: Arc<dyn Reducer>) -> StoreResult<()> {
        let action = self.inner.pool.get(UPDATE_REDUCER, Some(Value::from(key)));
        self.inner.apply_registration(action, |core| {
            core.add_reducer(key, reducer);
            Ok(())
        })?;
        tracing::info!(feature = key, "Feature registered");
        Ok(())
    }

    /// Remove a feature and its state. Unknown keys are an error.
    pub fn unregister_feature(&self, key: &str) -> StoreResult<()> {
        let action = self.inner.pool.get(UPDATE_REDUCER, Some(Value::from(key)));
        self.inner
            .apply_registration(action, |core| core.remove_reducer(key))?;
        tracing::info!(feature = key, "Feature unregistered");
        Ok(())
    }

    /// Start effects. Modules already registered under the same name are skipped.
    pub fn register_effects(
        &self,
        modules: &[Arc<dyn EffectsModule>],
    ) -> StoreResult<Vec<String>> {
        self.inner.ensure_running()?;
        self.inner
            .effects
            .add_effects(&self.handle(), &self.inner.actions_tx, modules)
    }

    pub fn unregister_effects(&self, module_names: &[&str]) -> usize {
        self.inner.effects.remove_effects(module_names)
    }

    pub fn cancel_effect(&self, module: &str, effect: &str) -> bool {
        self.inner.effects.cancel_effect(module, effect)
    }

    pub fn effects(&self) -> &EffectsManager {
        &self.inner.effects
    }

    /// Append middleware and rebuild the chain. The new chain replaces the
    /// old one atomically; a dispatch already running finishes on the chain
    /// it started with.
    pub fn apply_middleware<I>(&self, middlewares: I) -> StoreResult<()>
    where
        I: IntoIterator<Item = Middleware>,
    {
        self.inner.ensure_running()?;
        let handle = self.handle();
        let mut installed = self.inner.middlewares.lock();
        for middleware in middlewares {
            middleware.install(&handle);
            installed.push(middleware);
        }
        let chain = Chain::compose(&handle, &installed, core_dispatch(&handle));
        self.inner.chain.store(Arc::new(chain));
        tracing::info!(
            middleware = ?installed.iter().map(Middleware::name).collect::<Vec<_>>(),
            "Middleware chain rebuilt"
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Reading
    // -----------------------------------------------------------------------

    /// The current published snapshot.
    pub fn state(&self) -> State {
        self.inner.current_state()
    }

    /// Evaluate `selector` against the current snapshot.
    pub fn select_current<S: Selector>(&self, selector: &S) -> S::Output {
        selector.select(&self.state())
    }

    /// Run a fallible derivation, reporting failures as selector errors.
    pub fn try_select<T, F>(&self, selector: F) -> StoreResult<T>
    where
        F: FnOnce(&State) -> anyhow::Result<T>,
    {
        selector(&self.state()).map_err(|e| {
            let err = StoreError::Selector(format!("{e:#}"));
            self.inner.report(&err, None);
            err
        })
    }

    /// A restartable view of `selector` over the state stream.
    pub fn select<S>(&self, selector: S) -> Selection<S>
    where
        S: Selector + 'static,
        S::Output: PartialEq,
    {
        Selection {
            store: self.handle(),
            selector: Arc::new(selector),
        }
    }

    /// Committed transitions, in commit order.
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.inner.state_tx.subscribe()
    }

    /// Every action that reached the reducers, whether or not state changed.
    pub fn actions(&self) -> broadcast::Receiver<Action> {
        self.inner.actions_tx.subscribe()
    }

    pub fn errors(&self) -> broadcast::Receiver<ErrorReport> {
        self.inner.errors_tx.subscribe()
    }

    /// JSON view of the current state, restricted to `keys` when given.
    pub fn snapshot(&self, keys: Option<&[String]>) -> Value {
        self.inner.snapshot_of(&self.state(), keys)
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Cancel every effect and middleware timer. A second call fails with
    /// [`StoreError::TornDown`], a concurrent one with
    /// [`StoreError::TeardownInProgress`].
    pub fn teardown(&self) -> StoreResult<()> {
        if let Err(current) = self.inner.lifecycle.compare_exchange(
            RUNNING,
            TEARING_DOWN,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            return Err(if current == TEARING_DOWN {
                StoreError::TeardownInProgress
            } else {
                StoreError::TornDown
            });
        }

        self.inner.effects.teardown();
        let middlewares = self.inner.middlewares.lock().clone();
        for middleware in &middlewares {
            middleware.teardown();
        }
        self.inner.lifecycle.store(TORN_DOWN, Ordering::Release);
        tracing::info!(middleware = middlewares.len(), "Store torn down");
        Ok(())
    }

    pub fn is_torn_down(&self) -> bool {
        self.inner.lifecycle.load(Ordering::Acquire) == TORN_DOWN
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("state", &self.inner.current_state())
            .field("lifecycle", &self.inner.lifecycle.load(Ordering::Relaxed))
            .finish()
    }
}

fn core_dispatch(handle: &StoreHandle) -> Dispatch {
    let handle = handle.clone();
    Arc::new(move |action: Action| match handle.inner.upgrade() {
        Some(inner) => inner.dispatch_core(action),
        None => Err(StoreError::TornDown),
    })
}

impl StoreInner {
    fn current_state(&self) -> State {
        State::clone(&self.state.load())
    }

    fn ensure_running(&self) -> StoreResult<()> {
        match self.lifecycle.load(Ordering::Acquire) {
            RUNNING => Ok(()),
            _ => Err(StoreError::TornDown),
        }
    }

    fn dispatch(&self, action: Action) -> StoreResult<()> {
        self.ensure_running()?;
        let chain = self.chain.load_full();
        match (chain.dispatch)(action) {
            Ok(_) => Ok(()),
            Err(err) if chain.handles_errors => {
                tracing::debug!(error = %err, "Dispatch error absorbed by middleware");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Reduce, commit and publish under the dispatch lock. Broadcasts are
    /// sent while the lock is held so subscribers see commit order. The
    /// returned transition is the one this action produced.
    fn dispatch_core(&self, action: Action) -> StoreResult<Dispatched> {
        if self.lifecycle.load(Ordering::Acquire) == TORN_DOWN {
            return Err(StoreError::TornDown);
        }

        let mut core = self.core.lock();
        let previous = core.state().clone();
        let reduced = core.reduce(&previous, &action);
        let next = match reduced {
            Ok(next) => next,
            Err(err) => {
                drop(core);
                tracing::warn!(action_type = action.action_type(), error = %err, "Reducer failed");
                self.report(&err, Some(&action));
                return Err(err);
            }
        };

        let change = StateChange {
            action: action.clone(),
            previous,
            current: next,
        };
        if !change.current.ptr_eq(&change.previous) {
            core.commit(change.current.clone());
            self.state.store(Arc::new(change.current.clone()));
            let _ = self.state_tx.send(change.clone());
            tracing::debug!(action_type = action.action_type(), "State committed");
        }
        let _ = self.actions_tx.send(action);
        Ok(Dispatched::Reduced(change))
    }

    /// Mutate the reducer set, then run `action` through the reducers and
    /// publish the result on the state stream.
    fn apply_registration<F>(&self, action: Action, mutate: F) -> StoreResult<()>
    where
        F: FnOnce(&mut ReducerManager) -> StoreResult<()>,
    {
        self.ensure_running()?;
        let mut core = self.core.lock();
        let previous = core.state().clone();
        mutate(&mut core)?;

        let seeded = core.state().clone();
        let next = match core.reduce(&seeded, &action) {
            Ok(next) => next,
            Err(err) => {
                // keep the reducer change, publish the seeded state
                tracing::warn!(
                    action_type = action.action_type(),
                    error = %err,
                    "Reducer failed during registration"
                );
                self.report(&err, Some(&action));
                seeded
            }
        };
        core.commit(next.clone());
        self.state.store(Arc::new(next.clone()));
        if !next.ptr_eq(&previous) {
            let _ = self.state_tx.send(StateChange {
                action,
                previous,
                current: next,
            });
        }
        Ok(())
    }

    fn report(&self, error: &StoreError, action: Option<&Action>) {
        let report = ErrorReport::from_error(error, action);
        let _ = self.errors_tx.send(report);
    }

    fn snapshot_of(&self, state: &State, keys: Option<&[String]>) -> Value {
        self.core.lock().snapshot(state, keys)
    }
}

impl Drop for StoreInner {
    fn drop(&mut self) {
        self.effects.teardown();
    }
}

// ---------------------------------------------------------------------------
// StoreHandle
// ---------------------------------------------------------------------------

impl StoreHandle {
    pub fn upgrade(&self) -> Option<Store> {
        self.inner.upgrade().map(|inner| Store { inner })
    }

    pub fn dispatch(&self, action: Action) -> StoreResult<()> {
        match self.inner.upgrade() {
            Some(inner) => inner.dispatch(action),
            None => Err(StoreError::TornDown),
        }
    }

    pub fn state(&self) -> Option<State> {
        self.inner.upgrade().map(|inner| inner.current_state())
    }

    /// Committed transitions, in commit order.
    pub fn subscribe(&self) -> Option<broadcast::Receiver<StateChange>> {
        self.inner.upgrade().map(|inner| inner.state_tx.subscribe())
    }

    pub fn errors(&self) -> Option<broadcast::Receiver<ErrorReport>> {
        self.inner.upgrade().map(|inner| inner.errors_tx.subscribe())
    }

    /// Publish `error` on the store's error channel.
    pub fn report(&self, error: &StoreError, action: Option<&Action>) {
        if let Some(inner) = self.inner.upgrade() {
            inner.report(error, action);
        }
    }

    pub fn snapshot_of(&self, state: &State, keys: Option<&[String]>) -> Option<Value> {
        self.inner.upgrade().map(|inner| inner.snapshot_of(state, keys))
    }
}

impl std::fmt::Debug for StoreHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreHandle")
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Selection
// ---------------------------------------------------------------------------

/// A selector bound to a store. Each call to [`Selection::stream`] starts an
/// independent subscription.
pub struct Selection<S> {
    store: StoreHandle,
    selector: Arc<S>,
}

impl<S> Clone for Selection<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            selector: self.selector.clone(),
        }
    }
}

impl<S> Selection<S>
where
    S: Selector + 'static,
    S::Output: PartialEq,
{
    pub fn current(&self) -> Option<S::Output> {
        self.store.state().map(|state| self.selector.select(&state))
    }

    /// The current value, then every value that differs from the last one
    /// yielded.
    pub fn stream(&self) -> BoxStream<'static, S::Output> {
        let Some(inner) = self.store.inner.upgrade() else {
            return stream::empty().boxed();
        };
        let mut rx = inner.state_tx.subscribe();
        let initial = self.selector.select(&inner.current_state());
        drop(inner);

        let selector = self.selector.clone();
        let store = self.store.clone();
        Box::pin(async_stream::stream! {
            let mut last = initial.clone();
            yield initial;
            loop {
                let state = match rx.recv().await {
                    Ok(change) => change.current,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Selection fell behind, reading current state");
                        match store.state() {
                            Some(state) => state,
                            None => break,
                        }
                    }
                    Err(RecvError::Closed) => break,
                };
                let value = selector.select(&state);
                if value != last {
                    last = value.clone();
                    yield value;
                }
            }
        })
    }
}
