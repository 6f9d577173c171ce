//! Effects: long-running consumers of the action stream.
//!
//! An [`Effect`] turns the store's action stream into a stream of follow-up
//! results. The [`EffectsManager`] runs each effect as its own tokio task
//! with a cancellation token, keyed by `(module, effect)`, so one effect can
//! be cancelled or fail without touching its siblings.

use std::collections::HashMap;
use std::sync::Arc;

use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::action::{Action, AsActionType};
use crate::config::{EffectErrorPolicy, StoreConfig};
use crate::error::{StoreError, StoreResult};
use crate::store::StoreHandle;

pub type ActionStream = BoxStream<'static, Action>;
pub type EffectOutput = BoxStream<'static, anyhow::Result<Action>>;

/// What an effect receives when it starts.
pub struct EffectContext {
    /// Every action dispatched after registration, in dispatch order.
    pub actions: ActionStream,
    /// Read state or dispatch directly.
    pub store: StoreHandle,
    /// Cancelled when the effect is removed or the store is torn down.
    pub cancelled: CancellationToken,
}

type EffectFactory = Arc<dyn Fn(EffectContext) -> EffectOutput + Send + Sync>;

#[derive(Clone)]
pub struct Effect {
    name: String,
    dispatch: bool,
    factory: EffectFactory,
}

/// Build an effect from a function of its context. Emitted actions are
/// dispatched unless `.no_dispatch()` is set.
pub fn create_effect<F, S>(name: &str, effect: F) -> Effect
where
    F: Fn(EffectContext) -> S + Send + Sync + 'static,
    S: Stream<Item = anyhow::Result<Action>> + Send + 'static,
{
    Effect {
        name: name.to_string(),
        dispatch: true,
        factory: Arc::new(move |ctx| effect(ctx).boxed()),
    }
}

impl Effect {
    /// Consume emitted actions without dispatching them.
    pub fn no_dispatch(mut self) -> Self {
        self.dispatch = false;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dispatches(&self) -> bool {
        self.dispatch
    }
}

impl std::fmt::Debug for Effect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Effect")
            .field("name", &self.name)
            .field("dispatch", &self.dispatch)
            .finish()
    }
}

/// A named group of effects registered and removed together.
pub trait EffectsModule: Send + Sync {
    fn name(&self) -> &str;
    fn effects(&self) -> Vec<Effect>;
}

/// Stream combinators for effect pipelines.
pub trait ActionStreamExt: Stream<Item = Action> + Send + Sized + 'static {
    /// Keep only actions of the given type.
    fn of_type<A: AsActionType + ?Sized>(self, action_type: &A) -> ActionStream {
        let wanted = action_type.as_action_type().to_string();
        self.filter(move |action| futures::future::ready(action.action_type() == wanted))
            .boxed()
    }

    /// Keep actions whose type is any of `action_types`.
    fn of_types(self, action_types: &[&str]) -> ActionStream {
        let wanted: Vec<String> = action_types.iter().map(|t| t.to_string()).collect();
        self.filter(move |action| {
            futures::future::ready(wanted.iter().any(|t| t == action.action_type()))
        })
        .boxed()
    }
}

impl<S: Stream<Item = Action> + Send + 'static> ActionStreamExt for S {}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

struct EffectTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl EffectTask {
    fn stop(&self) {
        self.cancel.cancel();
        self.handle.abort();
    }
}

/// Table of running effect tasks keyed by module then effect name.
pub struct EffectsManager {
    policy: EffectErrorPolicy,
    dispatch_global_error: bool,
    root: CancellationToken,
    modules: Mutex<HashMap<String, HashMap<String, EffectTask>>>,
}

impl EffectsManager {
    pub fn new(config: &StoreConfig) -> Self {
        Self {
            policy: config.effect_error_policy,
            dispatch_global_error: config.dispatch_global_error,
            root: CancellationToken::new(),
            modules: Mutex::new(HashMap::new()),
        }
    }

    /// Start every effect of every module. A module whose name is already
    /// registered is skipped. Returns the names of modules started.
    pub fn add_effects(
        &self,
        store: &StoreHandle,
        actions: &broadcast::Sender<Action>,
        modules: &[Arc<dyn EffectsModule>],
    ) -> StoreResult<Vec<String>> {
        let runtime = Handle::try_current().map_err(|_| {
            StoreError::Config("effects require a running tokio runtime".to_string())
        })?;

        let mut table = self.modules.lock();
        let mut started = Vec::new();
        for module in modules {
            let module_name = module.name().to_string();
            if table.contains_key(&module_name) {
                tracing::debug!(
                    module = %module_name,
                    "Effects module already registered, skipping"
                );
                continue;
            }

            let mut tasks = HashMap::new();
            for effect in module.effects() {
                let cancel = self.root.child_token();
                let ctx = EffectContext {
                    actions: action_stream(actions.subscribe()),
                    store: store.clone(),
                    cancelled: cancel.clone(),
                };
                let handle = runtime.spawn(run_effect(
                    module_name.clone(),
                    effect.clone(),
                    ctx,
                    self.policy,
                    self.dispatch_global_error,
                ));
                tasks.insert(effect.name().to_string(), EffectTask { cancel, handle });
            }
            tracing::info!(module = %module_name, effects = tasks.len(), "Effects registered");
            table.insert(module_name.clone(), tasks);
            started.push(module_name);
        }
        Ok(started)
    }

    /// Stop every effect of the named modules. Returns how many were removed.
    pub fn remove_effects(&self, module_names: &[&str]) -> usize {
        let mut table = self.modules.lock();
        let mut removed = 0;
        for name in module_names {
            if let Some(tasks) = table.remove(*name) {
                tasks.values().for_each(EffectTask::stop);
                tracing::info!(module = %name, "Effects removed");
                removed += 1;
            }
        }
        removed
    }

    /// Stop one effect, leaving its siblings running.
    pub fn cancel_effect(&self, module: &str, effect: &str) -> bool {
        let mut table = self.modules.lock();
        let Some(tasks) = table.get_mut(module) else {
            return false;
        };
        let Some(task) = tasks.remove(effect) else {
            return false;
        };
        task.stop();
        tracing::info!(module, effect, "Effect cancelled");
        true
    }

    /// Whether `(module, effect)` is registered and its task still running.
    pub fn is_running(&self, module: &str, effect: &str) -> bool {
        self.modules
            .lock()
            .get(module)
            .and_then(|tasks| tasks.get(effect))
            .is_some_and(|task| !task.handle.is_finished())
    }

    pub fn modules(&self) -> Vec<String> {
        self.modules.lock().keys().cloned().collect()
    }

    /// Stop everything.
    pub fn teardown(&self) {
        self.root.cancel();
        let mut table = self.modules.lock();
        for tasks in table.values() {
            tasks.values().for_each(EffectTask::stop);
        }
        table.clear();
    }
}

fn action_stream(mut rx: broadcast::Receiver<Action>) -> ActionStream {
    Box::pin(async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(action) => yield action,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Effect fell behind the action stream");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

async fn run_effect(
    module: String,
    effect: Effect,
    ctx: EffectContext,
    policy: EffectErrorPolicy,
    dispatch_global_error: bool,
) {
    let cancel = ctx.cancelled.clone();
    let store = ctx.store.clone();
    let mut output = (effect.factory)(ctx);

    loop {
        let item = tokio::select! {
            _ = cancel.cancelled() => break,
            item = output.next() => item,
        };
        match item {
            None => break,
            Some(Ok(action)) => {
                if !effect.dispatch {
                    continue;
                }
                match store.dispatch(action) {
                    Ok(()) => {}
                    Err(StoreError::TornDown) => break,
                    Err(e) => {
                        tracing::debug!(
                            module = %module,
                            effect = %effect.name,
                            error = %e,
                            "Effect dispatch failed"
                        );
                    }
                }
            }
            Some(Err(source)) => {
                let err = StoreError::Effect {
                    module: module.clone(),
                    effect: effect.name.clone(),
                    source,
                };
                tracing::warn!(error = %err, "Effect error");
                store.report(&err, None);
                if dispatch_global_error {
                    let report = crate::error::ErrorReport::from_error(&err, None);
                    if let Err(e) = store.dispatch(report.to_action()) {
                        tracing::debug!(error = %e, "Failed to dispatch global error action");
                    }
                }
                if policy == EffectErrorPolicy::Stop {
                    tracing::info!(
                        module = %module,
                        effect = %effect.name,
                        "Stopping effect after error"
                    );
                    break;
                }
            }
        }
    }
    tracing::debug!(module = %module, effect = %effect.name, "Effect finished");
}
