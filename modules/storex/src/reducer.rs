//! Feature reducers and their combination into one root transition.
//!
//! A [`Reducer`] maps `(sub_state, action)` to the next sub-state. Returning
//! the same `Arc` means "no change"; [`ReducerManager::reduce`] then leaves
//! that key untouched, and when every reducer does so the root snapshot is
//! returned by reference.

use std::any::type_name;
use std::collections::HashMap;
use std::sync::Arc;

use anyhow::anyhow;
use serde::Serialize;
use serde_json::Value;

use crate::action::{is_internal, Action, AsActionType};
use crate::error::{StoreError, StoreResult};
use crate::state::{State, SubState};

pub trait Reducer: Send + Sync {
    fn initial_state(&self) -> SubState;

    fn reduce(&self, state: &SubState, action: &Action) -> anyhow::Result<SubState>;

    /// JSON view of a sub-state, used by persistence and devtools.
    fn snapshot(&self, _state: &SubState) -> Option<Value> {
        None
    }

    /// Whether this reducer has a handler for `action_type`.
    fn handles(&self, _action_type: &str) -> bool {
        true
    }
}

// ---------------------------------------------------------------------------
// FeatureReducer
// ---------------------------------------------------------------------------

type Handler<S> = Arc<dyn Fn(&Arc<S>, &Action) -> anyhow::Result<Arc<S>> + Send + Sync>;

/// Reducer built from a table of action type → handler.
pub struct FeatureReducer<S> {
    initial: Arc<S>,
    handlers: HashMap<String, Handler<S>>,
    warn_unknown: bool,
}

/// Start a reducer for one feature. Chain `.on(..)` to add handlers.
pub fn create_reducer<S>(initial: S) -> FeatureReducer<S>
where
    S: Serialize + Send + Sync + 'static,
{
    FeatureReducer {
        initial: Arc::new(initial),
        handlers: HashMap::new(),
        warn_unknown: false,
    }
}

impl<S> FeatureReducer<S>
where
    S: Serialize + Send + Sync + 'static,
{
    /// Handle `action_type` by building a new sub-state.
    pub fn on<A, F>(self, action_type: &A, handler: F) -> Self
    where
        A: AsActionType + ?Sized,
        F: Fn(&S, &Action) -> S + Send + Sync + 'static,
    {
        self.insert(
            action_type.as_action_type(),
            Arc::new(move |state: &Arc<S>, action: &Action| -> anyhow::Result<Arc<S>> {
                Ok(Arc::new(handler(state, action)))
            }),
        )
    }

    /// Handler that may return the same `Arc` to signal no change.
    pub fn on_arc<A, F>(self, action_type: &A, handler: F) -> Self
    where
        A: AsActionType + ?Sized,
        F: Fn(&Arc<S>, &Action) -> Arc<S> + Send + Sync + 'static,
    {
        self.insert(
            action_type.as_action_type(),
            Arc::new(move |state: &Arc<S>, action: &Action| -> anyhow::Result<Arc<S>> {
                Ok(handler(state, action))
            }),
        )
    }

    /// Fallible handler. An `Err` aborts the whole dispatch.
    pub fn try_on<A, F>(self, action_type: &A, handler: F) -> Self
    where
        A: AsActionType + ?Sized,
        F: Fn(&S, &Action) -> anyhow::Result<S> + Send + Sync + 'static,
    {
        self.insert(
            action_type.as_action_type(),
            Arc::new(move |state: &Arc<S>, action: &Action| -> anyhow::Result<Arc<S>> {
                handler(state, action).map(Arc::new)
            }),
        )
    }

    /// Fallible handler that may return the same `Arc` to signal no change.
    pub fn try_on_arc<A, F>(self, action_type: &A, handler: F) -> Self
    where
        A: AsActionType + ?Sized,
        F: Fn(&Arc<S>, &Action) -> anyhow::Result<Arc<S>> + Send + Sync + 'static,
    {
        self.insert(action_type.as_action_type(), Arc::new(handler))
    }

    /// Log action types this reducer has no handler for.
    pub fn warn_unknown(mut self) -> Self {
        self.warn_unknown = true;
        self
    }

    pub fn build(self) -> Arc<dyn Reducer> {
        Arc::new(self)
    }

    fn insert(mut self, action_type: &str, handler: Handler<S>) -> Self {
        self.handlers.insert(action_type.to_string(), handler);
        self
    }
}

impl<S> Reducer for FeatureReducer<S>
where
    S: Serialize + Send + Sync + 'static,
{
    fn initial_state(&self) -> SubState {
        self.initial.clone()
    }

    fn reduce(&self, state: &SubState, action: &Action) -> anyhow::Result<SubState> {
        let Some(handler) = self.handlers.get(action.action_type()) else {
            if self.warn_unknown && !is_internal(action.action_type()) {
                tracing::warn!(
                    action_type = action.action_type(),
                    state_type = type_name::<S>(),
                    "No handler for action"
                );
            }
            return Ok(state.clone());
        };
        let typed = state
            .clone()
            .downcast::<S>()
            .map_err(|_| anyhow!("sub-state is not a {}", type_name::<S>()))?;
        let next = handler(&typed, action)?;
        if Arc::ptr_eq(&next, &typed) {
            return Ok(state.clone());
        }
        Ok(next as SubState)
    }

    fn snapshot(&self, state: &SubState) -> Option<Value> {
        let typed = state.clone().downcast::<S>().ok()?;
        serde_json::to_value(&*typed).ok()
    }

    fn handles(&self, action_type: &str) -> bool {
        self.handlers.contains_key(action_type)
    }
}

// ---------------------------------------------------------------------------
// ReducerManager
// ---------------------------------------------------------------------------

/// Owns the feature reducers and the authoritative root state.
#[derive(Default)]
pub struct ReducerManager {
    reducers: Vec<(Arc<str>, Arc<dyn Reducer>)>,
    state: State,
    warn_unknown: bool,
}

impl ReducerManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Log actions that no registered reducer handles.
    pub fn with_unknown_action_warnings(mut self, enabled: bool) -> Self {
        self.warn_unknown = enabled;
        self
    }

    /// Register (or replace) the reducer for `key` and seed its initial state.
    pub fn add_reducer(&mut self, key: &str, reducer: Arc<dyn Reducer>) {
        let key: Arc<str> = Arc::from(key);
        self.state = self.state.with(key.clone(), reducer.initial_state());
        match self.reducers.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = reducer,
            None => self.reducers.push((key, reducer)),
        }
    }

    /// Drop the reducer for `key` along with its sub-state.
    pub fn remove_reducer(&mut self, key: &str) -> StoreResult<()> {
        let index = self
            .reducers
            .iter()
            .position(|(k, _)| &**k == key)
            .ok_or_else(|| StoreError::UnknownFeature(key.to_string()))?;
        self.reducers.remove(index);
        self.state = self.state.without(key);
        Ok(())
    }

    pub fn has_reducer(&self, key: &str) -> bool {
        self.reducers.iter().any(|(k, _)| &**k == key)
    }

    pub fn feature_keys(&self) -> impl Iterator<Item = &str> {
        self.reducers.iter().map(|(k, _)| &**k)
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    /// Make `state` authoritative. Called after a successful reduce.
    pub fn commit(&mut self, state: State) {
        self.state = state;
    }

    /// Run every feature reducer against `state`. Only keys whose reducer
    /// returned a new sub-state are rewritten. Batch actions are folded over
    /// their items in order.
    pub fn reduce(&self, state: &State, action: &Action) -> StoreResult<State> {
        if let Some(items) = action.batch_items() {
            return items
                .iter()
                .try_fold(state.clone(), |acc, item| self.reduce(&acc, item));
        }

        let mut next = state.clone();
        let mut handled = false;
        for (key, reducer) in &self.reducers {
            handled |= reducer.handles(action.action_type());
            let (previous, present) = match state.raw(key) {
                Some(sub) => (sub.clone(), true),
                None => (reducer.initial_state(), false),
            };
            let reduced =
                reducer
                    .reduce(&previous, action)
                    .map_err(|source| StoreError::Reducer {
                        feature: key.to_string(),
                        source,
                    })?;
            if !present || !Arc::ptr_eq(&reduced, &previous) {
                next = next.with(key.clone(), reduced);
            }
        }

        if self.warn_unknown && !handled && !is_internal(action.action_type()) {
            tracing::warn!(
                action_type = action.action_type(),
                "Action not handled by any reducer"
            );
        }
        Ok(next)
    }

    /// JSON view of `state`, restricted to `keys` when given.
    pub fn snapshot(&self, state: &State, keys: Option<&[String]>) -> Value {
        let mut out = serde_json::Map::new();
        for (key, reducer) in &self.reducers {
            if keys.is_some_and(|keys| !keys.iter().any(|k| k.as_str() == &**key)) {
                continue;
            }
            if let Some(sub) = state.raw(key) {
                out.insert(
                    key.to_string(),
                    reducer.snapshot(sub).unwrap_or(Value::Null),
                );
            }
        }
        Value::Object(out)
    }
}
