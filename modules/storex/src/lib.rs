//! In-process, single-writer state runtime.
//!
//! A [`Store`] holds one immutable [`State`] keyed by feature. Every change
//! goes through dispatch: the action runs through the middleware chain,
//! every feature [`Reducer`] folds it into a new state, and the result is
//! published to subscribers. Effects consume the action stream and feed
//! follow-up actions back in; memoized selectors derive values from state.

pub mod action;
pub mod config;
pub mod convert;
pub mod effects;
pub mod entity;
pub mod error;
pub mod middleware;
pub mod reducer;
pub mod selector;
pub mod state;
pub mod store;

pub use action::{
    create_action, create_action_with, Action, ActionCreator, ActionPool, AsActionType,
    BATCH_ACTION, GLOBAL_ERROR, INIT_STORE, UPDATE_REDUCER,
};
pub use config::{load_config, EffectErrorPolicy, StoreConfig};
pub use convert::{to_json, to_persistent, FromState, Record, ToState};
pub use effects::{
    create_effect, ActionStream, ActionStreamExt, Effect, EffectContext, EffectOutput,
    EffectsManager, EffectsModule,
};
pub use entity::{
    create_entity_adapter, entity_actions, entity_reducer, ChangeSet, Entity, EntityActions,
    EntityAdapter, EntityState, EntityUpdate,
};
pub use error::{ErrorKind, ErrorReport, StoreError, StoreResult};
pub use middleware::{Dispatch, Dispatched, Middleware, MiddlewareFactory, MiddlewareHooks};
pub use reducer::{create_reducer, FeatureReducer, Reducer, ReducerManager};
pub use selector::{create_selector, feature_selector, MemoInput, MemoizedSelector, Selector};
pub use state::{State, SubState};
pub use store::{Selection, StateChange, Store, StoreHandle};
pub use storex_map::PersistentMap;
