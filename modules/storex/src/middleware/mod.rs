//! Middleware: interceptors composed around the core dispatch function.
//!
//! Two shapes exist. [`MiddlewareHooks`] observes a dispatch through
//! `on_next` / `on_complete` / `on_error` and is wrapped into a pass-through
//! dispatch function once, when the chain is built. [`MiddlewareFactory`]
//! receives the next dispatch function and returns its own, which lets it
//! defer, batch or drop actions.

pub mod analytics;
pub mod batch;
pub mod debounce;
pub mod devtools;
pub mod error;
pub mod error_report;
pub mod logger;
pub mod perf;
pub mod persist;
pub mod window;

use std::sync::Arc;

use crate::action::Action;
use crate::error::{StoreError, StoreResult};
use crate::state::State;
use crate::store::{StateChange, StoreHandle};

pub use analytics::{AnalyticsEvent, AnalyticsMiddleware, AnalyticsPhase};
pub use batch::BatchMiddleware;
pub use debounce::DebounceMiddleware;
pub use devtools::{DevToolsMiddleware, HistoryEntry};
pub use error::ErrorMiddleware;
pub use error_report::ErrorReportMiddleware;
pub use logger::LoggerMiddleware;
pub use perf::{ActionStats, PerformanceMonitorMiddleware};
pub use persist::{JsonFilePersister, PersistMiddleware, Persister};
pub use window::{BatchWindow, DebounceSlot, Push, WindowPhase};

/// A dispatch function: the core, or the core wrapped in middleware.
pub type Dispatch = Arc<dyn Fn(Action) -> StoreResult<Dispatched> + Send + Sync>;

/// What a dispatch function did with its action.
#[derive(Debug, Clone)]
pub enum Dispatched {
    /// The action reached the reducers. `previous` and `current` are the
    /// snapshots on either side of its commit, read under the dispatch lock.
    /// They are the same snapshot when nothing changed.
    Reduced(StateChange),
    /// A middleware held the action back (debounce, batch) or dropped it.
    Held,
}

/// Hook-style middleware. Hook errors are reported on the store's error
/// channel and never interrupt the dispatch.
pub trait MiddlewareHooks: Send + Sync {
    fn name(&self) -> &str;

    /// Before the action reaches the next layer.
    fn on_next(&self, _action: &Action, _previous: &State) -> anyhow::Result<()> {
        Ok(())
    }

    /// After the action was reduced, given the state its own commit
    /// produced. Not called for actions held back by an inner middleware.
    fn on_complete(&self, _next: &State, _action: &Action) -> anyhow::Result<()> {
        Ok(())
    }

    /// After the next layer failed. The error still propagates outward.
    fn on_error(&self, _error: &StoreError, _action: &Action) -> anyhow::Result<()> {
        Ok(())
    }

    fn teardown(&self) {}
}

/// Function-style middleware with full control over delivery.
pub trait MiddlewareFactory: Send + Sync {
    fn name(&self) -> &str;

    fn wrap(&self, store: StoreHandle, next: Dispatch) -> Dispatch;

    /// Called once when the middleware is added to a store, before the
    /// chain is rebuilt. Middleware that follows the store's streams
    /// rather than the actions passing through it subscribes here.
    fn install(&self, _store: &StoreHandle) {}

    /// Whether this middleware absorbs dispatch errors. When any installed
    /// middleware does, `Store::dispatch` no longer returns them.
    fn handles_errors(&self) -> bool {
        false
    }

    /// Cancel timers and release buffered actions.
    fn teardown(&self) {}
}

#[derive(Clone)]
pub enum Middleware {
    Hooks(Arc<dyn MiddlewareHooks>),
    Function(Arc<dyn MiddlewareFactory>),
}

struct FnMiddleware<F> {
    name: String,
    wrap: F,
}

impl<F> MiddlewareFactory for FnMiddleware<F>
where
    F: Fn(StoreHandle, Dispatch) -> Dispatch + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn wrap(&self, store: StoreHandle, next: Dispatch) -> Dispatch {
        (self.wrap)(store, next)
    }
}

impl Middleware {
    pub fn hooks(middleware: impl MiddlewareHooks + 'static) -> Self {
        Middleware::Hooks(Arc::new(middleware))
    }

    pub fn function(middleware: impl MiddlewareFactory + 'static) -> Self {
        Middleware::Function(Arc::new(middleware))
    }

    /// Function-style middleware from a closure.
    pub fn from_fn<F>(name: &str, wrap: F) -> Self
    where
        F: Fn(StoreHandle, Dispatch) -> Dispatch + Send + Sync + 'static,
    {
        Middleware::Function(Arc::new(FnMiddleware {
            name: name.to_string(),
            wrap,
        }))
    }

    pub fn name(&self) -> &str {
        match self {
            Middleware::Hooks(m) => m.name(),
            Middleware::Function(m) => m.name(),
        }
    }

    pub fn handles_errors(&self) -> bool {
        match self {
            Middleware::Hooks(_) => false,
            Middleware::Function(m) => m.handles_errors(),
        }
    }

    pub fn install(&self, store: &StoreHandle) {
        if let Middleware::Function(m) = self {
            m.install(store);
        }
    }

    pub fn teardown(&self) {
        match self {
            Middleware::Hooks(m) => m.teardown(),
            Middleware::Function(m) => m.teardown(),
        }
    }

    fn wrap(&self, store: &StoreHandle, next: Dispatch) -> Dispatch {
        match self {
            Middleware::Function(m) => m.wrap(store.clone(), next),
            Middleware::Hooks(hooks) => {
                let hooks = hooks.clone();
                let store = store.clone();
                Arc::new(move |action: Action| {
                    let previous = store.state().unwrap_or_default();
                    report_hook(&store, hooks.name(), &action, hooks.on_next(&action, &previous));
                    match next(action.clone()) {
                        Ok(outcome) => {
                            if let Dispatched::Reduced(change) = &outcome {
                                report_hook(
                                    &store,
                                    hooks.name(),
                                    &action,
                                    hooks.on_complete(&change.current, &action),
                                );
                            }
                            Ok(outcome)
                        }
                        Err(err) => {
                            let outcome = hooks.on_error(&err, &action);
                            report_hook(&store, hooks.name(), &action, outcome);
                            Err(err)
                        }
                    }
                })
            }
        }
    }
}

impl std::fmt::Debug for Middleware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shape = match self {
            Middleware::Hooks(_) => "hooks",
            Middleware::Function(_) => "function",
        };
        f.debug_struct("Middleware")
            .field("name", &self.name())
            .field("shape", &shape)
            .finish()
    }
}

fn report_hook(store: &StoreHandle, name: &str, action: &Action, result: anyhow::Result<()>) {
    if let Err(source) = result {
        let err = StoreError::Middleware {
            middleware: name.to_string(),
            source,
        };
        store.report(&err, Some(action));
    }
}

// ---------------------------------------------------------------------------
// Chain
// ---------------------------------------------------------------------------

/// A composed dispatch function, swapped as a unit when middleware changes.
pub(crate) struct Chain {
    pub dispatch: Dispatch,
    pub handles_errors: bool,
}

impl Chain {
    /// Fold `middlewares` right to left around `core`, so the first one
    /// listed is outermost.
    pub fn compose(store: &StoreHandle, middlewares: &[Middleware], core: Dispatch) -> Self {
        let dispatch = middlewares
            .iter()
            .rev()
            .fold(core, |next, middleware| middleware.wrap(store, next));
        Self {
            dispatch,
            handles_errors: middlewares.iter().any(Middleware::handles_errors),
        }
    }
}
