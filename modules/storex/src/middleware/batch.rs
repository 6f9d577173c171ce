use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::action::{Action, BATCH_ACTION};
use crate::config::StoreConfig;
use crate::store::StoreHandle;

use super::window::{BatchWindow, Push};
use super::{Dispatch, Dispatched, MiddlewareFactory};

struct Shared {
    window: BatchWindow,
    timer: Option<JoinHandle<()>>,
}

/// Buffers actions for `window` and delivers them as one
/// `[Batch] BatchAction`. Reducers fold the items in order, so a batch
/// produces a single state change.
pub struct BatchMiddleware {
    window: Duration,
    types: Option<Arc<HashSet<String>>>,
    shared: Arc<Mutex<Shared>>,
}

impl BatchMiddleware {
    pub fn new(window: Duration) -> Self {
        Self::with_max_size(window, None)
    }

    pub fn from_config(config: &StoreConfig) -> Self {
        Self::new(config.batch_window())
    }

    /// Flush early once `max_size` actions are buffered.
    pub fn with_max_size(window: Duration, max_size: Option<usize>) -> Self {
        Self {
            window,
            types: None,
            shared: Arc::new(Mutex::new(Shared {
                window: BatchWindow::new(max_size),
                timer: None,
            })),
        }
    }

    /// Only batch `types`; others pass through immediately.
    pub fn for_types(mut self, types: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.types = Some(Arc::new(types.into_iter().map(Into::into).collect()));
        self
    }

    pub fn buffered(&self) -> usize {
        self.shared.lock().window.len()
    }
}

impl MiddlewareFactory for BatchMiddleware {
    fn name(&self) -> &str {
        "batch"
    }

    fn wrap(&self, _store: StoreHandle, next: Dispatch) -> Dispatch {
        let shared = self.shared.clone();
        let types = self.types.clone();
        let window = self.window;
        Arc::new(move |action: Action| {
            let skip = action.action_type() == BATCH_ACTION
                || types
                    .as_ref()
                    .is_some_and(|types| !types.contains(action.action_type()));
            if skip {
                return next(action);
            }
            let Ok(runtime) = Handle::try_current() else {
                return next(action);
            };

            let push = {
                let mut guard = shared.lock();
                let push = guard.window.push(action);
                match &push {
                    Push::OpenWindow(generation) => {
                        guard.timer = Some(runtime.spawn(fire(
                            shared.clone(),
                            *generation,
                            window,
                            next.clone(),
                        )));
                    }
                    Push::Full(_) => {
                        if let Some(timer) = guard.timer.take() {
                            timer.abort();
                        }
                    }
                    Push::Buffered => {}
                }
                push
            };

            if let Push::Full(items) = push {
                let result = next(Action::batch(&items));
                shared.lock().window.settle();
                return result;
            }
            Ok(Dispatched::Held)
        })
    }

    fn teardown(&self) {
        let mut shared = self.shared.lock();
        if let Some(timer) = shared.timer.take() {
            timer.abort();
        }
        let dropped = shared.window.cancel().len();
        if dropped > 0 {
            tracing::debug!(dropped, "Batch teardown dropped buffered actions");
        }
    }
}

async fn fire(shared: Arc<Mutex<Shared>>, generation: u64, window: Duration, next: Dispatch) {
    tokio::time::sleep(window).await;

    let Some(items) = shared.lock().window.fire(generation) else {
        return;
    };
    tracing::debug!(count = items.len(), "Delivering batch");
    if let Err(e) = next(Action::batch(&items)) {
        tracing::warn!(count = items.len(), error = %e, "Batched dispatch failed");
    }
    shared.lock().window.settle();
}
