use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::action::Action;
use crate::config::StoreConfig;
use crate::state::State;
use crate::store::StoreHandle;

use super::{Dispatch, Dispatched, MiddlewareFactory};

/// One recorded dispatch.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub previous: State,
    pub action: Action,
    pub next: State,
    pub recorded_at: DateTime<Utc>,
}

/// Records `(previous, action, next)` for every action reduced through it,
/// keeping at most `max_history` entries. The states are the ones the
/// action's own commit saw, so concurrent dispatches never interleave in
/// an entry. Actions held back by an inner middleware are not recorded.
/// For a batch flushed through it, `action` is the batch action.
pub struct DevToolsMiddleware {
    history: Arc<Mutex<VecDeque<HistoryEntry>>>,
    max_history: usize,
}

impl DevToolsMiddleware {
    pub fn new(max_history: usize) -> Self {
        Self {
            history: Arc::new(Mutex::new(VecDeque::new())),
            max_history: max_history.max(1),
        }
    }

    /// Keep `devtools_max_history` entries.
    pub fn from_config(config: &StoreConfig) -> Self {
        Self::new(config.devtools_max_history)
    }

    pub fn history(&self) -> Vec<HistoryEntry> {
        self.history.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.history.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.lock().is_empty()
    }

    /// State right after the `index`-th recorded dispatch.
    pub fn state_at(&self, index: usize) -> Option<State> {
        self.history.lock().get(index).map(|entry| entry.next.clone())
    }

    pub fn clear(&self) {
        self.history.lock().clear();
    }
}

impl MiddlewareFactory for DevToolsMiddleware {
    fn name(&self) -> &str {
        "devtools"
    }

    fn wrap(&self, _store: StoreHandle, next: Dispatch) -> Dispatch {
        let history = self.history.clone();
        let max_history = self.max_history;
        Arc::new(move |action: Action| {
            let outcome = next(action)?;
            if let Dispatched::Reduced(change) = &outcome {
                let entry = HistoryEntry {
                    previous: change.previous.clone(),
                    action: change.action.clone(),
                    next: change.current.clone(),
                    recorded_at: Utc::now(),
                };
                let mut history = history.lock();
                if history.len() >= max_history {
                    history.pop_front();
                }
                history.push_back(entry);
            }
            Ok(outcome)
        })
    }

    fn teardown(&self) {
        self.clear();
    }
}
