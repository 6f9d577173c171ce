use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::action::Action;
use crate::config::StoreConfig;
use crate::store::StoreHandle;

use super::window::DebounceSlot;
use super::{Dispatch, Dispatched, MiddlewareFactory};

#[derive(Default)]
struct Entry {
    slot: DebounceSlot,
    timer: Option<JoinHandle<()>>,
}

type Slots = Arc<Mutex<HashMap<String, Entry>>>;

/// Collapses bursts of same-type actions: only the last one within
/// `interval` of quiet is delivered.
///
/// Timers run on the ambient tokio runtime. Without one, actions pass
/// straight through.
pub struct DebounceMiddleware {
    interval: Duration,
    types: Option<Arc<HashSet<String>>>,
    slots: Slots,
}

impl DebounceMiddleware {
    /// Debounce every action type.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            types: None,
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Debounce every action type by `debounce_interval_ms`.
    pub fn from_config(config: &StoreConfig) -> Self {
        Self::new(config.debounce_interval())
    }

    /// Restrict debouncing to `types`; others pass through.
    pub fn for_types(mut self, types: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.types = Some(Arc::new(types.into_iter().map(Into::into).collect()));
        self
    }

    /// Action types with an action waiting for its timer.
    pub fn pending(&self) -> usize {
        self.slots
            .lock()
            .values()
            .filter(|entry| entry.slot.pending().is_some())
            .count()
    }
}

impl MiddlewareFactory for DebounceMiddleware {
    fn name(&self) -> &str {
        "debounce"
    }

    fn wrap(&self, _store: StoreHandle, next: Dispatch) -> Dispatch {
        let slots = self.slots.clone();
        let types = self.types.clone();
        let interval = self.interval;
        Arc::new(move |action: Action| {
            if types
                .as_ref()
                .is_some_and(|types| !types.contains(action.action_type()))
            {
                return next(action);
            }
            let Ok(runtime) = Handle::try_current() else {
                return next(action);
            };

            let key = action.action_type().to_string();
            let mut guard = slots.lock();
            let entry = guard.entry(key.clone()).or_default();
            let generation = entry.slot.offer(action);
            if let Some(stale) = entry.timer.take() {
                stale.abort();
            }
            entry.timer = Some(runtime.spawn(fire(
                slots.clone(),
                key,
                generation,
                interval,
                next.clone(),
            )));
            Ok(Dispatched::Held)
        })
    }

    fn teardown(&self) {
        let mut slots = self.slots.lock();
        let mut dropped = 0usize;
        for entry in slots.values_mut() {
            if let Some(timer) = entry.timer.take() {
                timer.abort();
            }
            dropped += usize::from(entry.slot.cancel().is_some());
        }
        slots.clear();
        if dropped > 0 {
            tracing::debug!(dropped, "Debounce teardown dropped pending actions");
        }
    }
}

async fn fire(slots: Slots, key: String, generation: u64, interval: Duration, next: Dispatch) {
    tokio::time::sleep(interval).await;

    let action = slots
        .lock()
        .get_mut(&key)
        .and_then(|entry| entry.slot.fire(generation));
    let Some(action) = action else {
        return;
    };

    // Delivered outside the lock; `next` may re-enter this middleware.
    if let Err(e) = next(action) {
        tracing::warn!(action_type = %key, error = %e, "Debounced action failed");
    }
    if let Some(entry) = slots.lock().get_mut(&key) {
        entry.slot.settle();
    }
}
