use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::action::Action;
use crate::config::StoreConfig;
use crate::store::StoreHandle;

use super::{Dispatch, MiddlewareFactory};

/// Timing aggregate for one action type.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActionStats {
    pub count: u64,
    pub total: Duration,
    pub min: Duration,
    pub max: Duration,
}

impl ActionStats {
    fn new(elapsed: Duration) -> Self {
        Self {
            count: 1,
            total: elapsed,
            min: elapsed,
            max: elapsed,
        }
    }

    fn record(&mut self, elapsed: Duration) {
        self.count += 1;
        self.total += elapsed;
        self.min = self.min.min(elapsed);
        self.max = self.max.max(elapsed);
    }

    pub fn average(&self) -> Duration {
        let count = u32::try_from(self.count).unwrap_or(u32::MAX);
        self.total / count.max(1)
    }
}

/// Times each dispatch through the rest of the chain and warns when one
/// takes longer than the threshold.
pub struct PerformanceMonitorMiddleware {
    threshold: Duration,
    stats: Arc<Mutex<HashMap<String, ActionStats>>>,
}

impl PerformanceMonitorMiddleware {
    pub fn new(threshold: Duration) -> Self {
        Self {
            threshold,
            stats: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Warn past `slow_action_threshold_ms`.
    pub fn from_config(config: &StoreConfig) -> Self {
        Self::new(config.slow_action_threshold())
    }

    pub fn stats(&self) -> HashMap<String, ActionStats> {
        self.stats.lock().clone()
    }

    pub fn stats_for(&self, action_type: &str) -> Option<ActionStats> {
        self.stats.lock().get(action_type).copied()
    }

    pub fn reset(&self) {
        self.stats.lock().clear();
    }
}

impl MiddlewareFactory for PerformanceMonitorMiddleware {
    fn name(&self) -> &str {
        "performance"
    }

    fn wrap(&self, _store: StoreHandle, next: Dispatch) -> Dispatch {
        let stats = self.stats.clone();
        let threshold = self.threshold;
        Arc::new(move |action: Action| {
            let started = Instant::now();
            let result = next(action.clone());
            let elapsed = started.elapsed();

            if elapsed > threshold {
                tracing::warn!(
                    action_type = action.action_type(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    threshold_ms = threshold.as_millis() as u64,
                    "Slow action"
                );
            }
            stats
                .lock()
                .entry(action.action_type().to_string())
                .and_modify(|s| s.record(elapsed))
                .or_insert_with(|| ActionStats::new(elapsed));
            result
        })
    }
}
