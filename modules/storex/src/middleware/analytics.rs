use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::action::Action;
use crate::store::StoreHandle;

use super::{Dispatch, MiddlewareFactory};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalyticsPhase {
    Before,
    After,
    Failed,
}

#[derive(Debug, Clone)]
pub struct AnalyticsEvent {
    /// Shared by the events of one dispatch.
    pub session_id: Uuid,
    pub phase: AnalyticsPhase,
    pub action: Action,
    pub timestamp: DateTime<Utc>,
}

type Callback = Arc<dyn Fn(AnalyticsEvent) + Send + Sync>;

/// Reports each dispatch to a callback, before and after delivery.
pub struct AnalyticsMiddleware {
    callback: Callback,
}

impl AnalyticsMiddleware {
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(AnalyticsEvent) + Send + Sync + 'static,
    {
        Self {
            callback: Arc::new(callback),
        }
    }
}

impl MiddlewareFactory for AnalyticsMiddleware {
    fn name(&self) -> &str {
        "analytics"
    }

    fn wrap(&self, _store: StoreHandle, next: Dispatch) -> Dispatch {
        let callback = self.callback.clone();
        Arc::new(move |action: Action| {
            let session_id = Uuid::new_v4();
            let emit = |phase| {
                callback(AnalyticsEvent {
                    session_id,
                    phase,
                    action: action.clone(),
                    timestamp: Utc::now(),
                })
            };
            emit(AnalyticsPhase::Before);
            let result = next(action.clone());
            emit(if result.is_ok() {
                AnalyticsPhase::After
            } else {
                AnalyticsPhase::Failed
            });
            result
        })
    }
}
