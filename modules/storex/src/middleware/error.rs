use std::sync::Arc;

use crate::action::{Action, GLOBAL_ERROR};
use crate::error::ErrorReport;
use crate::store::StoreHandle;

use super::{Dispatch, Dispatched, MiddlewareFactory};

/// Turns dispatch failures into a dispatched `[Error] GlobalError` action
/// and absorbs them, so callers of `Store::dispatch` see `Ok`.
#[derive(Debug, Default)]
pub struct ErrorMiddleware;

impl MiddlewareFactory for ErrorMiddleware {
    fn name(&self) -> &str {
        "error"
    }

    fn handles_errors(&self) -> bool {
        true
    }

    fn wrap(&self, store: StoreHandle, next: Dispatch) -> Dispatch {
        Arc::new(move |action: Action| {
            let err = match next(action.clone()) {
                Ok(outcome) => return Ok(outcome),
                Err(err) => err,
            };
            // A failing global error must not feed itself.
            if action.action_type() == GLOBAL_ERROR {
                tracing::warn!(error = %err, "Global error action failed");
                return Ok(Dispatched::Held);
            }
            let report = ErrorReport::from_error(&err, Some(&action));
            if let Err(dispatch_err) = store.dispatch(report.to_action()) {
                tracing::warn!(
                    action_type = action.action_type(),
                    error = %dispatch_err,
                    "Failed to dispatch global error action"
                );
            }
            Ok(Dispatched::Held)
        })
    }
}
