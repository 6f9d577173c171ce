use crate::action::Action;
use crate::error::StoreError;
use crate::state::State;

use super::MiddlewareHooks;

/// Traces every dispatch. State is rendered as its feature keys at `debug`.
#[derive(Debug, Default)]
pub struct LoggerMiddleware;

impl MiddlewareHooks for LoggerMiddleware {
    fn name(&self) -> &str {
        "logger"
    }

    fn on_next(&self, action: &Action, previous: &State) -> anyhow::Result<()> {
        tracing::info!(action_type = action.action_type(), "Dispatching action");
        tracing::debug!(
            action = ?action,
            previous = ?previous,
            "State before dispatch"
        );
        Ok(())
    }

    fn on_complete(&self, next: &State, action: &Action) -> anyhow::Result<()> {
        tracing::debug!(
            action_type = action.action_type(),
            next = ?next,
            "State after dispatch"
        );
        Ok(())
    }

    fn on_error(&self, error: &StoreError, action: &Action) -> anyhow::Result<()> {
        tracing::error!(
            action_type = action.action_type(),
            error = %error,
            "Dispatch failed"
        );
        Ok(())
    }
}
