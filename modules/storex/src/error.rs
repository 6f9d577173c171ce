//! Typed errors and the structured error-report channel.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::action::{Action, GLOBAL_ERROR};

/// Errors surfaced by the dispatch runtime.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Action could not be constructed (payload failed to serialize, etc.)
    #[error("invalid action `{action_type}`: {reason}")]
    Action { action_type: String, reason: String },

    /// A feature reducer failed while computing the next state
    #[error("reducer for feature `{feature}` failed: {source}")]
    Reducer {
        feature: String,
        #[source]
        source: anyhow::Error,
    },

    /// An effect stream yielded an error
    #[error("effect `{module}.{effect}` failed: {source}")]
    Effect {
        module: String,
        effect: String,
        #[source]
        source: anyhow::Error,
    },

    /// A selector could not derive its value
    #[error("selector failed: {0}")]
    Selector(String),

    /// A middleware hook failed
    #[error("middleware `{middleware}` failed: {source}")]
    Middleware {
        middleware: String,
        #[source]
        source: anyhow::Error,
    },

    /// Dispatch or registration after `teardown()`
    #[error("store has been torn down")]
    TornDown,

    /// `teardown()` called while another teardown is running
    #[error("teardown already in progress")]
    TeardownInProgress,

    /// Feature key was never registered
    #[error("unknown feature: {0}")]
    UnknownFeature(String),

    /// Sub-state under `feature` is not of the requested type
    #[error("feature `{feature}` does not hold a `{expected}`")]
    FeatureType {
        feature: String,
        expected: &'static str,
    },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::Action { .. } => ErrorKind::Action,
            StoreError::Reducer { .. } => ErrorKind::Reducer,
            StoreError::Effect { .. } => ErrorKind::Effect,
            StoreError::Selector(_) => ErrorKind::Selector,
            StoreError::Middleware { .. } => ErrorKind::Middleware,
            StoreError::TornDown
            | StoreError::TeardownInProgress
            | StoreError::UnknownFeature(_)
            | StoreError::FeatureType { .. } => ErrorKind::Store,
            StoreError::Validation(_) => ErrorKind::Validation,
            StoreError::Config(_) => ErrorKind::Config,
        }
    }

    fn details(&self) -> serde_json::Value {
        match self {
            StoreError::Reducer { feature, .. } => serde_json::json!({ "feature": feature }),
            StoreError::Effect { module, effect, .. } => {
                serde_json::json!({ "module": module, "effect": effect })
            }
            StoreError::Middleware { middleware, .. } => {
                serde_json::json!({ "middleware": middleware })
            }
            StoreError::UnknownFeature(feature) | StoreError::FeatureType { feature, .. } => {
                serde_json::json!({ "feature": feature })
            }
            _ => serde_json::Value::Null,
        }
    }
}

/// Result type alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Error category, one per boundary that catches failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Action,
    Reducer,
    Effect,
    Selector,
    Middleware,
    Store,
    Validation,
    Config,
}

/// A caught error, as broadcast on the store's error channel and carried
/// by the global error action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub message: String,
    pub action_type: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub details: serde_json::Value,
}

impl ErrorReport {
    pub fn from_error(error: &StoreError, action: Option<&Action>) -> Self {
        Self {
            kind: error.kind(),
            message: format!("{error:#}"),
            action_type: action.map(|a| a.action_type().to_string()),
            timestamp: Utc::now(),
            details: error.details(),
        }
    }

    /// The `[Error] GlobalError` action carrying this report as payload.
    pub fn to_action(&self) -> Action {
        let payload = serde_json::to_value(self).unwrap_or(serde_json::Value::Null);
        Action::new(GLOBAL_ERROR, Some(payload))
    }

    /// Recover a report from a global error action.
    pub fn from_action(action: &Action) -> Option<Self> {
        if action.action_type() != GLOBAL_ERROR {
            return None;
        }
        serde_json::from_value(action.payload()?.clone()).ok()
    }
}
