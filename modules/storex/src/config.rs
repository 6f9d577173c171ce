use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::error::{StoreError, StoreResult};

/// What an effect does after its stream yields an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectErrorPolicy {
    /// Report and keep consuming the stream.
    #[default]
    Continue,
    /// Report and cancel that one effect.
    Stop,
}

impl std::str::FromStr for EffectErrorPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "continue" => Ok(Self::Continue),
            "stop" => Ok(Self::Stop),
            other => Err(format!("unknown effect error policy: {other}")),
        }
    }
}

/// Runtime configuration for a store instance.
/// Every field has a default; TOML files and `STOREX_*` env vars override.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    pub action_channel_capacity: usize,
    pub state_channel_capacity: usize,
    pub error_channel_capacity: usize,
    pub effect_error_policy: EffectErrorPolicy,
    /// Also dispatch `[Error] GlobalError` for errors caught at effect boundaries.
    pub dispatch_global_error: bool,
    /// Log action types that no registered reducer handles.
    pub warn_unknown_actions: bool,
    pub debounce_interval_ms: u64,
    pub batch_window_ms: u64,
    pub slow_action_threshold_ms: u64,
    pub devtools_max_history: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            action_channel_capacity: 1024,
            state_channel_capacity: 256,
            error_channel_capacity: 64,
            effect_error_policy: EffectErrorPolicy::Continue,
            dispatch_global_error: false,
            warn_unknown_actions: false,
            debounce_interval_ms: 300,
            batch_window_ms: 100,
            slow_action_threshold_ms: 100,
            devtools_max_history: 1000,
        }
    }
}

impl StoreConfig {
    /// Defaults overridden by `STOREX_*` environment variables (and `.env`).
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        fn var<T: std::str::FromStr>(name: &str) -> Option<T> {
            std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
        }

        let defaults = Self::default();
        let config = Self {
            action_channel_capacity: var("STOREX_ACTION_CHANNEL_CAPACITY")
                .unwrap_or(defaults.action_channel_capacity),
            state_channel_capacity: var("STOREX_STATE_CHANNEL_CAPACITY")
                .unwrap_or(defaults.state_channel_capacity),
            error_channel_capacity: var("STOREX_ERROR_CHANNEL_CAPACITY")
                .unwrap_or(defaults.error_channel_capacity),
            effect_error_policy: var("STOREX_EFFECT_ERROR_POLICY")
                .unwrap_or(defaults.effect_error_policy),
            dispatch_global_error: var("STOREX_DISPATCH_GLOBAL_ERROR")
                .unwrap_or(defaults.dispatch_global_error),
            warn_unknown_actions: var("STOREX_WARN_UNKNOWN_ACTIONS")
                .unwrap_or(defaults.warn_unknown_actions),
            debounce_interval_ms: var("STOREX_DEBOUNCE_INTERVAL_MS")
                .unwrap_or(defaults.debounce_interval_ms),
            batch_window_ms: var("STOREX_BATCH_WINDOW_MS").unwrap_or(defaults.batch_window_ms),
            slow_action_threshold_ms: var("STOREX_SLOW_ACTION_THRESHOLD_MS")
                .unwrap_or(defaults.slow_action_threshold_ms),
            devtools_max_history: var("STOREX_DEVTOOLS_MAX_HISTORY")
                .unwrap_or(defaults.devtools_max_history),
        };

        config.log_summary();
        config
    }

    pub fn validate(&self) -> StoreResult<()> {
        let capacities = [
            ("action_channel_capacity", self.action_channel_capacity),
            ("state_channel_capacity", self.state_channel_capacity),
            ("error_channel_capacity", self.error_channel_capacity),
        ];
        for (name, value) in capacities {
            if value == 0 {
                return Err(StoreError::Config(format!("{name} must be greater than zero")));
            }
        }
        Ok(())
    }

    pub fn debounce_interval(&self) -> Duration {
        Duration::from_millis(self.debounce_interval_ms)
    }

    pub fn batch_window(&self) -> Duration {
        Duration::from_millis(self.batch_window_ms)
    }

    pub fn slow_action_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_action_threshold_ms)
    }

    pub fn log_summary(&self) {
        tracing::info!(
            action_channel_capacity = self.action_channel_capacity,
            state_channel_capacity = self.state_channel_capacity,
            error_channel_capacity = self.error_channel_capacity,
            effect_error_policy = ?self.effect_error_policy,
            dispatch_global_error = self.dispatch_global_error,
            warn_unknown_actions = self.warn_unknown_actions,
            debounce_interval_ms = self.debounce_interval_ms,
            batch_window_ms = self.batch_window_ms,
            slow_action_threshold_ms = self.slow_action_threshold_ms,
            devtools_max_history = self.devtools_max_history,
            "Store config loaded"
        );
    }
}

/// Load and parse a TOML config file. Missing keys fall back to defaults.
pub fn load_config(path: &Path) -> Result<StoreConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let config: StoreConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("Invalid config file: {}", path.display()))?;
    Ok(config)
}
