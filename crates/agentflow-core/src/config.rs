//! Runtime configuration for the bus, the engine and the system.
//!
//! Everything has a sensible `Default`; `SystemConfig::from_env` layers
//! `AGENTFLOW_*` environment overrides on top.

use serde::{Deserialize, Serialize};

use crate::workflow::schema::RetryPolicy;

pub const DEFAULT_MAX_HISTORY: usize = 1000;
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Event bus configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventBusConfig {
    /// Maximum number of events kept in history
    #[serde(default = "default_max_history")]
    pub max_history: usize,
    /// Timeout used by `request` when the caller passes none
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            max_history: DEFAULT_MAX_HISTORY,
            default_timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }
}

/// Workflow engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// Agent step timeout when neither the step nor the definition sets one
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
    /// Retry policy for definitions built without an explicit one
    #[serde(default)]
    pub default_retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: DEFAULT_TIMEOUT_MS,
            default_retry: RetryPolicy::default(),
        }
    }
}

/// Top-level configuration for `WorkflowSystem`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemConfig {
    #[serde(default)]
    pub bus: EventBusConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    /// Age after which `cleanup` drops history and finished instances
    #[serde(default = "default_cleanup_max_age_secs")]
    pub cleanup_max_age_secs: u64,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            bus: EventBusConfig::default(),
            engine: EngineConfig::default(),
            cleanup_max_age_secs: default_cleanup_max_age_secs(),
        }
    }
}

impl SystemConfig {
    /// Defaults overridden by `AGENTFLOW_*` environment variables.
    ///
    /// Unparseable values are ignored with a warning.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(v) = env_parse::<usize>("AGENTFLOW_MAX_HISTORY") {
            config.bus.max_history = v;
        }
        if let Some(v) = env_parse::<u64>("AGENTFLOW_DEFAULT_TIMEOUT_MS") {
            config.bus.default_timeout_ms = v;
            config.engine.default_timeout_ms = v;
        }
        if let Some(v) = env_parse::<u32>("AGENTFLOW_MAX_RETRIES") {
            config.engine.default_retry.max_retries = v;
        }
        if let Some(v) = env_parse::<u64>("AGENTFLOW_RETRY_DELAY_MS") {
            config.engine.default_retry.delay_ms = v;
        }
        config
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("[Config] Ignoring invalid value for {}: {:?}", key, raw);
            None
        }
    }
}

fn default_max_history() -> usize {
    DEFAULT_MAX_HISTORY
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

fn default_cleanup_max_age_secs() -> u64 {
    3600
}
