//! Configuration loading and representation.
//!
//! Every struct has a usable `Default`, builder-style `with_*` setters and a
//! serde representation so hosts can also load it from a file. Environment
//! overrides are read from `CONDUCTOR_*` variables.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use conductor_events::TrustMode;

use crate::extensions::SourceRoot;
use crate::jobs::lanes::LaneConfig;

/// Invalid configuration value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: '{value}' ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    fn invalid(key: &'static str, value: &str, reason: impl ToString) -> Self {
        Self::Invalid {
            key,
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Queue Manager knobs.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Global bound on concurrently running jobs (across all lanes).
    pub max_concurrent: usize,
    /// Consecutive interactive jobs per lane before an aged background job is forced through.
    pub max_interactive_burst: u32,
    /// How long a background job must wait before the starvation guard applies.
    pub background_aging: Duration,
    /// Default budget for `stop`.
    pub drain_budget: Duration,
    /// Scheduler wake-up interval when nothing else wakes it.
    pub idle_poll: Duration,
    /// Leave still-queued jobs queued on `stop` so the next start picks them up.
    /// By default they are canceled with reason `shutdown`.
    pub keep_queued_on_stop: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            max_interactive_burst: 3,
            background_aging: Duration::from_secs(30),
            drain_budget: Duration::from_secs(10),
            idle_poll: Duration::from_secs(1),
            keep_queued_on_stop: false,
        }
    }
}

impl QueueConfig {
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max.max(1);
        self
    }

    pub fn with_max_interactive_burst(mut self, burst: u32) -> Self {
        self.max_interactive_burst = burst;
        self
    }

    pub fn with_background_aging(mut self, aging: Duration) -> Self {
        self.background_aging = aging;
        self
    }

    pub fn with_drain_budget(mut self, budget: Duration) -> Self {
        self.drain_budget = budget;
        self
    }

    pub fn with_idle_poll(mut self, poll: Duration) -> Self {
        self.idle_poll = poll;
        self
    }

    pub fn with_keep_queued_on_stop(mut self, keep: bool) -> Self {
        self.keep_queued_on_stop = keep;
        self
    }

    pub fn lane_config(&self) -> LaneConfig {
        LaneConfig {
            max_interactive_burst: self.max_interactive_burst,
            background_aging: self.background_aging,
        }
    }
}

/// Event Dispatcher knobs.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Timeout for handlers that do not choose their own.
    pub handler_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            handler_timeout: Duration::from_secs(5),
        }
    }
}

impl DispatcherConfig {
    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = timeout;
        self
    }
}

/// Whole-engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Job store file; `None` keeps jobs in memory.
    pub store_path: Option<PathBuf>,
    /// Audit log file; `None` keeps audit records in memory.
    pub audit_path: Option<PathBuf>,
    /// Extension source roots, highest precedence first.
    pub extension_roots: Vec<SourceRoot>,
    pub trust_mode: TrustMode,
    /// Version extensions declare compatibility against.
    pub core_version: String,
    pub queue: QueueConfig,
    pub dispatcher: DispatcherConfig,
    /// HTTP listen address.
    pub bind: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            store_path: None,
            audit_path: None,
            extension_roots: Vec::new(),
            trust_mode: TrustMode::default(),
            core_version: env!("CARGO_PKG_VERSION").to_string(),
            queue: QueueConfig::default(),
            dispatcher: DispatcherConfig::default(),
            bind: "127.0.0.1:8080".to_string(),
        }
    }
}

impl OrchestratorConfig {
    /// Defaults overridden by `CONDUCTOR_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) with an explicit variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("CONDUCTOR_STORE_PATH") {
            cfg.store_path = Some(PathBuf::from(v));
        }
        if let Some(v) = get("CONDUCTOR_AUDIT_PATH") {
            cfg.audit_path = Some(PathBuf::from(v));
        }
        if let Some(v) = get("CONDUCTOR_EXTENSION_ROOTS") {
            cfg.extension_roots = std::env::split_paths(&v)
                .filter(|p| !p.as_os_str().is_empty())
                .enumerate()
                .map(|(i, path)| SourceRoot::new(format!("root{i}"), path))
                .collect();
        }
        if let Some(v) = get("CONDUCTOR_TRUST_MODE") {
            cfg.trust_mode = v
                .parse()
                .map_err(|e: String| ConfigError::invalid("CONDUCTOR_TRUST_MODE", &v, e))?;
        }
        if let Some(v) = get("CONDUCTOR_MAX_CONCURRENT") {
            let n: usize = parse("CONDUCTOR_MAX_CONCURRENT", &v)?;
            if n == 0 {
                return Err(ConfigError::invalid("CONDUCTOR_MAX_CONCURRENT", &v, "must be at least 1"));
            }
            cfg.queue.max_concurrent = n;
        }
        if let Some(v) = get("CONDUCTOR_MAX_INTERACTIVE_BURST") {
            cfg.queue.max_interactive_burst = parse("CONDUCTOR_MAX_INTERACTIVE_BURST", &v)?;
        }
        if let Some(v) = get("CONDUCTOR_BACKGROUND_AGING_MS") {
            cfg.queue.background_aging = millis("CONDUCTOR_BACKGROUND_AGING_MS", &v)?;
        }
        if let Some(v) = get("CONDUCTOR_DRAIN_BUDGET_MS") {
            cfg.queue.drain_budget = millis("CONDUCTOR_DRAIN_BUDGET_MS", &v)?;
        }
        if let Some(v) = get("CONDUCTOR_HANDLER_TIMEOUT_MS") {
            cfg.dispatcher.handler_timeout = millis("CONDUCTOR_HANDLER_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = get("CONDUCTOR_BIND") {
            cfg.bind = v;
        }

        Ok(cfg)
    }

    pub fn with_store_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.store_path = Some(path.into());
        self
    }

    pub fn with_audit_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.audit_path = Some(path.into());
        self
    }

    pub fn with_extension_root(mut self, root: SourceRoot) -> Self {
        self.extension_roots.push(root);
        self
    }

    pub fn with_trust_mode(mut self, mode: TrustMode) -> Self {
        self.trust_mode = mode;
        self
    }

    pub fn with_core_version(mut self, version: impl Into<String>) -> Self {
        self.core_version = version.into();
        self
    }

    pub fn with_queue(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }

    pub fn with_dispatcher(mut self, dispatcher: DispatcherConfig) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    pub fn with_bind(mut self, bind: impl Into<String>) -> Self {
        self.bind = bind.into();
        self
    }
}

fn parse<T>(key: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::invalid(key, value, e))
}

fn millis(key: &'static str, value: &str) -> Result<Duration, ConfigError> {
    parse::<u64>(key, value).map(Duration::from_millis)
}
