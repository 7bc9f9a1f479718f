//! Runtime configuration loaded from the environment.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

pub use strata_observability::LogFormat;
use strata_observability::ObservabilityConfig;

pub const DEFAULT_SNAPSHOT_EVERY: u64 = 2;
pub const DEFAULT_CONTEXT_TTL: Duration = Duration::from_secs(60);
pub const DEFAULT_TASK_QUEUE: &str = "strata";
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: '{value}'")]
    Invalid { key: &'static str, value: String },
}

/// Retry policy applied by the substrate to unexpected context failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: DEFAULT_RETRY_BACKOFF,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Snapshot cadence `N`: snapshot when a batch crosses a multiple of N.
    pub snapshot_every: u64,
    /// How long an idle context waits for its next signal before retiring.
    pub context_ttl: Duration,
    pub task_queue: String,
    pub retry: RetryPolicy,
    /// Postgres connection string; the in-memory store is used when unset.
    pub database_url: Option<String>,
    pub log_format: LogFormat,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            snapshot_every: DEFAULT_SNAPSHOT_EVERY,
            context_ttl: DEFAULT_CONTEXT_TTL,
            task_queue: DEFAULT_TASK_QUEUE.to_string(),
            retry: RetryPolicy::default(),
            database_url: None,
            log_format: LogFormat::default(),
        }
    }
}

impl RuntimeConfig {
    /// Read `STRATA_*` variables and `DATABASE_URL`, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let snapshot_every = parse_or(&get, "STRATA_SNAPSHOT_EVERY", defaults.snapshot_every)?;
        let ttl_ms = parse_or(
            &get,
            "STRATA_CONTEXT_TTL_MS",
            defaults.context_ttl.as_millis() as u64,
        )?;
        let max_attempts = parse_or(&get, "STRATA_MAX_ATTEMPTS", defaults.retry.max_attempts)?;
        if max_attempts == 0 {
            return Err(ConfigError::Invalid {
                key: "STRATA_MAX_ATTEMPTS",
                value: "0".to_string(),
            });
        }
        let backoff_ms = parse_or(
            &get,
            "STRATA_RETRY_BACKOFF_MS",
            defaults.retry.backoff.as_millis() as u64,
        )?;
        let log_format = parse_or(&get, "STRATA_LOG_FORMAT", defaults.log_format)?;

        Ok(Self {
            snapshot_every,
            context_ttl: Duration::from_millis(ttl_ms),
            task_queue: get("STRATA_TASK_QUEUE").unwrap_or(defaults.task_queue),
            retry: RetryPolicy {
                max_attempts,
                backoff: Duration::from_millis(backoff_ms),
            },
            database_url: get("DATABASE_URL"),
            log_format,
        })
    }

    pub fn observability(&self) -> ObservabilityConfig {
        ObservabilityConfig::default().with_format(self.log_format)
    }

    pub fn with_snapshot_every(mut self, every: u64) -> Self {
        self.snapshot_every = every;
        self
    }

    pub fn with_context_ttl(mut self, ttl: Duration) -> Self {
        self.context_ttl = ttl;
        self
    }

    pub fn with_task_queue(mut self, task_queue: impl Into<String>) -> Self {
        self.task_queue = task_queue.into();
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self
    }
}

fn parse_or<T: FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match get(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value: raw }),
    }
}
