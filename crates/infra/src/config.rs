//! Configuration loading from environment variables.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use cadence_core::TenantId;

use crate::jobs::{JobPayload, NewQueueEntry, QueueOptions, WorkerConfig};
use crate::rate_limit::Quota;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}

/// Process configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct CadenceConfig {
    /// `DATABASE_URL`. Only the worker binary requires it.
    pub database_url: Option<String>,
    /// `REDIS_URL`
    pub redis_url: String,
    /// `CADENCE_IDLE_POLL_MS`
    pub idle_poll: Duration,
    /// `CADENCE_DEFAULT_MAX_ATTEMPTS`
    pub default_max_attempts: u32,
    /// `CADENCE_WORKERS`
    pub workers: usize,
    /// `CADENCE_LOCK_TIMEOUT_SECS`; unset disables stale-lock reclaim.
    pub lock_timeout: Option<Duration>,
    /// `CADENCE_HANDLER_TIMEOUT_SECS`; unset lets handlers run unbounded.
    pub handler_timeout: Option<Duration>,
    /// `CADENCE_RATE_LIMIT_USER`
    pub user_quota: Quota,
    /// `CADENCE_RATE_LIMIT_VENDOR`
    pub vendor_quota: Quota,
}

impl Default for CadenceConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            redis_url: "redis://localhost:6379".to_string(),
            idle_poll: Duration::from_millis(1000),
            default_max_attempts: crate::jobs::DEFAULT_MAX_ATTEMPTS,
            workers: 1,
            lock_timeout: None,
            handler_timeout: None,
            user_quota: Quota::DEFAULT_USER,
            vendor_quota: Quota::DEFAULT_VENDOR,
        }
    }
}

impl CadenceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from any variable source; unset and empty variables take defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let idle_poll_ms: u64 = parse(&get, "CADENCE_IDLE_POLL_MS")?.unwrap_or(1000);
        if idle_poll_ms == 0 {
            return Err(invalid("CADENCE_IDLE_POLL_MS", "must be at least 1"));
        }

        let default_max_attempts: u32 =
            parse(&get, "CADENCE_DEFAULT_MAX_ATTEMPTS")?.unwrap_or(defaults.default_max_attempts);
        if default_max_attempts == 0 {
            return Err(invalid("CADENCE_DEFAULT_MAX_ATTEMPTS", "must be at least 1"));
        }

        let workers: usize = parse(&get, "CADENCE_WORKERS")?.unwrap_or(defaults.workers);
        if workers == 0 {
            return Err(invalid("CADENCE_WORKERS", "must be at least 1"));
        }

        Ok(Self {
            database_url: get("DATABASE_URL"),
            redis_url: get("REDIS_URL").unwrap_or(defaults.redis_url),
            idle_poll: Duration::from_millis(idle_poll_ms),
            default_max_attempts,
            workers,
            lock_timeout: parse(&get, "CADENCE_LOCK_TIMEOUT_SECS")?.map(Duration::from_secs),
            handler_timeout: parse(&get, "CADENCE_HANDLER_TIMEOUT_SECS")?.map(Duration::from_secs),
            user_quota: parse(&get, "CADENCE_RATE_LIMIT_USER")?.unwrap_or(defaults.user_quota),
            vendor_quota: parse(&get, "CADENCE_RATE_LIMIT_VENDOR")?.unwrap_or(defaults.vendor_quota),
        })
    }

    pub fn require_database_url(&self) -> Result<&str, ConfigError> {
        self.database_url
            .as_deref()
            .ok_or(ConfigError::Missing("DATABASE_URL"))
    }

    pub fn queue_options(&self) -> QueueOptions {
        QueueOptions {
            lock_timeout: self.lock_timeout,
            ..QueueOptions::default()
        }
    }

    /// Settings for the `index`-th worker loop of this process.
    pub fn worker_config(&self, index: usize) -> WorkerConfig {
        WorkerConfig {
            name: format!("worker-{index}"),
            idle_interval: self.idle_poll,
            handler_timeout: self.handler_timeout,
        }
    }

    /// Ad-hoc entry carrying the configured retry budget.
    pub fn new_entry(&self, tenant_id: TenantId, payload: JobPayload) -> NewQueueEntry {
        NewQueueEntry::new(tenant_id, payload).with_max_attempts(self.default_max_attempts)
    }
}

fn parse<T>(get: &impl Fn(&str) -> Option<String>, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    get(var)
        .map(|raw| raw.trim().parse::<T>().map_err(|e| invalid(var, e.to_string())))
        .transpose()
}

fn invalid(var: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        var,
        reason: reason.into(),
    }
}
