//! Runtime configuration.

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use taskwatch_core::TimeoutPolicy;

use crate::sweeper::SweeperConfig;

pub const ENV_TASK_TIMEOUT_SECS: &str = "TASKWATCH_TASK_TIMEOUT_SECS";
pub const ENV_SWEEP_INTERVAL_SECS: &str = "TASKWATCH_SWEEP_INTERVAL_SECS";
pub const ENV_SWEEP_CONCURRENCY: &str = "TASKWATCH_SWEEP_CONCURRENCY";
pub const ENV_REMOTE_RETENTION_SECS: &str = "TASKWATCH_REMOTE_RETENTION_SECS";
pub const ENV_DATABASE_URL: &str = "DATABASE_URL";
pub const ENV_BIND_ADDR: &str = "TASKWATCH_BIND_ADDR";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    fn invalid(key: &'static str, value: &str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            key,
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskwatchConfig {
    /// `None` disables the timeout
    pub task_timeout_secs: Option<u64>,
    pub sweep_interval_secs: u64,
    pub sweep_concurrency: usize,
    /// How long the queue keeps results before forgetting a handle
    pub remote_retention_secs: u64,
    /// Postgres store when set, in-memory otherwise
    pub database_url: Option<String>,
    pub bind_addr: String,
}

impl Default for TaskwatchConfig {
    fn default() -> Self {
        Self {
            task_timeout_secs: None,
            sweep_interval_secs: 60,
            sweep_concurrency: 1,
            remote_retention_secs: 24 * 60 * 60,
            database_url: None,
            bind_addr: "0.0.0.0:8080".to_string(),
        }
    }
}

impl TaskwatchConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string());

        if let Some(raw) = get(ENV_TASK_TIMEOUT_SECS) {
            config.task_timeout_secs = parse_timeout(&raw)?;
        }
        if let Some(raw) = get(ENV_SWEEP_INTERVAL_SECS).filter(|v| !v.is_empty()) {
            config.sweep_interval_secs = parse_positive(ENV_SWEEP_INTERVAL_SECS, &raw)?;
        }
        if let Some(raw) = get(ENV_SWEEP_CONCURRENCY).filter(|v| !v.is_empty()) {
            config.sweep_concurrency = parse_positive(ENV_SWEEP_CONCURRENCY, &raw)? as usize;
        }
        if let Some(raw) = get(ENV_REMOTE_RETENTION_SECS).filter(|v| !v.is_empty()) {
            config.remote_retention_secs = parse_positive(ENV_REMOTE_RETENTION_SECS, &raw)?;
        }
        config.database_url = get(ENV_DATABASE_URL).filter(|v| !v.is_empty());
        if let Some(raw) = get(ENV_BIND_ADDR).filter(|v| !v.is_empty()) {
            config.bind_addr = raw;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.bind_addr
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::invalid(ENV_BIND_ADDR, &self.bind_addr, e.to_string()))?;
        if self.sweep_interval_secs == 0 {
            return Err(ConfigError::invalid(ENV_SWEEP_INTERVAL_SECS, "0", "must be at least 1"));
        }
        if self.sweep_concurrency == 0 {
            return Err(ConfigError::invalid(ENV_SWEEP_CONCURRENCY, "0", "must be at least 1"));
        }
        Ok(())
    }

    pub fn timeout_policy(&self) -> TimeoutPolicy {
        TimeoutPolicy::new(self.task_timeout_secs.map(Duration::from_secs))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn remote_retention(&self) -> Duration {
        Duration::from_secs(self.remote_retention_secs)
    }

    pub fn sweeper_config(&self) -> SweeperConfig {
        SweeperConfig::default()
            .with_interval(self.sweep_interval())
            .with_max_concurrent(self.sweep_concurrency)
    }

    /// Warn when a running task could outlive the queue's memory of it.
    ///
    /// Past the retention window the queue reports UNKNOWN, and a RUNNING
    /// task that is merely slow would be failed as vanished.
    pub fn retention_warning(&self) -> Option<String> {
        match self.task_timeout_secs {
            None => Some(format!(
                "no task timeout configured; RUNNING tasks older than the remote retention ({}s) will be failed as vanished",
                self.remote_retention_secs
            )),
            Some(timeout) if timeout > self.remote_retention_secs => Some(format!(
                "task timeout ({timeout}s) exceeds remote retention ({}s); long-running tasks may be failed as vanished before they time out",
                self.remote_retention_secs
            )),
            Some(_) => None,
        }
    }
}

fn parse_timeout(raw: &str) -> Result<Option<u64>, ConfigError> {
    if raw.is_empty() || raw.eq_ignore_ascii_case("none") {
        return Ok(None);
    }
    let secs: u64 = raw
        .parse()
        .map_err(|e: std::num::ParseIntError| ConfigError::invalid(ENV_TASK_TIMEOUT_SECS, raw, e.to_string()))?;
    Ok((secs > 0).then_some(secs))
}

fn parse_positive(key: &'static str, raw: &str) -> Result<u64, ConfigError> {
    let value: u64 = raw
        .parse()
        .map_err(|e: std::num::ParseIntError| ConfigError::invalid(key, raw, e.to_string()))?;
    if value == 0 {
        return Err(ConfigError::invalid(key, raw, "must be at least 1"));
    }
    Ok(value)
}
