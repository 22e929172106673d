// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

/// How much history the engine records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryLevel {
    /// Nothing is recorded. Restart from history is unavailable.
    None,
    /// Process and activity instances.
    Activity,
    /// Activity level plus variables, variable details, incidents and the user operation log.
    Full,
}

impl HistoryLevel {
    /// Returns the string representation of the level.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Activity => "activity",
            Self::Full => "full",
        }
    }

    /// Parse a level from a string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Some(Self::None),
            "activity" => Some(Self::Activity),
            "full" => Some(Self::Full),
            _ => None,
        }
    }
}

/// Process engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Execution jobs a seed job creates per run
    pub batch_jobs_per_seed: u32,
    /// Process instances handled by one batch execution job
    pub invocations_per_batch_job: u32,
    /// Retries a new job starts with
    pub default_job_retries: u32,
    /// History recording level
    pub history_level: HistoryLevel,
    /// Jobs executed in parallel by [`crate::engine::ProcessEngine::run_due_jobs`]
    pub job_executor_concurrency: usize,
    /// Seconds an acquired job stays locked to its executor
    pub job_lock_duration_secs: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_jobs_per_seed: 100,
            invocations_per_batch_job: 1,
            default_job_retries: 3,
            history_level: HistoryLevel::Full,
            job_executor_concurrency: 4,
            job_lock_duration_secs: 300,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables.
    ///
    /// Optional (with defaults):
    /// - `RUNTARA_BATCH_JOBS_PER_SEED`: execution jobs per seed run (default: 100)
    /// - `RUNTARA_INVOCATIONS_PER_BATCH_JOB`: instances per execution job (default: 1)
    /// - `RUNTARA_DEFAULT_JOB_RETRIES`: retries of new jobs (default: 3)
    /// - `RUNTARA_HISTORY_LEVEL`: `none`, `activity` or `full` (default: full)
    /// - `RUNTARA_JOB_EXECUTOR_CONCURRENCY`: parallel job units (default: 4)
    /// - `RUNTARA_JOB_LOCK_DURATION_SECS`: lock time of acquired jobs (default: 300)
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let batch_jobs_per_seed = positive_u32(
            "RUNTARA_BATCH_JOBS_PER_SEED",
            defaults.batch_jobs_per_seed,
        )?;
        let invocations_per_batch_job = positive_u32(
            "RUNTARA_INVOCATIONS_PER_BATCH_JOB",
            defaults.invocations_per_batch_job,
        )?;

        let default_job_retries: u32 = std::env::var("RUNTARA_DEFAULT_JOB_RETRIES")
            .unwrap_or_else(|_| defaults.default_job_retries.to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("RUNTARA_DEFAULT_JOB_RETRIES", "must be a non-negative integer")
            })?;

        let history_level = match std::env::var("RUNTARA_HISTORY_LEVEL") {
            Ok(value) => HistoryLevel::parse(&value).ok_or(ConfigError::Invalid(
                "RUNTARA_HISTORY_LEVEL",
                "must be one of none, activity, full",
            ))?,
            Err(_) => defaults.history_level,
        };

        let job_executor_concurrency = positive_u32(
            "RUNTARA_JOB_EXECUTOR_CONCURRENCY",
            defaults.job_executor_concurrency as u32,
        )? as usize;

        let job_lock_duration_secs = positive_u32(
            "RUNTARA_JOB_LOCK_DURATION_SECS",
            defaults.job_lock_duration_secs,
        )?;

        Ok(Self {
            batch_jobs_per_seed,
            invocations_per_batch_job,
            default_job_retries,
            history_level,
            job_executor_concurrency,
            job_lock_duration_secs,
        })
    }
}

fn positive_u32(key: &'static str, default: u32) -> Result<u32, ConfigError> {
    let value: u32 = std::env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .map_err(|_| ConfigError::Invalid(key, "must be a positive integer"))?;
    if value == 0 {
        return Err(ConfigError::Invalid(key, "must be a positive integer"));
    }
    Ok(value)
}

/// Install a `tracing` fmt subscriber filtered by `RUST_LOG`, defaulting to
/// `runtara_process=info`.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("runtara_process=info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Mutex to serialize tests that modify environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const KEYS: [&str; 6] = [
        "RUNTARA_BATCH_JOBS_PER_SEED",
        "RUNTARA_INVOCATIONS_PER_BATCH_JOB",
        "RUNTARA_DEFAULT_JOB_RETRIES",
        "RUNTARA_HISTORY_LEVEL",
        "RUNTARA_JOB_EXECUTOR_CONCURRENCY",
        "RUNTARA_JOB_LOCK_DURATION_SECS",
    ];

    /// Helper to set env vars for a test and restore them after
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new() -> Self {
            Self { vars: Vec::new() }
        }

        fn set(&mut self, key: &str, value: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::set_var(key, value) };
        }

        fn remove(&mut self, key: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::remove_var(key) };
        }

        fn clear_all(&mut self) {
            for key in KEYS {
                self.remove(key);
            }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.drain(..).rev() {
                // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
                unsafe {
                    match value {
                        Some(v) => env::set_var(&key, v),
                        None => env::remove_var(&key),
                    }
                }
            }
        }
    }

    #[test]
    fn test_config_from_env_with_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.clear_all();

        let config = EngineConfig::from_env().unwrap();

        assert_eq!(config.batch_jobs_per_seed, 100);
        assert_eq!(config.invocations_per_batch_job, 1);
        assert_eq!(config.default_job_retries, 3);
        assert_eq!(config.history_level, HistoryLevel::Full);
        assert_eq!(config.job_executor_concurrency, 4);
        assert_eq!(config.job_lock_duration_secs, 300);
    }

    #[test]
    fn test_config_from_env_with_custom_values() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.clear_all();

        guard.set("RUNTARA_BATCH_JOBS_PER_SEED", "10");
        guard.set("RUNTARA_INVOCATIONS_PER_BATCH_JOB", "5");
        guard.set("RUNTARA_DEFAULT_JOB_RETRIES", "0");
        guard.set("RUNTARA_HISTORY_LEVEL", "Activity");

        let config = EngineConfig::from_env().unwrap();

        assert_eq!(config.batch_jobs_per_seed, 10);
        assert_eq!(config.invocations_per_batch_job, 5);
        assert_eq!(config.default_job_retries, 0);
        assert_eq!(config.history_level, HistoryLevel::Activity);
    }

    #[test]
    fn test_config_rejects_zero_batch_size() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.clear_all();

        guard.set("RUNTARA_INVOCATIONS_PER_BATCH_JOB", "0");

        let result = EngineConfig::from_env();
        assert!(matches!(
            result,
            Err(ConfigError::Invalid("RUNTARA_INVOCATIONS_PER_BATCH_JOB", _))
        ));
    }

    #[test]
    fn test_config_rejects_unknown_history_level() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.clear_all();

        guard.set("RUNTARA_HISTORY_LEVEL", "audit");

        let err = EngineConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("RUNTARA_HISTORY_LEVEL"));
    }

    #[test]
    fn test_history_level_ordering() {
        assert!(HistoryLevel::Full > HistoryLevel::Activity);
        assert!(HistoryLevel::Activity > HistoryLevel::None);
        assert_eq!(HistoryLevel::parse("FULL"), Some(HistoryLevel::Full));
        assert_eq!(HistoryLevel::Full.as_str(), "full");
    }
}
