// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::time::Duration;

/// Engine-wide tuning knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Idle instance workers kept per process before the least recently used is retired.
    pub worker_cache_capacity: usize,
    /// Processes unused for this long are dehydrated by the sweeper. `None` disables idle dehydration.
    pub dehydration_idle: Option<Duration>,
    /// How often the sweeper wakes up.
    pub dehydration_poll_interval: Duration,
    /// Upper bound on simultaneously hydrated processes. `None` means unbounded.
    pub max_hydrated_processes: Option<usize>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_cache_capacity: 1024,
            dehydration_idle: Some(Duration::from_secs(300)),
            dehydration_poll_interval: Duration::from_secs(30),
            max_hydrated_processes: None,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables.
    ///
    /// Optional (with defaults):
    /// - `ORCHESTRA_WORKER_CACHE_CAPACITY`: idle workers kept per process (default: 1024)
    /// - `ORCHESTRA_DEHYDRATION_IDLE_SECS`: idle time before dehydration, `0` disables (default: 300)
    /// - `ORCHESTRA_DEHYDRATION_POLL_SECS`: sweeper interval (default: 30)
    /// - `ORCHESTRA_MAX_HYDRATED_PROCESSES`: hydrated process cap, `0` means unbounded (default: 0)
    pub fn from_env() -> Result<Self, ConfigError> {
        let worker_cache_capacity: usize = std::env::var("ORCHESTRA_WORKER_CACHE_CAPACITY")
            .unwrap_or_else(|_| "1024".to_string())
            .parse()
            .ok()
            .filter(|capacity| *capacity > 0)
            .ok_or(ConfigError::Invalid(
                "ORCHESTRA_WORKER_CACHE_CAPACITY",
                "must be a positive integer",
            ))?;

        let idle_secs: u64 = std::env::var("ORCHESTRA_DEHYDRATION_IDLE_SECS")
            .unwrap_or_else(|_| "300".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid(
                    "ORCHESTRA_DEHYDRATION_IDLE_SECS",
                    "must be a non-negative integer",
                )
            })?;

        let poll_secs: u64 = std::env::var("ORCHESTRA_DEHYDRATION_POLL_SECS")
            .unwrap_or_else(|_| "30".to_string())
            .parse()
            .ok()
            .filter(|secs| *secs > 0)
            .ok_or(ConfigError::Invalid(
                "ORCHESTRA_DEHYDRATION_POLL_SECS",
                "must be a positive integer",
            ))?;

        let max_hydrated: usize = std::env::var("ORCHESTRA_MAX_HYDRATED_PROCESSES")
            .unwrap_or_else(|_| "0".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid(
                    "ORCHESTRA_MAX_HYDRATED_PROCESSES",
                    "must be a non-negative integer",
                )
            })?;

        Ok(Self {
            worker_cache_capacity,
            dehydration_idle: (idle_secs > 0).then(|| Duration::from_secs(idle_secs)),
            dehydration_poll_interval: Duration::from_secs(poll_secs),
            max_hydrated_processes: (max_hydrated > 0).then_some(max_hydrated),
        })
    }
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

    const VARS: [&str; 4] = [
        "ORCHESTRA_WORKER_CACHE_CAPACITY",
        "ORCHESTRA_DEHYDRATION_IDLE_SECS",
        "ORCHESTRA_DEHYDRATION_POLL_SECS",
        "ORCHESTRA_MAX_HYDRATED_PROCESSES",
    ];

    /// Helper to set env vars for a test and restore them after
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn clean() -> Self {
            let mut guard = Self { vars: Vec::new() };
            for key in VARS {
                guard.remove(key);
            }
            guard
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
        let _guard = EnvGuard::clean();

        let config = EngineConfig::from_env().unwrap();

        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.worker_cache_capacity, 1024);
        assert_eq!(config.dehydration_idle, Some(Duration::from_secs(300)));
        assert_eq!(config.max_hydrated_processes, None);
    }

    #[test]
    fn test_config_from_env_all_custom() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();

        guard.set("ORCHESTRA_WORKER_CACHE_CAPACITY", "16");
        guard.set("ORCHESTRA_DEHYDRATION_IDLE_SECS", "60");
        guard.set("ORCHESTRA_DEHYDRATION_POLL_SECS", "5");
        guard.set("ORCHESTRA_MAX_HYDRATED_PROCESSES", "8");

        let config = EngineConfig::from_env().unwrap();

        assert_eq!(config.worker_cache_capacity, 16);
        assert_eq!(config.dehydration_idle, Some(Duration::from_secs(60)));
        assert_eq!(config.dehydration_poll_interval, Duration::from_secs(5));
        assert_eq!(config.max_hydrated_processes, Some(8));
    }

    #[test]
    fn test_config_zero_idle_disables_dehydration() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();

        guard.set("ORCHESTRA_DEHYDRATION_IDLE_SECS", "0");

        let config = EngineConfig::from_env().unwrap();
        assert_eq!(config.dehydration_idle, None);
    }

    #[test]
    fn test_config_invalid_worker_capacity() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();

        guard.set("ORCHESTRA_WORKER_CACHE_CAPACITY", "0");

        let err = EngineConfig::from_env().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid("ORCHESTRA_WORKER_CACHE_CAPACITY", _)
        ));
        assert!(err.to_string().contains("ORCHESTRA_WORKER_CACHE_CAPACITY"));
    }

    #[test]
    fn test_config_invalid_poll_interval() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();

        guard.set("ORCHESTRA_DEHYDRATION_POLL_SECS", "soon");

        let result = EngineConfig::from_env();
        assert!(matches!(
            result,
            Err(ConfigError::Invalid("ORCHESTRA_DEHYDRATION_POLL_SECS", _))
        ));
    }
}
