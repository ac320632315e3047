//! Configuration system for the loading pipeline
//!
//! Hosts either pick one of the [`SchedulerProfile`] presets or build a
//! [`SchedulerConfig`] directly. Configurations are plain serde types so they
//! can also be read from a JSON settings file.

use crate::constants::{BASE_THREADS, KEEP_ALIVE_SECS, PARTICIPANTS_PER_THREAD, THREAD_NAME_PREFIX};
use crate::{Result, SchedulerError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerProfile {
    Balanced,
    LowResource,
    HighThroughput,
    Custom(SchedulerConfig),
}

impl SchedulerProfile {
    pub fn resolve(&self) -> SchedulerConfig {
        match self {
            Self::Balanced => SchedulerConfig::default(),
            Self::LowResource => SchedulerConfig {
                pool: PoolConfig {
                    base_threads: 1,
                    participants_per_thread: 100,
                    keep_alive_secs: 15,
                    thread_name_prefix: THREAD_NAME_PREFIX.to_string(),
                },
                resident_cache_size: 256,
            },
            Self::HighThroughput => SchedulerConfig::high_throughput(),
            Self::Custom(config) => config.clone(),
        }
    }
}

impl Default for SchedulerProfile {
    fn default() -> Self {
        Self::Balanced
    }
}

/// Sizing policy for the worker pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Worker floor
    pub base_threads: usize,
    /// One extra worker per this many participants
    pub participants_per_thread: usize,
    /// Idle time after which a worker above the floor exits
    pub keep_alive_secs: u64,
    pub thread_name_prefix: String,
}

impl PoolConfig {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    /// Worker floor for the given participant count, never below `base_threads`
    pub fn core_size_for(&self, participants: usize) -> usize {
        self.base_threads
            .max(participants / self.participants_per_thread.max(1))
    }

    pub fn validate(&self) -> Result<()> {
        if self.base_threads == 0 {
            return Err(SchedulerError::Config(
                "base_threads must be at least 1".to_string(),
            ));
        }
        if self.participants_per_thread == 0 {
            return Err(SchedulerError::Config(
                "participants_per_thread must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            base_threads: BASE_THREADS,
            participants_per_thread: PARTICIPANTS_PER_THREAD,
            keep_alive_secs: KEEP_ALIVE_SECS,
            thread_name_prefix: THREAD_NAME_PREFIX.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub pool: PoolConfig,
    /// Capacity of the reference [`crate::ResidentCache`]
    pub resident_cache_size: usize,
}

impl SchedulerConfig {
    pub fn high_throughput() -> Self {
        Self {
            pool: PoolConfig {
                base_threads: 4,
                participants_per_thread: 25,
                ..PoolConfig::default()
            },
            resident_cache_size: 4096,
        }
    }

    pub fn for_testing() -> Self {
        Self {
            pool: PoolConfig {
                base_threads: 1,
                participants_per_thread: 50,
                keep_alive_secs: 1,
                thread_name_prefix: "Test I/O Thread".to_string(),
            },
            resident_cache_size: 64,
        }
    }

    /// Parse a configuration from JSON. Missing fields fall back to defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        self.pool.validate()?;
        if self.resident_cache_size == 0 {
            return Err(SchedulerError::Config(
                "resident_cache_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            resident_cache_size: 1024,
        }
    }
}
