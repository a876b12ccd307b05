//! # Disttask Configuration
//!
//! Layered configuration for the dispatch manager: defaults, then
//! `config/base.toml`, then `config/<environment>.toml`, then environment
//! variables of the form `DISTTASK_<SECTION>__<FIELD>`.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use disttask_core::config::ConfigManager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load()?;
//! let interval = manager.config().dispatcher.dispatch_interval();
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod loader;

use crate::constants::{
    intervals, DEFAULT_DISPATCH_CONCURRENCY, DEFAULT_MAX_SUBTASK_RETRIES,
    DEFAULT_STORAGE_RETRY_TIMES,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigManager;

/// Root configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisttaskConfig {
    pub dispatcher: DispatcherConfig,
    pub logging: LoggingConfig,
}

impl DisttaskConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        self.dispatcher.validate()
    }
}

/// Manager and drive-loop tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Tasks orchestrated concurrently by one manager
    pub dispatch_concurrency: usize,
    pub dispatch_interval_ms: u64,
    pub detect_interval_ms: u64,
    /// Per-task drive loop tick
    pub check_task_interval_ms: u64,
    pub storage_retry_times: u32,
    pub storage_retry_backoff_ms: u64,
    /// Retryable subtask failures are re-queued at most this many times
    pub max_subtask_retries: u32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            dispatch_concurrency: DEFAULT_DISPATCH_CONCURRENCY,
            dispatch_interval_ms: intervals::DISPATCH_INTERVAL_MS,
            detect_interval_ms: intervals::DETECT_INTERVAL_MS,
            check_task_interval_ms: intervals::CHECK_TASK_INTERVAL_MS,
            storage_retry_times: DEFAULT_STORAGE_RETRY_TIMES,
            storage_retry_backoff_ms: intervals::STORAGE_RETRY_BACKOFF_MS,
            max_subtask_retries: DEFAULT_MAX_SUBTASK_RETRIES,
        }
    }
}

impl DispatcherConfig {
    pub fn dispatch_interval(&self) -> Duration {
        Duration::from_millis(self.dispatch_interval_ms)
    }

    pub fn detect_interval(&self) -> Duration {
        Duration::from_millis(self.detect_interval_ms)
    }

    pub fn check_task_interval(&self) -> Duration {
        Duration::from_millis(self.check_task_interval_ms)
    }

    pub fn storage_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.storage_retry_backoff_ms)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.dispatch_concurrency == 0 {
            return Err(ConfigurationError::invalid_value(
                "dispatcher.dispatch_concurrency",
                "0",
                "concurrency must be greater than 0",
            ));
        }

        let intervals = [
            ("dispatcher.dispatch_interval_ms", self.dispatch_interval_ms),
            ("dispatcher.detect_interval_ms", self.detect_interval_ms),
            ("dispatcher.check_task_interval_ms", self.check_task_interval_ms),
        ];
        for (field, value) in intervals {
            if value == 0 {
                return Err(ConfigurationError::invalid_value(
                    field,
                    "0",
                    "interval must be greater than 0",
                ));
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Emit JSON lines instead of human readable output
    pub json: bool,
    pub ansi: bool,
    /// Filter directive; `RUST_LOG` still takes precedence
    pub level: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            json: false,
            ansi: true,
            level: None,
        }
    }
}
