//! Bridge configuration types and defaults.
//!
//! This module defines the configuration options for an event loop,
//! including thread pool size, clock source and engine resource limits.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default number of thread pool workers
pub const DEFAULT_THREAD_POOL_SIZE: usize = 4;

/// Upper bound for the thread pool
pub const MAX_THREAD_POOL_SIZE: usize = 1024;

/// Default suggested size for stream read buffers (64 KB)
pub const DEFAULT_READ_BUFFER_SIZE: usize = 64 * 1024;

/// Default maximum number of live handles per loop
pub const DEFAULT_MAX_HANDLES: usize = 65_536;

/// Default maximum number of in-flight requests per loop
pub const DEFAULT_MAX_REQUESTS: usize = 65_536;

/// Default process exit polling interval in milliseconds
pub const DEFAULT_PROCESS_POLL_INTERVAL_MS: u64 = 5;

/// Environment variable that overrides the thread pool size
pub const THREADPOOL_SIZE_ENV: &str = "UV_THREADPOOL_SIZE";

/// Clock source driving a loop's notion of "now"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ClockMode {
    /// Real monotonic time
    Monotonic,
    /// Time only moves when advanced explicitly
    Manual,
}

/// Configuration for an event loop
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeConfig {
    /// Number of thread pool workers (default: 4)
    #[serde(default = "default_thread_pool_size")]
    pub thread_pool_size: usize,

    /// Clock source (default: monotonic)
    #[serde(default = "default_clock")]
    pub clock: ClockMode,

    /// Suggested size passed to stream allocation callbacks (default: 64KB)
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,

    /// Maximum live handles before `init` fails with ENOMEM
    #[serde(default = "default_max_handles")]
    pub max_handles: usize,

    /// Maximum in-flight requests before submission fails with ENOMEM
    #[serde(default = "default_max_requests")]
    pub max_requests: usize,

    /// How often running child processes are polled for exit
    #[serde(default = "default_process_poll_interval")]
    pub process_poll_interval_ms: u64,

    /// Emit a trace event for every retain/release (default: false)
    #[serde(default)]
    pub trace_refcounts: bool,

    /// Account time spent blocked in the poll phase (default: false)
    #[serde(default)]
    pub metrics_idle_time: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            thread_pool_size: DEFAULT_THREAD_POOL_SIZE,
            clock: ClockMode::Monotonic,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            max_handles: DEFAULT_MAX_HANDLES,
            max_requests: DEFAULT_MAX_REQUESTS,
            process_poll_interval_ms: DEFAULT_PROCESS_POLL_INTERVAL_MS,
            trace_refcounts: false,
            metrics_idle_time: false,
        }
    }
}

impl BridgeConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a configuration from JSON
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    /// Apply overrides from the process environment
    pub fn with_env_overrides(mut self) -> Result<Self, ConfigError> {
        if let Ok(value) = std::env::var(THREADPOOL_SIZE_ENV) {
            let size = value
                .trim()
                .parse::<usize>()
                .map_err(|e| ConfigError::InvalidValue {
                    field: THREADPOOL_SIZE_ENV.into(),
                    reason: e.to_string(),
                })?;
            // Same clamping libuv applies to the variable
            self.thread_pool_size = size.clamp(1, MAX_THREAD_POOL_SIZE);
        }
        Ok(self)
    }

    /// Set the thread pool size
    pub fn with_thread_pool_size(mut self, size: usize) -> Self {
        self.thread_pool_size = size;
        self
    }

    /// Set the clock source
    pub fn with_clock(mut self, clock: ClockMode) -> Self {
        self.clock = clock;
        self
    }

    /// Set the suggested read buffer size
    pub fn with_read_buffer_size(mut self, bytes: usize) -> Self {
        self.read_buffer_size = bytes;
        self
    }

    /// Set the handle limit
    pub fn with_max_handles(mut self, max: usize) -> Self {
        self.max_handles = max;
        self
    }

    /// Set the in-flight request limit
    pub fn with_max_requests(mut self, max: usize) -> Self {
        self.max_requests = max;
        self
    }

    /// Set the process exit polling interval
    pub fn with_process_poll_interval(mut self, interval: Duration) -> Self {
        self.process_poll_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Enable or disable refcount tracing
    pub fn with_trace_refcounts(mut self, enable: bool) -> Self {
        self.trace_refcounts = enable;
        self
    }

    /// Enable or disable idle time accounting
    pub fn with_metrics_idle_time(mut self, enable: bool) -> Self {
        self.metrics_idle_time = enable;
        self
    }

    /// Process poll interval as a duration
    pub fn process_poll_interval(&self) -> Duration {
        Duration::from_millis(self.process_poll_interval_ms)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.thread_pool_size == 0 || self.thread_pool_size > MAX_THREAD_POOL_SIZE {
            return Err(ConfigError::InvalidValue {
                field: "thread_pool_size".into(),
                reason: format!("must be between 1 and {}", MAX_THREAD_POOL_SIZE),
            });
        }

        if self.read_buffer_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "read_buffer_size".into(),
                reason: "must be greater than 0".into(),
            });
        }

        if self.max_handles == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_handles".into(),
                reason: "must be greater than 0".into(),
            });
        }

        if self.max_requests == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_requests".into(),
                reason: "must be greater than 0".into(),
            });
        }

        if self.process_poll_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "process_poll_interval_ms".into(),
                reason: "must be at least 1ms".into(),
            });
        }

        Ok(())
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Invalid configuration value
    #[error("Invalid configuration value for {field}: {reason}")]
    InvalidValue {
        /// The field name
        field: String,
        /// The reason it's invalid
        reason: String,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

// Default value functions for serde
fn default_thread_pool_size() -> usize {
    DEFAULT_THREAD_POOL_SIZE
}

fn default_clock() -> ClockMode {
    ClockMode::Monotonic
}

fn default_read_buffer_size() -> usize {
    DEFAULT_READ_BUFFER_SIZE
}

fn default_max_handles() -> usize {
    DEFAULT_MAX_HANDLES
}

fn default_max_requests() -> usize {
    DEFAULT_MAX_REQUESTS
}

fn default_process_poll_interval() -> u64 {
    DEFAULT_PROCESS_POLL_INTERVAL_MS
}
