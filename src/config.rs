//! Pool configuration
//!
//! This module defines the tunables for the tunnel pool and helpers for
//! loading them from a JSON file. The defaults reproduce the production
//! behaviour; tests shrink the timing fields to keep runtimes short.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ConfigError;

/// Default maximum number of simultaneously active tunnels
pub const DEFAULT_MAX_ACTIVE: usize = 8;

/// Age assigned to a tunnel on creation and on every successful open
pub const DEFAULT_INIT_AGE: u8 = 16;

/// Default number of open attempts before a tunnel is declared dead
pub const DEFAULT_OPEN_RETRIES: u32 = 3;

/// Default base delay between open attempts (milliseconds)
pub const DEFAULT_OPEN_RETRY_BASE_MS: u64 = 10_000;

/// Default backoff multiplier applied to the retry delay after each failure
pub const DEFAULT_OPEN_BACKOFF_MULTIPLIER: u32 = 6;

/// Default interval between activation-manager passes (milliseconds)
pub const DEFAULT_ACTIVATION_INTERVAL_MS: u64 = 150_000;

/// Default interval between expiry polls (milliseconds)
pub const DEFAULT_RECONNECT_POLL_MS: u64 = 1_000;

/// Tunnel pool configuration
///
/// All timing fields carry a random jitter drawn from the pool RNG, so that
/// a daemon configured with many tunnels does not reconnect them in
/// lock-step after an outage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Path of the persisted tunnel cache file.
    ///
    /// The rotation companions (`<path>.bak`, `<path>.tmp`) are derived
    /// from this path.
    pub cache_path: PathBuf,

    /// Maximum number of tunnels the activation manager keeps open
    pub max_active: usize,

    /// Age assigned on creation and on every successful open
    pub init_age: u8,

    /// Open attempts per worker before giving up
    pub open_retries: u32,

    /// Base delay between open attempts, in milliseconds
    pub open_retry_base_ms: u64,

    /// Jitter span added to the first retry delay, in milliseconds
    pub open_retry_jitter_ms: u64,

    /// Multiplier applied to the retry delay after each failed attempt
    pub open_backoff_multiplier: u32,

    /// Delay between activation-manager passes, in milliseconds
    pub activation_interval_ms: u64,

    /// Jitter span added to the activation pass delay, in milliseconds
    pub activation_jitter_ms: u64,

    /// Delay between reconnect-manager expiry polls, in milliseconds
    pub reconnect_poll_ms: u64,

    /// Jitter span added to the expiry poll delay, in milliseconds
    pub reconnect_jitter_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            cache_path: PathBuf::from("TUNNELS"),
            max_active: DEFAULT_MAX_ACTIVE,
            init_age: DEFAULT_INIT_AGE,
            open_retries: DEFAULT_OPEN_RETRIES,
            open_retry_base_ms: DEFAULT_OPEN_RETRY_BASE_MS,
            open_retry_jitter_ms: 1_000,
            open_backoff_multiplier: DEFAULT_OPEN_BACKOFF_MULTIPLIER,
            activation_interval_ms: DEFAULT_ACTIVATION_INTERVAL_MS,
            activation_jitter_ms: 10_000,
            reconnect_poll_ms: DEFAULT_RECONNECT_POLL_MS,
            reconnect_jitter_ms: 1_000,
        }
    }
}

impl PoolConfig {
    /// Create a configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the cache file path
    #[must_use]
    pub fn with_cache_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.cache_path = path.into();
        self
    }

    /// Set the maximum number of active tunnels
    #[must_use]
    pub fn with_max_active(mut self, max_active: usize) -> Self {
        self.max_active = max_active;
        self
    }

    /// Set the number of open attempts per worker
    #[must_use]
    pub fn with_open_retries(mut self, retries: u32) -> Self {
        self.open_retries = retries;
        self
    }

    /// Set the base retry delay in milliseconds
    #[must_use]
    pub fn with_open_retry_base_ms(mut self, ms: u64) -> Self {
        self.open_retry_base_ms = ms;
        self
    }

    /// Set the activation pass interval in milliseconds
    #[must_use]
    pub fn with_activation_interval_ms(mut self, ms: u64) -> Self {
        self.activation_interval_ms = ms;
        self
    }

    /// Set the expiry poll interval in milliseconds
    #[must_use]
    pub fn with_reconnect_poll_ms(mut self, ms: u64) -> Self {
        self.reconnect_poll_ms = ms;
        self
    }

    /// Get the activation pass interval as a `Duration`
    pub fn activation_interval(&self) -> Duration {
        Duration::from_millis(self.activation_interval_ms)
    }

    /// Get the expiry poll interval as a `Duration`
    pub fn reconnect_poll(&self) -> Duration {
        Duration::from_millis(self.reconnect_poll_ms)
    }

    /// Get the base open retry delay as a `Duration`
    pub fn open_retry_base(&self) -> Duration {
        Duration::from_millis(self.open_retry_base_ms)
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if any field is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_active == 0 {
            return Err(ConfigError::validation("max_active must be at least 1"));
        }
        if self.init_age == 0 {
            return Err(ConfigError::validation(
                "init_age must be non-zero; age 0 marks a record as not persistable",
            ));
        }
        if self.open_retries == 0 {
            return Err(ConfigError::validation("open_retries must be at least 1"));
        }
        if self.open_backoff_multiplier == 0 {
            return Err(ConfigError::validation(
                "open_backoff_multiplier must be at least 1",
            ));
        }
        if self.cache_path.as_os_str().is_empty() {
            return Err(ConfigError::validation("cache_path must not be empty"));
        }
        Ok(())
    }
}

/// Load pool configuration from a JSON file
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be read or parsed.
pub fn load_config(path: impl AsRef<Path>) -> Result<PoolConfig, ConfigError> {
    let path = path.as_ref();

    debug!("Loading pool configuration from {:?}", path);

    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.display().to_string(),
        });
    }

    let contents = std::fs::read_to_string(path)?;
    let config: PoolConfig = serde_json::from_str(&contents)
        .map_err(|e| ConfigError::ParseError(format!("Failed to parse JSON: {e} at {path:?}")))?;

    config.validate()?;
    Ok(config)
}

/// Load pool configuration from a JSON string
///
/// # Errors
///
/// Returns `ConfigError` if parsing or validation fails.
pub fn load_config_str(json: &str) -> Result<PoolConfig, ConfigError> {
    let config: PoolConfig =
        serde_json::from_str(json).map_err(|e| ConfigError::ParseError(e.to_string()))?;
    config.validate()?;
    Ok(config)
}
