//! Error types for tunnel-pool
//!
//! Errors are categorized by subsystem. Most failures inside the pool are
//! absorbed where they happen (logged, folded into record state); the types
//! here cover the surfaces that do return `Result`: configuration loading
//! and cache-file persistence, plus the transport contract's error.

use std::io;

use thiserror::Error;

pub use crate::transport::TransportError;

/// Top-level error type for the tunnel pool
#[derive(Debug, Error)]
pub enum PoolError {
    /// Configuration errors (file parsing, validation)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Cache-file persistence errors
    #[error("Persistence error: {0}")]
    Persist(#[from] PersistError),

    /// Transport contract errors
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl PoolError {
    /// Check if this error is recoverable (can retry operation)
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(_) => false,
            Self::Persist(_) => true,
            Self::Transport(e) => e.is_recoverable(),
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
            ),
        }
    }
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File not found or inaccessible
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// JSON parsing error
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Validation error (invalid values, missing required fields)
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    /// I/O error while reading config
    #[error("I/O error reading configuration: {0}")]
    IoError(#[from] io::Error),
}

impl ConfigError {
    /// Config errors are not recoverable without user intervention
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::ValidationError(msg.into())
    }
}

/// Cache-file persistence errors
///
/// All of these are non-fatal at the pool level: the caller logs a warning
/// and carries on, and the next write attempts the full rotation again.
#[derive(Debug, Error)]
pub enum PersistError {
    /// Could not create or write the temporary cache file
    #[error("Failed to write cache file {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: io::Error,
    },

    /// Could not move the temporary file into place
    #[error("Failed to move cache file {from} to {to}: {source}")]
    Rename {
        from: String,
        to: String,
        #[source]
        source: io::Error,
    },
}

impl PersistError {
    /// Persistence failures are always retried on the next write
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        true
    }
}

/// Type alias for Result with `PoolError`
pub type Result<T> = std::result::Result<T, PoolError>;
