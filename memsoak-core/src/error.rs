//! Error types for memsoak-core.

use thiserror::Error;

/// Result type alias using memsoak-core Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for soak runs
#[derive(Error, Debug)]
pub enum Error {
    // Soak checks
    #[error("sys memory exceeds limit: {sampled} bytes (limit {limit} bytes)")]
    MemoryCeilingExceeded { sampled: u64, limit: u64 },

    #[error("expected established tunnels: count {current} did not advance past {previous}")]
    ProgressStalled { previous: u64, current: u64 },

    // Controller errors
    #[error("error creating controller: {0}")]
    ControllerConstruction(String),

    #[error("controller task failed: {0}")]
    ControllerTask(String),

    #[error("controller already running")]
    ControllerAlreadyRunning,

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Create a controller construction error
    pub fn construction(message: impl Into<String>) -> Self {
        Self::ControllerConstruction(message.into())
    }

    /// Create an invalid configuration error
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    /// True for the two soak-check failures (memory ceiling and stall),
    /// as opposed to setup or controller errors.
    pub fn is_fatal_check(&self) -> bool {
        matches!(
            self,
            Self::MemoryCeilingExceeded { .. } | Self::ProgressStalled { .. }
        )
    }
}
