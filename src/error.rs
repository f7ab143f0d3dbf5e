//! Top-level error types for the suspend/alarm core.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Error kinds (§7 of the design spec).
///
/// The Suspend State Machine itself never propagates these: every abnormal
/// situation there maps to a state transition instead. This enum is for the
/// Alarm Engine, IPC layer, and config loading, which do return `Result`.
#[derive(Debug, Error, Clone)]
pub enum CoreError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("platform HAL error: {0}")]
    PlatformHal(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<sled::Error> for CoreError {
    fn from(err: sled::Error) -> Self {
        CoreError::Persistence(err.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Validation(err.to_string())
    }
}

impl From<toml::de::Error> for CoreError {
    fn from(err: toml::de::Error) -> Self {
        CoreError::Config(err.to_string())
    }
}

/// Transient platform failures are retried at the next heartbeat rather than
/// surfaced to callers (§7 "Transient platform").
pub fn is_transient(err: &CoreError) -> bool {
    matches!(err, CoreError::PlatformHal(_))
}
