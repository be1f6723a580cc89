//! Error types shared by every session.
//!
//! Synchronous misuse (starting twice, connecting from the wrong state) and
//! missing radio capabilities are reported as [`BleError`]. Failures that the
//! platform reports asynchronously never surface here; the owning session
//! recovers and emits a terminal event instead.

use thiserror::Error;
use uuid::Uuid;

use crate::config::ConfigError;

/// Failure reported synchronously by a platform radio call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PlatformError {
    #[error("Request refused: {0}")]
    Refused(String),
    #[error("Component unavailable: {0}")]
    Unavailable(String),
    #[error("Backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BleError {
    #[error("Radio unavailable: {0}")]
    RadioUnavailable(String),
    #[error("Operation already active")]
    AlreadyActive,
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Platform operation failed: {0}")]
    PlatformOperationFailed(#[from] PlatformError),
    #[error("Attribute not found: {0}")]
    AttributeNotFound(Uuid),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),
}

pub type Result<T> = std::result::Result<T, BleError>;
