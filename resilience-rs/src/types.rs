//! # Error Types
//!
//! Errors raised by the resilience layer itself. Failures of the protected
//! operations are never surfaced through these types: they are recorded
//! against the breaker and answered by the fallback chain, so the only
//! errors a caller sees are misuse (unknown service) or setup problems.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A type alias for Result with the error type defaulting to [`ResilienceError`]
pub type Result<T, E = ResilienceError> = std::result::Result<T, E>;

/// Errors returned by the public resilience API
#[derive(Debug, thiserror::Error)]
pub enum ResilienceError {
    /// The service name was never registered with the layer
    #[error("Unknown service: {0}")]
    UnknownService(String),

    /// The service name was registered twice
    #[error("Service already registered: {0}")]
    DuplicateService(String),

    /// Configuration could not be loaded or failed validation
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Structured logging could not be installed
    #[error("Logging initialization failed: {0}")]
    Logging(String),

    /// Audit persistence failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Audit entry could not be encoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Configuration loading and validation errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

/// Why a protected operation did not produce the primary result.
///
/// Carried into every fallback tier so a tier can tailor its degraded answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    /// The breaker was open and the reset timeout had not elapsed
    CircuitOpen,
    /// The emergency kill switch is active
    EmergencyStop,
    /// The operation did not settle within the timeout
    Timeout,
    /// The operation returned an error
    OperationFailed(String),
    /// The operation panicked
    Panicked,
}

impl FailureReason {
    /// Whether the real operation was attempted before falling back
    pub fn was_attempted(&self) -> bool {
        !matches!(self, FailureReason::CircuitOpen | FailureReason::EmergencyStop)
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::CircuitOpen => write!(f, "circuit open"),
            FailureReason::EmergencyStop => write!(f, "emergency stop active"),
            FailureReason::Timeout => write!(f, "operation timed out"),
            FailureReason::OperationFailed(msg) => write!(f, "operation failed: {}", msg),
            FailureReason::Panicked => write!(f, "operation panicked"),
        }
    }
}
