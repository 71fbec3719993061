//! # Error Types
//!
//! `ScoringError` is the typed boundary of a scoring run. The engine's public
//! `score_insight` never returns it: it is converted into a degraded,
//! REJECT-band result. `ProviderFailure` is narrower still and never leaves
//! the engine; it becomes a zero-confidence opinion.

/// A type alias for Result with the error type defaulting to [`ScoringError`]
pub type Result<T, E = ScoringError> = std::result::Result<T, E>;

/// Errors that abort a scoring run
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ScoringError {
    /// The insight cannot be scored as given
    #[error("Invalid insight: {0}")]
    InvalidInsight(String),

    /// A component score came out NaN or infinite
    #[error("Non-finite {component} score")]
    NonFiniteComponent { component: &'static str },

    /// The engine configuration is unusable
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A pluggable component panicked mid-run
    #[error("Scoring panicked: {0}")]
    Panicked(String),
}

impl From<ConfigError> for ScoringError {
    fn from(err: ConfigError) -> Self {
        ScoringError::InvalidConfig(err.to_string())
    }
}

/// Why a single opinion provider produced no usable opinion
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProviderFailure {
    #[error("provider error: {0}")]
    Error(String),

    #[error("provider timed out after {0} ms")]
    Timeout(u64),

    #[error("provider panicked")]
    Panicked,

    #[error("provider returned non-finite confidence")]
    NonFiniteConfidence,
}

/// Configuration loading and validation errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}
