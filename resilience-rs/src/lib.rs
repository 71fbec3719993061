//! # Resilience Layer
//!
//! Client-side protection for calls to named external services and a global
//! emergency stop for the critical systems behind them.
//!
//! ## Features
//!
//! - Per-service circuit breaker (closed, open, half-open)
//! - Three-tier fallback chain ending in a static emergency stub
//! - Passive health report and periodic health sweep
//! - Emergency kill switch with a bounded shutdown budget
//! - Append-only audit log with optional durable JSON-lines mirror
//! - Structured logging and layered configuration
//!

pub mod types;
pub mod config;
pub mod logging;
pub mod circuit_breaker;
pub mod fallback;
pub mod health;
pub mod audit;
pub mod kill_switch;
pub mod layer;

// Re-export commonly used types
pub use types::{ConfigError, FailureReason, ResilienceError, Result};
pub use config::{CircuitBreakerConfig, HealthConfig, KillSwitchConfig, ResilienceConfig};
pub use logging::{init_logging, LoggingConfig};
pub use circuit_breaker::{CircuitState, ServiceBreaker};
pub use fallback::{ExecutionOutcome, FallbackChain, FallbackContext, FallbackTier, ResultSource};
pub use health::{HealthMonitor, HealthReport, HealthStatus, ServiceHealth};
pub use audit::{AuditAction, AuditEntry, AuditLog, AuditSink, AuditStatus, JsonlAuditSink};
pub use kill_switch::{
    shutdown_fn, EmergencyKillSwitch, ShutdownHandler, ShutdownReport, ShutdownStatus,
    TriggerSource, TriplePressDetector,
};
pub use layer::{ResilienceLayer, ResilienceLayerBuilder};

/// Initializes logging and loads configuration from `path` and the environment
pub fn init_with_config(path: Option<&std::path::Path>) -> Result<ResilienceConfig> {
    let mut builder = ::config::Config::builder();
    if let Some(path) = path {
        builder = builder.add_source(::config::File::from(path).required(false));
    }
    let logging = builder
        .build()
        .ok()
        .and_then(|cfg| LoggingConfig::try_from(cfg).ok());

    init_logging(logging)?;
    Ok(ResilienceConfig::load(path)?)
}
