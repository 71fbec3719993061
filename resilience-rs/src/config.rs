//! # Configuration
//!
//! Tunables for breakers, the health sweep and the kill switch. Every value
//! has a default; `ResilienceConfig::load` layers an optional file and
//! `RESILIENCE__*` environment variables on top of them.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::ConfigError;

/// Configuration for a single service's circuit breaker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip a closed circuit
    pub failure_threshold: u32,
    /// Consecutive half-open successes needed to close the circuit
    pub success_threshold: u32,
    /// How long the circuit stays open before probing, in milliseconds
    pub reset_timeout_ms: u64,
    /// Per-operation timeout, in milliseconds
    pub timeout_ms: u64,
    /// Size of the rolling window used for the success rate
    pub window_size: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            reset_timeout_ms: 30_000,
            timeout_ms: 5_000,
            window_size: 100,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    fn validate(&self, scope: &str) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::InvalidValue(format!(
                "{}.failure_threshold must be at least 1",
                scope
            )));
        }
        if self.success_threshold == 0 {
            return Err(ConfigError::InvalidValue(format!(
                "{}.success_threshold must be at least 1",
                scope
            )));
        }
        if self.timeout_ms == 0 {
            return Err(ConfigError::InvalidValue(format!(
                "{}.timeout_ms must be positive",
                scope
            )));
        }
        if self.window_size == 0 {
            return Err(ConfigError::InvalidValue(format!(
                "{}.window_size must be positive",
                scope
            )));
        }
        Ok(())
    }
}

/// Configuration for the periodic health sweep
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Interval between sweeps, in milliseconds
    pub sweep_interval_ms: u64,
    /// Services below this success rate are flagged unhealthy
    pub min_success_rate: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            sweep_interval_ms: 10_000,
            min_success_rate: 0.8,
        }
    }
}

impl HealthConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

/// Configuration for the emergency kill switch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KillSwitchConfig {
    /// Global budget for the whole shutdown fan-out, in milliseconds
    pub shutdown_timeout_ms: u64,
    /// Window in which three cancel presses trigger the switch, in milliseconds
    pub triple_press_window_ms: u64,
    /// Append-only JSON-lines file mirroring the audit log
    pub audit_log_path: Option<PathBuf>,
}

impl Default for KillSwitchConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout_ms: 5_000,
            triple_press_window_ms: 1_000,
            audit_log_path: None,
        }
    }
}

impl KillSwitchConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn triple_press_window(&self) -> Duration {
        Duration::from_millis(self.triple_press_window_ms)
    }
}

/// Top-level configuration for the resilience layer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Breaker settings applied to every service without an override
    pub breaker: CircuitBreakerConfig,
    /// Per-service breaker overrides
    pub service_overrides: HashMap<String, CircuitBreakerConfig>,
    pub health: HealthConfig,
    pub kill_switch: KillSwitchConfig,
}

impl ResilienceConfig {
    /// Loads configuration from `.env`, an optional file and the environment
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();

        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("RESILIENCE")
                .prefix_separator("__")
                .separator("__"),
        );

        let config: ResilienceConfig = builder.build()?.try_deserialize()?;
        config.validate()?;

        debug!(
            failure_threshold = config.breaker.failure_threshold,
            reset_timeout_ms = config.breaker.reset_timeout_ms,
            shutdown_timeout_ms = config.kill_switch.shutdown_timeout_ms,
            "Resilience configuration loaded"
        );

        Ok(config)
    }

    /// Breaker configuration for a service, honouring overrides
    pub fn breaker_for(&self, service: &str) -> &CircuitBreakerConfig {
        self.service_overrides.get(service).unwrap_or(&self.breaker)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.breaker.validate("breaker")?;
        for (service, overrides) in &self.service_overrides {
            overrides.validate(&format!("service_overrides.{}", service))?;
        }
        if !(0.0..=1.0).contains(&self.health.min_success_rate) {
            return Err(ConfigError::InvalidValue(
                "health.min_success_rate must be within [0, 1]".to_string(),
            ));
        }
        if self.health.sweep_interval_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "health.sweep_interval_ms must be positive".to_string(),
            ));
        }
        if self.kill_switch.shutdown_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "kill_switch.shutdown_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = ResilienceConfig::default();
        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(config.breaker.success_threshold, 3);
        assert_eq!(config.breaker.reset_timeout(), Duration::from_secs(30));
        assert_eq!(config.breaker.timeout(), Duration::from_secs(5));
        assert_eq!(config.health.sweep_interval(), Duration::from_secs(10));
        assert_eq!(config.kill_switch.shutdown_timeout(), Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_breaker_override_lookup() {
        let mut config = ResilienceConfig::default();
        config.service_overrides.insert(
            "video_stream".to_string(),
            CircuitBreakerConfig {
                failure_threshold: 2,
                ..CircuitBreakerConfig::default()
            },
        );

        assert_eq!(config.breaker_for("video_stream").failure_threshold, 2);
        assert_eq!(config.breaker_for("sensor_feed").failure_threshold, 5);
    }

    #[test]
    fn test_validation_rejects_zero_threshold() {
        let mut config = ResilienceConfig::default();
        config.breaker.failure_threshold = 0;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidValue(_))));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[breaker]\nfailure_threshold = 7\n\n[kill_switch]\nshutdown_timeout_ms = 2500"
        )
        .unwrap();

        let config = ResilienceConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.breaker.failure_threshold, 7);
        assert_eq!(config.breaker.success_threshold, 3);
        assert_eq!(config.kill_switch.shutdown_timeout_ms, 2500);
    }
}
