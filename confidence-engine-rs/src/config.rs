//! # Configuration
//!
//! Every heuristic constant of the scoring pipeline lives here with its
//! default value. `EngineConfig::load` layers an optional file and
//! `CONFIDENCE__*` environment variables on top of the defaults.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::ConfigError;

/// Weights of the four components in the final score
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComponentWeights {
    pub consensus: f64,
    pub source_reliability: f64,
    pub historical_accuracy: f64,
    pub freshness: f64,
}

impl Default for ComponentWeights {
    fn default() -> Self {
        Self {
            consensus: 0.40,
            source_reliability: 0.25,
            historical_accuracy: 0.20,
            freshness: 0.15,
        }
    }
}

impl ComponentWeights {
    fn total(&self) -> f64 {
        self.consensus + self.source_reliability + self.historical_accuracy + self.freshness
    }
}

/// Lower bounds of the display bands
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BandThresholds {
    pub high: f64,
    pub medium: f64,
    pub low: f64,
}

impl Default for BandThresholds {
    fn default() -> Self {
        Self {
            high: 0.85,
            medium: 0.65,
            low: 0.45,
        }
    }
}

/// Penalty applied when providers disagree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisagreementConfig {
    /// Standard deviation tolerated without penalty
    pub tolerance: f64,
    /// Penalty per unit of standard deviation above the tolerance
    pub factor: f64,
}

impl Default for DisagreementConfig {
    fn default() -> Self {
        Self {
            tolerance: 0.15,
            factor: 0.5,
        }
    }
}

/// Historical reliability of one source kind
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SourceReliability {
    pub reliability: f64,
    pub sample_size: u64,
}

impl SourceReliability {
    pub fn new(reliability: f64, sample_size: u64) -> Self {
        Self {
            reliability,
            sample_size,
        }
    }
}

/// One step of the tiered freshness curve
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FreshnessTier {
    /// Sources younger than this many minutes get `score`
    pub max_age_minutes: f64,
    pub score: f64,
}

/// How a source's age maps to a freshness score
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum FreshnessPolicy {
    /// Step function over age; sources older than every tier get `stale`
    Tiered { tiers: Vec<FreshnessTier>, stale: f64 },
    /// Half-life decay from `initial`, never below `floor`
    Exponential {
        half_life_minutes: f64,
        initial: f64,
        floor: f64,
    },
}

impl Default for FreshnessPolicy {
    fn default() -> Self {
        FreshnessPolicy::Tiered {
            tiers: vec![
                FreshnessTier { max_age_minutes: 5.0, score: 1.0 },
                FreshnessTier { max_age_minutes: 30.0, score: 0.9 },
                FreshnessTier { max_age_minutes: 120.0, score: 0.7 },
                FreshnessTier { max_age_minutes: 1440.0, score: 0.5 },
            ],
            stale: 0.2,
        }
    }
}

impl FreshnessPolicy {
    /// The decay used for camera calibration confidence
    pub fn calibration_decay() -> Self {
        FreshnessPolicy::Exponential {
            half_life_minutes: 45.0,
            initial: 0.95,
            floor: 0.5,
        }
    }
}

/// Rolling trend buffers and drift detection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrendConfig {
    /// Points kept per insight type
    pub capacity: usize,
    /// Size of the recent and prior windows compared for drift
    pub window: usize,
    /// Drop in window mean that raises a degradation alert
    pub drop_threshold: f64,
    /// Alerts kept for `recent_alerts`
    pub alert_history: usize,
}

impl Default for TrendConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            window: 10,
            drop_threshold: 0.10,
            alert_history: 50,
        }
    }
}

/// Top-level configuration for the confidence engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub weights: ComponentWeights,
    pub bands: BandThresholds,
    pub disagreement: DisagreementConfig,
    pub freshness: FreshnessPolicy,
    pub trend: TrendConfig,

    /// Per-provider query budget, in milliseconds
    pub provider_timeout_ms: u64,
    /// Added to a provider's confidence for insight types it is strong at
    pub strength_bonus: f64,
    /// Subtracted from a provider's confidence for insight types it is weak at
    pub weakness_penalty: f64,

    pub score_floor: f64,
    pub score_ceiling: f64,
    /// Score of a degraded result
    pub degraded_score: f64,

    pub no_source_reliability: f64,
    pub no_source_freshness: f64,
    pub unknown_source: SourceReliability,
    pub source_reliability: HashMap<String, SourceReliability>,

    pub default_historical_accuracy: f64,
    pub historical_accuracy: HashMap<String, f64>,
    /// Smoothing factor for verified outcomes fed back into historical accuracy
    pub outcome_smoothing: f64,

    /// Scored insights kept in the cache
    pub cache_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let source_reliability = [
            ("live_video_feed", 0.92, 1_500),
            ("sensor_data", 0.95, 2_000),
            ("historical_stats", 0.88, 5_000),
            ("scouting_report", 0.75, 300),
            ("social_media", 0.45, 200),
        ]
        .into_iter()
        .map(|(kind, r, n)| (kind.to_string(), SourceReliability::new(r, n)))
        .collect();

        let historical_accuracy = [
            ("biomechanics", 0.91),
            ("performance_prediction", 0.87),
            ("injury_risk", 0.84),
            ("character_assessment", 0.78),
            ("tactical_analysis", 0.85),
        ]
        .into_iter()
        .map(|(kind, accuracy)| (kind.to_string(), accuracy))
        .collect();

        Self {
            weights: ComponentWeights::default(),
            bands: BandThresholds::default(),
            disagreement: DisagreementConfig::default(),
            freshness: FreshnessPolicy::default(),
            trend: TrendConfig::default(),
            provider_timeout_ms: 3_000,
            strength_bonus: 0.05,
            weakness_penalty: 0.10,
            score_floor: 0.01,
            score_ceiling: 0.99,
            degraded_score: 0.25,
            no_source_reliability: 0.3,
            no_source_freshness: 0.5,
            unknown_source: SourceReliability::new(0.5, 1),
            source_reliability,
            default_historical_accuracy: 0.80,
            historical_accuracy,
            outcome_smoothing: 0.05,
            cache_capacity: 1_000,
        }
    }
}

fn check_unit(name: &str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::InvalidValue(format!(
            "{} must be within [0, 1], got {}",
            name, value
        )))
    }
}

impl EngineConfig {
    pub fn provider_timeout(&self) -> Duration {
        Duration::from_millis(self.provider_timeout_ms)
    }

    /// Loads configuration from `.env`, an optional file and the environment
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();

        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("CONFIDENCE")
                .prefix_separator("__")
                .separator("__"),
        );

        let config: EngineConfig = builder.build()?.try_deserialize()?;
        config.validate()?;

        debug!(
            provider_timeout_ms = config.provider_timeout_ms,
            cache_capacity = config.cache_capacity,
            source_kinds = config.source_reliability.len(),
            "Confidence engine configuration loaded"
        );

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let weights = &self.weights;
        for (name, value) in [
            ("weights.consensus", weights.consensus),
            ("weights.source_reliability", weights.source_reliability),
            ("weights.historical_accuracy", weights.historical_accuracy),
            ("weights.freshness", weights.freshness),
        ] {
            check_unit(name, value)?;
        }
        if (weights.total() - 1.0).abs() > 1e-6 {
            return Err(ConfigError::InvalidValue(format!(
                "component weights must sum to 1, got {}",
                weights.total()
            )));
        }

        let bands = &self.bands;
        if !(bands.low <= bands.medium && bands.medium <= bands.high) {
            return Err(ConfigError::InvalidValue(
                "band thresholds must satisfy low <= medium <= high".to_string(),
            ));
        }
        check_unit("bands.high", bands.high)?;
        check_unit("bands.low", bands.low)?;

        check_unit("score_floor", self.score_floor)?;
        check_unit("score_ceiling", self.score_ceiling)?;
        if self.score_floor > self.score_ceiling {
            return Err(ConfigError::InvalidValue(
                "score_floor must not exceed score_ceiling".to_string(),
            ));
        }
        check_unit("degraded_score", self.degraded_score)?;
        check_unit("strength_bonus", self.strength_bonus)?;
        check_unit("weakness_penalty", self.weakness_penalty)?;
        check_unit("no_source_reliability", self.no_source_reliability)?;
        check_unit("no_source_freshness", self.no_source_freshness)?;
        check_unit("unknown_source.reliability", self.unknown_source.reliability)?;
        check_unit("default_historical_accuracy", self.default_historical_accuracy)?;
        check_unit("outcome_smoothing", self.outcome_smoothing)?;

        for (kind, source) in &self.source_reliability {
            check_unit(&format!("source_reliability.{}", kind), source.reliability)?;
        }
        for (kind, accuracy) in &self.historical_accuracy {
            check_unit(&format!("historical_accuracy.{}", kind), *accuracy)?;
        }

        match &self.freshness {
            FreshnessPolicy::Tiered { tiers, stale } => {
                check_unit("freshness.stale", *stale)?;
                for tier in tiers {
                    check_unit("freshness.tiers.score", tier.score)?;
                }
            }
            FreshnessPolicy::Exponential {
                half_life_minutes,
                initial,
                floor,
            } => {
                if !(half_life_minutes.is_finite() && *half_life_minutes > 0.0) {
                    return Err(ConfigError::InvalidValue(
                        "freshness.half_life_minutes must be positive".to_string(),
                    ));
                }
                check_unit("freshness.initial", *initial)?;
                check_unit("freshness.floor", *floor)?;
            }
        }

        if self.provider_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "provider_timeout_ms must be positive".to_string(),
            ));
        }
        if self.cache_capacity == 0 {
            return Err(ConfigError::InvalidValue(
                "cache_capacity must be positive".to_string(),
            ));
        }
        if self.trend.window == 0 || self.trend.capacity < 2 * self.trend.window {
            return Err(ConfigError::InvalidValue(
                "trend.capacity must hold two non-empty windows".to_string(),
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
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.provider_timeout(), Duration::from_secs(3));
        assert_eq!(config.historical_accuracy["performance_prediction"], 0.87);
        assert_eq!(config.source_reliability["sensor_data"].sample_size, 2_000);
    }

    #[test]
    fn test_weights_must_sum_to_one() {
        let mut config = EngineConfig::default();
        config.weights.consensus = 0.5;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidValue(_))));
    }

    #[test]
    fn test_inverted_bands_rejected() {
        let mut config = EngineConfig::default();
        config.bands.medium = 0.9;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_calibration_decay_is_valid() {
        let config = EngineConfig {
            freshness: FreshnessPolicy::calibration_decay(),
            ..EngineConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "provider_timeout_ms = 1500\ncache_capacity = 10\n\n[bands]\nhigh = 0.9"
        )
        .unwrap();

        let config = EngineConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.provider_timeout_ms, 1500);
        assert_eq!(config.cache_capacity, 10);
        assert_eq!(config.bands.high, 0.9);
        assert_eq!(config.bands.medium, 0.65);
    }
}
