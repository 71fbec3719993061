//! # Confidence Engine
//!
//! Decides how much an insight can be trusted before it is shown.
//!
//! ## Features
//!
//! - Concurrent opinion providers with per-provider timeout and panic isolation
//! - Weighted consensus with a disagreement penalty
//! - Source reliability, historical accuracy and freshness components
//! - HIGH / MEDIUM / LOW / REJECT display bands with a readable rationale
//! - Fail-closed scoring: errors yield a degraded REJECT result
//! - Per-type drift detection with broadcast alerts
//!

pub mod types;
pub mod config;
pub mod model;
pub mod provider;
pub mod scoring;
pub mod rationale;
pub mod trend;
pub mod cache;
pub mod engine;

// Re-export commonly used types
pub use types::{ConfigError, ProviderFailure, Result, ScoringError};
pub use config::{
    BandThresholds, ComponentWeights, DisagreementConfig, EngineConfig, FreshnessPolicy,
    FreshnessTier, SourceReliability, TrendConfig,
};
pub use model::{
    ComponentScores, ConfidenceBand, Insight, ProviderOpinion, ScoreRequest, ScoredInsight, Source,
};
pub use provider::{default_providers, HeuristicProvider, Opinion, OpinionProvider, ProviderProfile};
pub use rationale::{RationaleGenerator, TemplateRationale};
pub use trend::{DegradationAlert, TrendPoint};
pub use engine::{ConfidenceEngine, ConfidenceEngineBuilder};
