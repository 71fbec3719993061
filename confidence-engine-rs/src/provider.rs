//! # Opinion Providers
//!
//! Independent scorers queried concurrently for every insight. A provider
//! only reports its own confidence; weighting, strength/weakness adjustment
//! and failure handling belong to the engine.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::model::{Insight, Source};

/// Static description of a provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderProfile {
    pub name: String,
    /// Relative weight; the engine normalizes across providers
    pub weight: f64,
    pub base_confidence: f64,
    /// Insight types this provider is good at
    #[serde(default)]
    pub strengths: Vec<String>,
    /// Insight types this provider is bad at
    #[serde(default)]
    pub weaknesses: Vec<String>,
}

impl ProviderProfile {
    pub fn new<S: Into<String>>(name: S, weight: f64, base_confidence: f64) -> Self {
        Self {
            name: name.into(),
            weight,
            base_confidence,
            strengths: Vec::new(),
            weaknesses: Vec::new(),
        }
    }

    pub fn strong_at<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.strengths.extend(types.into_iter().map(Into::into));
        self
    }

    pub fn weak_at<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.weaknesses.extend(types.into_iter().map(Into::into));
        self
    }

    pub fn is_strong_at(&self, insight_type: &str) -> bool {
        self.strengths.iter().any(|t| t == insight_type)
    }

    pub fn is_weak_at(&self, insight_type: &str) -> bool {
        self.weaknesses.iter().any(|t| t == insight_type)
    }
}

/// A provider's answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Opinion {
    pub confidence: f64,
    pub rationale: String,
}

/// Collaborator contract for an opinion source
#[async_trait]
pub trait OpinionProvider: Send + Sync {
    fn profile(&self) -> &ProviderProfile;

    /// Gives this provider's confidence in the insight.
    ///
    /// Errors are tolerated; the engine turns them into a zero-confidence
    /// opinion. A well-behaved provider still bounds its own latency.
    async fn query(&self, insight: &Insight, sources: &[Source]) -> anyhow::Result<Opinion>;
}

/// Evidence-driven provider usable without any model behind it.
///
/// Starts from the profile's base confidence, loses confidence when there is
/// no evidence and gains a little for corroborating and fresh sources.
#[derive(Debug, Clone)]
pub struct HeuristicProvider {
    profile: ProviderProfile,
}

impl HeuristicProvider {
    const NO_EVIDENCE_PENALTY: f64 = 0.10;
    const PER_SOURCE_BONUS: f64 = 0.01;
    const MAX_CORROBORATION: usize = 5;
    const FRESH_BONUS: f64 = 0.02;
    const FRESH_MINUTES: i64 = 30;

    pub fn new(profile: ProviderProfile) -> Self {
        Self { profile }
    }
}

#[async_trait]
impl OpinionProvider for HeuristicProvider {
    fn profile(&self) -> &ProviderProfile {
        &self.profile
    }

    async fn query(&self, _insight: &Insight, sources: &[Source]) -> anyhow::Result<Opinion> {
        if sources.is_empty() {
            return Ok(Opinion {
                confidence: (self.profile.base_confidence - Self::NO_EVIDENCE_PENALTY).max(0.0),
                rationale: format!("{}: no supporting evidence", self.profile.name),
            });
        }

        let corroborating = sources.len().min(Self::MAX_CORROBORATION);
        let now = Utc::now();
        let fresh = sources.iter().any(|s| {
            s.timestamp
                .map(|ts| (now - ts).num_minutes() < Self::FRESH_MINUTES)
                .unwrap_or(false)
        });

        let mut confidence = self.profile.base_confidence
            + corroborating as f64 * Self::PER_SOURCE_BONUS;
        if fresh {
            confidence += Self::FRESH_BONUS;
        }

        Ok(Opinion {
            confidence: confidence.clamp(0.0, 1.0),
            rationale: format!(
                "{}: {} source(s){}",
                self.profile.name,
                sources.len(),
                if fresh { ", including fresh data" } else { "" }
            ),
        })
    }
}

/// The stock provider set: pose, statistical and contextual models
pub fn default_providers() -> Vec<Arc<dyn OpinionProvider>> {
    vec![
        Arc::new(HeuristicProvider::new(
            ProviderProfile::new("pose_model", 0.40, 0.88)
                .strong_at(["biomechanics", "injury_risk"])
                .weak_at(["character_assessment"]),
        )),
        Arc::new(HeuristicProvider::new(
            ProviderProfile::new("statistical_model", 0.35, 0.85)
                .strong_at(["performance_prediction"])
                .weak_at(["biomechanics"]),
        )),
        Arc::new(HeuristicProvider::new(
            ProviderProfile::new("contextual_model", 0.25, 0.80)
                .strong_at(["character_assessment", "tactical_analysis"])
                .weak_at(["injury_risk"]),
        )),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::Value;

    fn provider() -> HeuristicProvider {
        HeuristicProvider::new(ProviderProfile::new("pose_model", 1.0, 0.80))
    }

    #[tokio::test]
    async fn test_no_evidence_lowers_confidence() {
        let insight = Insight::new("biomechanics", Value::Null);
        let opinion = provider().query(&insight, &[]).await.unwrap();
        assert!((opinion.confidence - 0.70).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_fresh_corroborating_sources_raise_confidence() {
        let insight = Insight::new("biomechanics", Value::Null);
        let now = Utc::now();
        let sources = vec![
            Source::new("sensor_data", now - Duration::minutes(2)),
            Source::new("live_video_feed", now - Duration::hours(3)),
        ];

        let opinion = provider().query(&insight, &sources).await.unwrap();
        assert!((opinion.confidence - 0.84).abs() < 1e-9);
        assert!(opinion.rationale.contains("fresh"));
    }

    #[test]
    fn test_profile_tags() {
        let profile = ProviderProfile::new("statistical_model", 0.35, 0.85)
            .strong_at(["performance_prediction"])
            .weak_at(["biomechanics"]);
        assert!(profile.is_strong_at("performance_prediction"));
        assert!(profile.is_weak_at("biomechanics"));
        assert!(!profile.is_strong_at("injury_risk"));
    }

    #[test]
    fn test_default_provider_set() {
        let providers = default_providers();
        let total: f64 = providers.iter().map(|p| p.profile().weight).sum();
        assert_eq!(providers.len(), 3);
        assert!((total - 1.0).abs() < 1e-9);
    }
}
