//! # Confidence Engine
//!
//! Scores insights by fanning out to every opinion provider, aggregating
//! their answers with a disagreement penalty and weighting the result by
//! source reliability, historical accuracy and freshness.
//!
//! Scoring is fail-closed: `score_insight` always returns a result. Provider
//! failures become zero-confidence opinions, and any error in the run itself
//! yields a degraded REJECT-band result.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use futures::FutureExt;
use metrics::{counter, histogram};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::cache::ScoreCache;
use crate::config::{EngineConfig, SourceReliability};
use crate::model::{
    ComponentScores, ConfidenceBand, Insight, ProviderOpinion, ScoreRequest, ScoredInsight, Source,
};
use crate::provider::{default_providers, OpinionProvider};
use crate::rationale::{RationaleGenerator, TemplateRationale};
use crate::scoring;
use crate::trend::{DegradationAlert, TrendPoint, TrendTracker};
use crate::types::{ProviderFailure, Result, ScoringError};

const ALERT_CHANNEL_CAPACITY: usize = 64;

/// Builder for [`ConfidenceEngine`]
pub struct ConfidenceEngineBuilder {
    config: EngineConfig,
    providers: Vec<Arc<dyn OpinionProvider>>,
    rationale: Arc<dyn RationaleGenerator>,
}

impl ConfidenceEngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            providers: Vec::new(),
            rationale: Arc::new(TemplateRationale),
        }
    }

    pub fn provider(mut self, provider: Arc<dyn OpinionProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    /// Adds the stock heuristic providers
    pub fn default_providers(mut self) -> Self {
        self.providers.extend(default_providers());
        self
    }

    pub fn rationale(mut self, generator: Arc<dyn RationaleGenerator>) -> Self {
        self.rationale = generator;
        self
    }

    pub fn build(self) -> Result<ConfidenceEngine> {
        self.config.validate()?;

        for provider in &self.providers {
            let profile = provider.profile();
            if !(profile.weight.is_finite() && profile.weight >= 0.0) {
                return Err(ScoringError::InvalidConfig(format!(
                    "provider {} has invalid weight {}",
                    profile.name, profile.weight
                )));
            }
        }
        let total_weight: f64 = self.providers.iter().map(|p| p.profile().weight).sum();
        if !self.providers.is_empty() && total_weight <= 0.0 {
            return Err(ScoringError::InvalidConfig(
                "provider weights must not all be zero".to_string(),
            ));
        }

        info!(
            providers = self.providers.len(),
            provider_timeout_ms = self.config.provider_timeout_ms,
            "Confidence engine initialized"
        );

        let (alerts_tx, _) = broadcast::channel(ALERT_CHANNEL_CAPACITY);

        Ok(ConfidenceEngine {
            source_reliability: RwLock::new(self.config.source_reliability.clone()),
            historical_accuracy: RwLock::new(self.config.historical_accuracy.clone()),
            cache: Mutex::new(ScoreCache::new(self.config.cache_capacity)),
            trends: Mutex::new(TrendTracker::new(self.config.trend.clone())),
            recent_alerts: Mutex::new(VecDeque::with_capacity(self.config.trend.alert_history)),
            alerts_tx,
            total_weight,
            providers: self.providers,
            rationale: self.rationale,
            config: self.config,
        })
    }
}

/// Multi-provider confidence scorer
pub struct ConfidenceEngine {
    config: EngineConfig,
    providers: Vec<Arc<dyn OpinionProvider>>,
    total_weight: f64,
    rationale: Arc<dyn RationaleGenerator>,
    source_reliability: RwLock<HashMap<String, SourceReliability>>,
    historical_accuracy: RwLock<HashMap<String, f64>>,
    cache: Mutex<ScoreCache>,
    trends: Mutex<TrendTracker>,
    recent_alerts: Mutex<VecDeque<DegradationAlert>>,
    alerts_tx: broadcast::Sender<DegradationAlert>,
}

impl std::fmt::Debug for ConfidenceEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let providers: Vec<&str> = self
            .providers
            .iter()
            .map(|p| p.profile().name.as_str())
            .collect();
        f.debug_struct("ConfidenceEngine")
            .field("providers", &providers)
            .field("cached", &self.cache_len())
            .finish()
    }
}

impl ConfidenceEngine {
    pub fn builder(config: EngineConfig) -> ConfidenceEngineBuilder {
        ConfidenceEngineBuilder::new(config)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Scores an insight. Never fails: errors yield a degraded REJECT result.
    pub async fn score_insight(
        &self,
        insight: &Insight,
        sources: &[Source],
        metadata: Option<Value>,
    ) -> ScoredInsight {
        let attempt = AssertUnwindSafe(self.try_score_insight(insight, sources, metadata.clone()))
            .catch_unwind()
            .await;

        match attempt {
            Ok(Ok(scored)) => scored,
            Ok(Err(e)) => self.degraded(insight, metadata, &e),
            Err(payload) => {
                let e = ScoringError::Panicked(panic_message(payload.as_ref()));
                self.degraded(insight, metadata, &e)
            }
        }
    }

    /// Scores many insights concurrently; results keep the input order
    pub async fn batch_score_insights(&self, requests: &[ScoreRequest]) -> Vec<ScoredInsight> {
        join_all(
            requests
                .iter()
                .map(|r| self.score_insight(&r.insight, &r.sources, r.metadata.clone())),
        )
        .await
    }

    /// Scores an insight, surfacing the reason if the run cannot complete
    pub async fn try_score_insight(
        &self,
        insight: &Insight,
        sources: &[Source],
        metadata: Option<Value>,
    ) -> Result<ScoredInsight> {
        if insight.id.trim().is_empty() {
            return Err(ScoringError::InvalidInsight("empty id".to_string()));
        }
        if insight.insight_type.trim().is_empty() {
            return Err(ScoringError::InvalidInsight("empty type".to_string()));
        }

        let opinions = self.collect_opinions(insight, sources).await;

        let components = {
            let reliability = self.source_reliability.read();
            let accuracy = self.historical_accuracy.read();
            ComponentScores {
                consensus: scoring::consensus(&opinions, &self.config.disagreement),
                source_reliability: scoring::source_reliability(
                    sources,
                    &reliability,
                    self.config.unknown_source,
                    self.config.no_source_reliability,
                ),
                historical_accuracy: scoring::historical_accuracy(
                    &insight.insight_type,
                    &accuracy,
                    self.config.default_historical_accuracy,
                ),
                freshness: scoring::freshness(
                    sources,
                    Utc::now(),
                    &self.config.freshness,
                    self.config.no_source_freshness,
                ),
            }
        };
        ensure_finite(&components)?;

        let confidence_score = scoring::final_score(
            &components,
            &self.config.weights,
            self.config.score_floor,
            self.config.score_ceiling,
        );
        let band = ConfidenceBand::from_score(confidence_score, &self.config.bands);
        let rationale = self
            .rationale
            .generate(&insight.insight_type, &components, band);

        let scored = ScoredInsight {
            insight: insight.clone(),
            confidence_score,
            band,
            rationale,
            components: Some(components),
            opinions,
            scored_at: Utc::now(),
            degraded: false,
            metadata,
        };

        counter!("confidence.scored", 1, "band" => band.label());
        histogram!(
            "confidence.score",
            confidence_score,
            "type" => insight.insight_type.clone()
        );
        debug!(
            insight_id = %insight.id,
            insight_type = %insight.insight_type,
            score = %format!("{:.3}", confidence_score),
            band = %band,
            "Insight scored"
        );

        self.cache.lock().insert(scored.clone());
        self.track(&insight.insight_type, confidence_score);

        Ok(scored)
    }

    async fn collect_opinions(&self, insight: &Insight, sources: &[Source]) -> Vec<ProviderOpinion> {
        let timeout = self.config.provider_timeout();
        let timeout_ms = self.config.provider_timeout_ms;

        let queries = self.providers.iter().map(|provider| async move {
            let attempt = tokio::time::timeout(
                timeout,
                AssertUnwindSafe(async { provider.query(insight, sources).await }).catch_unwind(),
            )
            .await;

            match attempt {
                Ok(Ok(Ok(opinion))) if opinion.confidence.is_finite() => Ok(opinion),
                Ok(Ok(Ok(_))) => Err(ProviderFailure::NonFiniteConfidence),
                Ok(Ok(Err(e))) => Err(ProviderFailure::Error(e.to_string())),
                Ok(Err(_)) => Err(ProviderFailure::Panicked),
                Err(_) => Err(ProviderFailure::Timeout(timeout_ms)),
            }
        });

        let results = join_all(queries).await;

        self.providers
            .iter()
            .zip(results)
            .map(|(provider, result)| {
                let profile = provider.profile();
                let weight = if self.total_weight > 0.0 {
                    profile.weight / self.total_weight
                } else {
                    0.0
                };

                match result {
                    Ok(opinion) => ProviderOpinion {
                        provider: profile.name.clone(),
                        weight,
                        confidence: scoring::adjust_confidence(
                            profile,
                            &insight.insight_type,
                            opinion.confidence,
                            self.config.strength_bonus,
                            self.config.weakness_penalty,
                        ),
                        rationale: opinion.rationale,
                        error: None,
                    },
                    Err(failure) => {
                        warn!(
                            provider = %profile.name,
                            insight_id = %insight.id,
                            error = %failure,
                            "Opinion provider failed, counting as zero confidence"
                        );
                        counter!(
                            "confidence.provider_failures",
                            1,
                            "provider" => profile.name.clone()
                        );
                        ProviderOpinion {
                            provider: profile.name.clone(),
                            weight,
                            confidence: 0.0,
                            rationale: String::new(),
                            error: Some(failure.to_string()),
                        }
                    }
                }
            })
            .collect()
    }

    fn track(&self, insight_type: &str, score: f64) {
        let alert = self.trends.lock().record(insight_type, score);
        let Some(alert) = alert else {
            return;
        };

        warn!(
            insight_type = %alert.insight_type,
            prior_mean = %format!("{:.3}", alert.prior_mean),
            recent_mean = %format!("{:.3}", alert.recent_mean),
            drop = %format!("{:.3}", alert.drop),
            "Confidence degradation detected"
        );
        counter!(
            "confidence.degradation_alerts",
            1,
            "type" => alert.insight_type.clone()
        );

        {
            let mut recent = self.recent_alerts.lock();
            if recent.len() >= self.config.trend.alert_history {
                recent.pop_front();
            }
            recent.push_back(alert.clone());
        }

        // No subscribers is fine
        let _ = self.alerts_tx.send(alert);
    }

    fn degraded(&self, insight: &Insight, metadata: Option<Value>, error: &ScoringError) -> ScoredInsight {
        warn!(
            insight_id = %insight.id,
            error = %error,
            "Scoring failed, returning degraded result"
        );
        counter!("confidence.degraded", 1);

        ScoredInsight {
            insight: insight.clone(),
            confidence_score: self.config.degraded_score,
            band: ConfidenceBand::Reject,
            rationale: format!("Confidence could not be assessed: {}. Withhold from display.", error),
            components: None,
            opinions: Vec::new(),
            scored_at: Utc::now(),
            degraded: true,
            metadata,
        }
    }

    /// Feeds a verified outcome back into the type's historical accuracy
    pub fn record_outcome(&self, insight_type: &str, was_correct: bool) -> f64 {
        let alpha = self.config.outcome_smoothing;
        let observed = if was_correct { 1.0 } else { 0.0 };

        let mut table = self.historical_accuracy.write();
        let accuracy = table
            .entry(insight_type.to_string())
            .or_insert(self.config.default_historical_accuracy);
        *accuracy = scoring::clamp_unit((1.0 - alpha) * *accuracy + alpha * observed);

        debug!(
            insight_type = %insight_type,
            was_correct,
            accuracy = %format!("{:.4}", *accuracy),
            "Historical accuracy updated"
        );
        *accuracy
    }

    pub fn historical_accuracy(&self, insight_type: &str) -> f64 {
        scoring::historical_accuracy(
            insight_type,
            &self.historical_accuracy.read(),
            self.config.default_historical_accuracy,
        )
    }

    /// Replaces the reliability entry of a source kind
    pub fn update_source_reliability(&self, kind: &str, reliability: f64, sample_size: u64) {
        let entry = SourceReliability::new(scoring::clamp_unit(reliability), sample_size);
        self.source_reliability.write().insert(kind.to_string(), entry);
        debug!(kind = %kind, reliability = %entry.reliability, sample_size, "Source reliability updated");
    }

    /// Receives every degradation alert raised after subscribing
    pub fn subscribe_alerts(&self) -> broadcast::Receiver<DegradationAlert> {
        self.alerts_tx.subscribe()
    }

    /// Most recent degradation alerts, oldest first
    pub fn recent_alerts(&self) -> Vec<DegradationAlert> {
        self.recent_alerts.lock().iter().cloned().collect()
    }

    pub fn cached(&self, id: &str) -> Option<ScoredInsight> {
        self.cache.lock().get(id).cloned()
    }

    pub fn cache_len(&self) -> usize {
        self.cache.lock().len()
    }

    /// Score history of an insight type, oldest first
    pub fn trend(&self, insight_type: &str) -> Vec<TrendPoint> {
        self.trends.lock().history(insight_type)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn ensure_finite(components: &ComponentScores) -> Result<()> {
    for (component, value) in [
        ("consensus", components.consensus),
        ("source reliability", components.source_reliability),
        ("historical accuracy", components.historical_accuracy),
        ("freshness", components.freshness),
    ] {
        if !value.is_finite() {
            return Err(ScoringError::NonFiniteComponent { component });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{Opinion, ProviderProfile};
    use async_trait::async_trait;
    use chrono::Duration;

    struct Fixed {
        profile: ProviderProfile,
        confidence: f64,
    }

    #[async_trait]
    impl OpinionProvider for Fixed {
        fn profile(&self) -> &ProviderProfile {
            &self.profile
        }

        async fn query(&self, _insight: &Insight, _sources: &[Source]) -> anyhow::Result<Opinion> {
            Ok(Opinion {
                confidence: self.confidence,
                rationale: format!("{} says {}", self.profile.name, self.confidence),
            })
        }
    }

    fn fixed(name: &str, confidence: f64) -> Arc<dyn OpinionProvider> {
        Arc::new(Fixed {
            profile: ProviderProfile::new(name, 1.0, confidence),
            confidence,
        })
    }

    fn fresh_sources() -> Vec<Source> {
        let now = Utc::now();
        vec![
            Source::new("sensor_data", now - Duration::minutes(1)),
            Source::new("live_video_feed", now - Duration::minutes(2)),
        ]
    }

    #[tokio::test]
    async fn test_invalid_insight_degrades() {
        let engine = ConfidenceEngine::builder(EngineConfig::default())
            .provider(fixed("pose_model", 0.9))
            .build()
            .unwrap();
        let insight = Insight::new("", Value::Null);

        let err = engine.try_score_insight(&insight, &[], None).await.unwrap_err();
        assert_eq!(err, ScoringError::InvalidInsight("empty type".to_string()));

        let scored = engine.score_insight(&insight, &[], Some(serde_json::json!({"req": 7}))).await;
        assert!(scored.degraded);
        assert_eq!(scored.band, ConfidenceBand::Reject);
        assert_eq!(scored.confidence_score, 0.25);
        assert_eq!(scored.metadata, Some(serde_json::json!({"req": 7})));
        assert!(scored.rationale.contains("empty type"));
        assert_eq!(engine.cache_len(), 0);
    }

    #[tokio::test]
    async fn test_no_providers_gives_zero_consensus() {
        let engine = ConfidenceEngine::builder(EngineConfig::default()).build().unwrap();
        let insight = Insight::new("biomechanics", Value::Null);

        let scored = engine.score_insight(&insight, &fresh_sources(), None).await;
        assert_eq!(scored.components.unwrap().consensus, 0.0);
        assert!(!scored.degraded);
    }

    #[tokio::test]
    async fn test_strength_and_weakness_adjust_opinions() {
        let engine = ConfidenceEngine::builder(EngineConfig::default())
            .provider(Arc::new(Fixed {
                profile: ProviderProfile::new("pose_model", 1.0, 0.8).strong_at(["biomechanics"]),
                confidence: 0.8,
            }))
            .provider(Arc::new(Fixed {
                profile: ProviderProfile::new("statistical_model", 1.0, 0.8).weak_at(["biomechanics"]),
                confidence: 0.8,
            }))
            .build()
            .unwrap();

        let scored = engine
            .score_insight(&Insight::new("biomechanics", Value::Null), &[], None)
            .await;
        assert!((scored.opinions[0].confidence - 0.85).abs() < 1e-9);
        assert!((scored.opinions[1].confidence - 0.70).abs() < 1e-9);
        assert!((scored.opinions[0].weight - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_result_is_cached_and_tracked() {
        let engine = ConfidenceEngine::builder(EngineConfig::default())
            .default_providers()
            .build()
            .unwrap();
        let insight = Insight::new("injury_risk", Value::Null).with_id("ins-42");

        let scored = engine.score_insight(&insight, &fresh_sources(), None).await;
        assert_eq!(engine.cached("ins-42"), Some(scored.clone()));
        assert_eq!(engine.trend("injury_risk").len(), 1);

        engine.score_insight(&insight, &fresh_sources(), None).await;
        assert_eq!(engine.cache_len(), 1);
        assert_eq!(engine.trend("injury_risk").len(), 2);
    }

    #[tokio::test]
    async fn test_record_outcome_moves_accuracy() {
        let engine = ConfidenceEngine::builder(EngineConfig::default()).build().unwrap();

        let after_miss = engine.record_outcome("performance_prediction", false);
        assert!((after_miss - 0.87 * 0.95).abs() < 1e-9);

        let unknown = engine.record_outcome("pitch_sequencing", true);
        assert!((unknown - (0.80 * 0.95 + 0.05)).abs() < 1e-9);
        assert_eq!(engine.historical_accuracy("pitch_sequencing"), unknown);
    }

    #[tokio::test]
    async fn test_update_source_reliability() {
        let engine = ConfidenceEngine::builder(EngineConfig::default()).build().unwrap();
        engine.update_source_reliability("drone_feed", 0.9, 500);

        let insight = Insight::new("tactical_analysis", Value::Null);
        let sources = vec![Source::new("drone_feed", Utc::now())];
        let scored = engine.score_insight(&insight, &sources, None).await;
        assert!((scored.components.unwrap().source_reliability - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_zero_total_weight_rejected() {
        let result = ConfidenceEngine::builder(EngineConfig::default())
            .provider(Arc::new(Fixed {
                profile: ProviderProfile::new("idle", 0.0, 0.5),
                confidence: 0.5,
            }))
            .build();
        assert!(matches!(result, Err(ScoringError::InvalidConfig(_))));
    }
}
