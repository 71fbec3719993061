//! # Scoring Components
//!
//! Pure functions behind the final confidence score. None of them touch
//! engine state, so each can be tested and reasoned about on its own.
//!
//! ```text
//! final = w_c * consensus + w_r * reliability + w_h * historical + w_f * freshness
//! ```
//!
//! clamped to `[score_floor, score_ceiling]`.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::config::{
    ComponentWeights, DisagreementConfig, FreshnessPolicy, SourceReliability,
};
use crate::model::{ComponentScores, ProviderOpinion, Source};
use crate::provider::ProviderProfile;

/// Clamps to `[0, 1]`, mapping NaN to 0
pub fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Applies the provider's strength bonus or weakness penalty for this type
pub fn adjust_confidence(
    profile: &ProviderProfile,
    insight_type: &str,
    raw: f64,
    strength_bonus: f64,
    weakness_penalty: f64,
) -> f64 {
    let mut confidence = raw;
    if profile.is_strong_at(insight_type) {
        confidence += strength_bonus;
    }
    if profile.is_weak_at(insight_type) {
        confidence -= weakness_penalty;
    }
    clamp_unit(confidence)
}

/// Population standard deviation
pub fn std_dev(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    variance.sqrt()
}

/// `max(0, stddev - tolerance) * factor`
pub fn disagreement_penalty(confidences: &[f64], config: &DisagreementConfig) -> f64 {
    (std_dev(confidences) - config.tolerance).max(0.0) * config.factor
}

/// Weighted mean of the opinions minus the disagreement penalty.
///
/// Failed providers carry zero confidence at their full weight.
pub fn consensus(opinions: &[ProviderOpinion], config: &DisagreementConfig) -> f64 {
    let total_weight: f64 = opinions.iter().map(|o| o.weight).sum();
    if opinions.is_empty() || total_weight <= 0.0 {
        return 0.0;
    }

    let weighted_mean = opinions
        .iter()
        .map(|o| o.weight * o.confidence)
        .sum::<f64>()
        / total_weight;

    let confidences: Vec<f64> = opinions.iter().map(|o| o.confidence).collect();
    clamp_unit(weighted_mean - disagreement_penalty(&confidences, config))
}

/// Log-sample-weighted reliability of the sources' kinds
pub fn source_reliability(
    sources: &[Source],
    table: &HashMap<String, SourceReliability>,
    unknown: SourceReliability,
    no_sources: f64,
) -> f64 {
    if sources.is_empty() {
        return no_sources;
    }

    let (weighted, total) = sources
        .iter()
        .map(|s| table.get(&s.kind).copied().unwrap_or(unknown))
        .fold((0.0, 0.0), |(weighted, total), entry| {
            let weight = ((entry.sample_size as f64) + 1.0).ln();
            (weighted + entry.reliability * weight, total + weight)
        });

    if total <= 0.0 {
        unknown.reliability
    } else {
        clamp_unit(weighted / total)
    }
}

/// Historical accuracy of the insight type
pub fn historical_accuracy(insight_type: &str, table: &HashMap<String, f64>, default: f64) -> f64 {
    table.get(insight_type).copied().unwrap_or(default)
}

impl FreshnessPolicy {
    /// Freshness of one source; `None` age means no timestamp
    pub fn score(&self, age_minutes: Option<f64>) -> f64 {
        match self {
            FreshnessPolicy::Tiered { tiers, stale } => match age_minutes {
                Some(age) => tiers
                    .iter()
                    .find(|tier| age < tier.max_age_minutes)
                    .map(|tier| tier.score)
                    .unwrap_or(*stale),
                None => *stale,
            },
            FreshnessPolicy::Exponential {
                half_life_minutes,
                initial,
                floor,
            } => match age_minutes {
                Some(age) => {
                    let decay = std::f64::consts::LN_2 / half_life_minutes;
                    (initial * (-decay * age).exp()).max(*floor)
                }
                None => *floor,
            },
        }
    }
}

/// Mean freshness of the sources at `now`
pub fn freshness(
    sources: &[Source],
    now: DateTime<Utc>,
    policy: &FreshnessPolicy,
    no_sources: f64,
) -> f64 {
    if sources.is_empty() {
        return no_sources;
    }

    let total: f64 = sources
        .iter()
        .map(|s| {
            // Future timestamps count as brand new
            let age = s
                .timestamp
                .map(|ts| ((now - ts).num_milliseconds() as f64 / 60_000.0).max(0.0));
            policy.score(age)
        })
        .sum();

    total / sources.len() as f64
}

/// Weighted sum of the components, clamped to `[floor, ceiling]`
pub fn final_score(
    components: &ComponentScores,
    weights: &ComponentWeights,
    floor: f64,
    ceiling: f64,
) -> f64 {
    let raw = weights.consensus * components.consensus
        + weights.source_reliability * components.source_reliability
        + weights.historical_accuracy * components.historical_accuracy
        + weights.freshness * components.freshness;
    raw.clamp(floor, ceiling)
}
