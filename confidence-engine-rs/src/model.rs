//! Data model for scoring: insights, their evidence, and scored results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::config::BandThresholds;

/// A claim to be trusted or not
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Insight {
    pub id: String,
    /// Category tag, e.g. `biomechanics`
    #[serde(rename = "type")]
    pub insight_type: String,
    /// Opaque content; never interpreted by the engine
    #[serde(default)]
    pub payload: Value,
}

impl Insight {
    /// Creates an insight with a fresh id
    pub fn new<S: Into<String>>(insight_type: S, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            insight_type: insight_type.into(),
            payload,
        }
    }

    pub fn with_id<S: Into<String>>(mut self, id: S) -> Self {
        self.id = id.into();
        self
    }
}

/// Evidence backing an insight
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    /// Category, e.g. `sensor_data`
    pub kind: String,
    /// Capture time; a source without one is treated as maximally stale
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl Source {
    pub fn new<S: Into<String>>(kind: S, timestamp: DateTime<Utc>) -> Self {
        Self {
            kind: kind.into(),
            timestamp: Some(timestamp),
            metadata: None,
        }
    }

    pub fn undated<S: Into<String>>(kind: S) -> Self {
        Self {
            kind: kind.into(),
            timestamp: None,
            metadata: None,
        }
    }
}

/// Display band of a confidence score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConfidenceBand {
    High,
    Medium,
    Low,
    Reject,
}

impl ConfidenceBand {
    pub fn from_score(score: f64, thresholds: &BandThresholds) -> Self {
        if score >= thresholds.high {
            ConfidenceBand::High
        } else if score >= thresholds.medium {
            ConfidenceBand::Medium
        } else if score >= thresholds.low {
            ConfidenceBand::Low
        } else {
            ConfidenceBand::Reject
        }
    }

    /// A REJECT result must be withheld, not shown with a warning
    pub fn should_display(&self) -> bool {
        !matches!(self, ConfidenceBand::Reject)
    }

    pub fn label(&self) -> &'static str {
        match self {
            ConfidenceBand::High => "HIGH",
            ConfidenceBand::Medium => "MEDIUM",
            ConfidenceBand::Low => "LOW",
            ConfidenceBand::Reject => "REJECT",
        }
    }
}

impl std::fmt::Display for ConfidenceBand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// The sub-scores behind a final score
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ComponentScores {
    pub consensus: f64,
    pub source_reliability: f64,
    pub historical_accuracy: f64,
    pub freshness: f64,
}

/// What one provider said about an insight
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderOpinion {
    pub provider: String,
    /// Normalized weight of this provider
    pub weight: f64,
    /// Confidence after strength/weakness adjustment; 0 on error
    pub confidence: f64,
    pub rationale: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProviderOpinion {
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// An insight with its confidence assessment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredInsight {
    pub insight: Insight,
    pub confidence_score: f64,
    pub band: ConfidenceBand,
    pub rationale: String,
    /// Absent on degraded results
    pub components: Option<ComponentScores>,
    pub opinions: Vec<ProviderOpinion>,
    pub scored_at: DateTime<Utc>,
    /// True when scoring failed and this is the fail-closed fallback
    pub degraded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// One entry of a batch scoring call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreRequest {
    pub insight: Insight,
    #[serde(default)]
    pub sources: Vec<Source>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

impl ScoreRequest {
    pub fn new(insight: Insight, sources: Vec<Source>) -> Self {
        Self {
            insight,
            sources,
            metadata: None,
        }
    }
}
