//! Human-readable explanations of a score.
//!
//! The rationale is presentation only: it is derived from the component
//! scores and never feeds back into scoring.

use crate::model::{ComponentScores, ConfidenceBand};

/// Turns component scores into prose
pub trait RationaleGenerator: Send + Sync {
    fn generate(&self, insight_type: &str, components: &ComponentScores, band: ConfidenceBand) -> String;
}

/// Default English template: one clause per component plus a band summary
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateRationale;

impl TemplateRationale {
    fn consensus_clause(consensus: f64) -> &'static str {
        if consensus >= 0.85 {
            "Strong agreement across models"
        } else if consensus >= 0.65 {
            "Moderate agreement across models"
        } else if consensus >= 0.45 {
            "Mixed signals between models"
        } else {
            "Models disagree or failed to answer"
        }
    }

    fn source_clause(reliability: f64) -> &'static str {
        if reliability >= 0.85 {
            "high-quality data sources"
        } else if reliability >= 0.65 {
            "reliable data sources"
        } else if reliability >= 0.45 {
            "sources of mixed quality"
        } else {
            "limited or unreliable sources"
        }
    }

    fn freshness_clause(freshness: f64) -> &'static str {
        if freshness >= 0.9 {
            "real-time data"
        } else if freshness >= 0.7 {
            "recent data"
        } else if freshness >= 0.5 {
            "data that is several hours old"
        } else {
            "stale data"
        }
    }

    fn summary(band: ConfidenceBand) -> &'static str {
        match band {
            ConfidenceBand::High => "High confidence: suitable for display.",
            ConfidenceBand::Medium => "Medium confidence: display with supporting context.",
            ConfidenceBand::Low => "Low confidence: display only with a clear caveat.",
            ConfidenceBand::Reject => "Insufficient confidence: withhold from display.",
        }
    }
}

impl RationaleGenerator for TemplateRationale {
    fn generate(&self, insight_type: &str, components: &ComponentScores, band: ConfidenceBand) -> String {
        format!(
            "{}, {}, {:.0}% historical accuracy for {} insights, based on {}. {}",
            Self::consensus_clause(components.consensus),
            Self::source_clause(components.source_reliability),
            components.historical_accuracy * 100.0,
            insight_type.replace('_', " "),
            Self::freshness_clause(components.freshness),
            Self::summary(band),
        )
    }
}
