//! Rolling per-type score history and drift detection.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::TrendConfig;

/// One recorded score
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrendPoint {
    pub score: f64,
    pub at: DateTime<Utc>,
}

/// Raised when recent scores for a type fall well below the prior window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DegradationAlert {
    pub insight_type: String,
    pub recent_mean: f64,
    pub prior_mean: f64,
    pub drop: f64,
    pub detected_at: DateTime<Utc>,
}

/// Bounded score history per insight type
#[derive(Debug)]
pub struct TrendTracker {
    config: TrendConfig,
    history: HashMap<String, VecDeque<TrendPoint>>,
}

fn mean<'a>(points: impl Iterator<Item = &'a TrendPoint>) -> f64 {
    let (sum, count) = points.fold((0.0, 0usize), |(sum, count), p| (sum + p.score, count + 1));
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

impl TrendTracker {
    pub fn new(config: TrendConfig) -> Self {
        Self {
            config,
            history: HashMap::new(),
        }
    }

    /// Records a score and checks the type for drift
    pub fn record(&mut self, insight_type: &str, score: f64) -> Option<DegradationAlert> {
        let capacity = self.config.capacity;
        let points = self
            .history
            .entry(insight_type.to_string())
            .or_insert_with(|| VecDeque::with_capacity(capacity));

        if points.len() >= capacity {
            points.pop_front();
        }
        points.push_back(TrendPoint {
            score,
            at: Utc::now(),
        });

        let window = self.config.window;
        if points.len() < window * 2 {
            return None;
        }

        let recent_start = points.len() - window;
        let recent_mean = mean(points.iter().skip(recent_start));
        let prior_mean = mean(points.iter().skip(recent_start - window).take(window));
        let drop = prior_mean - recent_mean;

        if drop >= self.config.drop_threshold {
            Some(DegradationAlert {
                insight_type: insight_type.to_string(),
                recent_mean,
                prior_mean,
                drop,
                detected_at: Utc::now(),
            })
        } else {
            None
        }
    }

    /// Score history of a type, oldest first
    pub fn history(&self, insight_type: &str) -> Vec<TrendPoint> {
        self.history
            .get(insight_type)
            .map(|points| points.iter().copied().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> TrendTracker {
        TrendTracker::new(TrendConfig::default())
    }

    #[test]
    fn test_no_alert_before_two_windows() {
        let mut trends = tracker();
        for _ in 0..10 {
            assert!(trends.record("biomechanics", 0.9).is_none());
        }
        for _ in 0..9 {
            assert!(trends.record("biomechanics", 0.5).is_none());
        }
        assert!(trends.record("biomechanics", 0.5).is_some());
    }

    #[test]
    fn test_drop_detected_against_prior_window() {
        let mut trends = tracker();
        for _ in 0..10 {
            trends.record("injury_risk", 0.90);
        }
        let mut alert = None;
        for _ in 0..10 {
            alert = trends.record("injury_risk", 0.75);
        }

        let alert = alert.unwrap();
        assert_eq!(alert.insight_type, "injury_risk");
        assert!((alert.prior_mean - 0.90).abs() < 1e-9);
        assert!((alert.recent_mean - 0.75).abs() < 1e-9);
        assert!((alert.drop - 0.15).abs() < 1e-9);
    }

    #[test]
    fn test_small_drop_ignored_and_types_independent() {
        let mut trends = tracker();
        for _ in 0..10 {
            trends.record("biomechanics", 0.90);
            trends.record("tactical_analysis", 0.90);
        }
        for _ in 0..10 {
            assert!(trends.record("biomechanics", 0.85).is_none());
        }
        assert_eq!(trends.history("tactical_analysis").len(), 10);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut trends = tracker();
        for i in 0..150 {
            trends.record("biomechanics", i as f64 / 150.0);
        }
        let history = trends.history("biomechanics");
        assert_eq!(history.len(), 100);
        assert!((history[0].score - 50.0 / 150.0).abs() < 1e-9);
    }
}
