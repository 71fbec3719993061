//! # Circuit Breaker
//!
//! Per-service circuit breaker state machine.
//!
//! - CLOSED: calls flow; the Nth consecutive failure opens the circuit.
//! - OPEN: calls are answered by the fallback chain until the reset timeout
//!   elapses; the next call after that moves the circuit to HALF-OPEN.
//! - HALF-OPEN: calls flow as probes; `success_threshold` consecutive
//!   successes close the circuit, any failure reopens it.
//!
//! The OPEN → HALF-OPEN move is lazy: it happens when a call arrives, so no
//! background timer is needed.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::CircuitBreakerConfig;

/// How many state transitions each breaker remembers
const TRANSITION_HISTORY: usize = 50;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation, requests allowed
    Closed,
    /// Failing, requests short-circuited to the fallback chain
    Open,
    /// Testing recovery, requests allowed as probes
    HalfOpen,
}

impl CircuitState {
    fn label(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }

    fn gauge_value(&self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::Open => 1.0,
            CircuitState::HalfOpen => 2.0,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF-OPEN"),
        }
    }
}

/// Result tracking for a sliding window
#[derive(Debug)]
struct ResultWindow {
    size: usize,
    /// Results in the window (true = success, false = failure)
    results: VecDeque<bool>,
    success_count: usize,
}

impl ResultWindow {
    fn new(size: usize) -> Self {
        Self {
            size,
            results: VecDeque::with_capacity(size),
            success_count: 0,
        }
    }

    fn add_result(&mut self, success: bool) {
        if self.results.len() >= self.size {
            if let Some(true) = self.results.pop_front() {
                self.success_count = self.success_count.saturating_sub(1);
            }
        }

        self.results.push_back(success);
        if success {
            self.success_count += 1;
        }
    }

    /// Success rate over the window; an empty window counts as fully healthy
    fn success_rate(&self) -> f64 {
        if self.results.is_empty() {
            1.0
        } else {
            self.success_count as f64 / self.results.len() as f64
        }
    }

    fn clear(&mut self) {
        self.results.clear();
        self.success_count = 0;
    }
}

/// A recorded state change
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub at: DateTime<Utc>,
    pub from: CircuitState,
    pub to: CircuitState,
}

/// Outcome of asking the breaker whether a call may proceed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The real operation may run; `probing` is true in HALF-OPEN
    Allowed { probing: bool },
    /// The circuit is open; the caller must fall back
    Rejected { retry_in: Duration },
}

/// Point-in-time view of a breaker, used by the health report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub service: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub total_requests: u64,
    pub total_failures: u64,
    pub rejected_requests: u64,
    pub success_rate: f64,
    /// Milliseconds until an open circuit admits a probe
    pub retry_in_ms: Option<u64>,
}

#[derive(Debug)]
struct CircuitStats {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    total_requests: u64,
    total_failures: u64,
    rejected_requests: u64,
    next_attempt_time: Option<Instant>,
    window: ResultWindow,
    transitions: VecDeque<StateTransition>,
}

impl CircuitStats {
    fn new(window_size: usize) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            total_requests: 0,
            total_failures: 0,
            rejected_requests: 0,
            next_attempt_time: None,
            window: ResultWindow::new(window_size),
            transitions: VecDeque::with_capacity(TRANSITION_HISTORY),
        }
    }

    fn transition(&mut self, service: &str, to: CircuitState) {
        let from = self.state;
        self.state = to;

        if self.transitions.len() >= TRANSITION_HISTORY {
            self.transitions.pop_front();
        }
        self.transitions.push_back(StateTransition {
            at: Utc::now(),
            from,
            to,
        });

        counter!(
            "circuit_breaker.transitions",
            1,
            "service" => service.to_string(),
            "to" => to.label()
        );
        gauge!(
            "circuit_breaker.state",
            to.gauge_value(),
            "service" => service.to_string()
        );
    }
}

/// Circuit breaker guarding one named service
#[derive(Debug)]
pub struct ServiceBreaker {
    name: String,
    config: CircuitBreakerConfig,
    stats: Mutex<CircuitStats>,
}

impl ServiceBreaker {
    /// Creates a closed breaker for the given service
    pub fn new<S: Into<String>>(name: S, config: CircuitBreakerConfig) -> Self {
        let stats = CircuitStats::new(config.window_size);
        Self {
            name: name.into(),
            config,
            stats: Mutex::new(stats),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Decides whether a call may run, moving OPEN to HALF-OPEN once the
    /// reset timeout has elapsed.
    pub fn try_acquire(&self) -> Admission {
        let mut stats = self.stats.lock();
        stats.total_requests += 1;

        match stats.state {
            CircuitState::Closed => Admission::Allowed { probing: false },
            CircuitState::HalfOpen => Admission::Allowed { probing: true },
            CircuitState::Open => {
                let now = Instant::now();
                match stats.next_attempt_time {
                    Some(next) if now < next => {
                        stats.rejected_requests += 1;
                        let retry_in = next - now;

                        debug!(
                            circuit = %self.name,
                            remaining_ms = %retry_in.as_millis(),
                            "Circuit open, request rejected"
                        );
                        counter!(
                            "circuit_breaker.rejected",
                            1,
                            "service" => self.name.clone()
                        );

                        Admission::Rejected { retry_in }
                    }
                    _ => {
                        stats.consecutive_successes = 0;
                        stats.transition(&self.name, CircuitState::HalfOpen);

                        info!(
                            circuit = %self.name,
                            success_threshold = %self.config.success_threshold,
                            "Circuit HALF-OPEN: Testing service recovery"
                        );

                        Admission::Allowed { probing: true }
                    }
                }
            }
        }
    }

    /// Records a successful call to the service
    pub fn record_success(&self) {
        let mut stats = self.stats.lock();

        // Any success ends the current failure streak, whatever the state.
        stats.consecutive_failures = 0;
        stats.window.add_result(true);

        if stats.state == CircuitState::HalfOpen {
            stats.consecutive_successes += 1;

            if stats.consecutive_successes >= self.config.success_threshold {
                stats.consecutive_successes = 0;
                stats.next_attempt_time = None;
                stats.transition(&self.name, CircuitState::Closed);

                info!(
                    circuit = %self.name,
                    threshold = %self.config.success_threshold,
                    "Circuit CLOSED: Service recovered"
                );
            }
        }
    }

    /// Records a failed call to the service
    pub fn record_failure(&self) {
        let mut stats = self.stats.lock();

        stats.total_failures += 1;
        stats.consecutive_failures += 1;
        stats.consecutive_successes = 0;
        stats.window.add_result(false);

        counter!("circuit_breaker.failures", 1, "service" => self.name.clone());

        match stats.state {
            CircuitState::Closed => {
                if stats.consecutive_failures >= self.config.failure_threshold {
                    stats.next_attempt_time = Some(Instant::now() + self.config.reset_timeout());
                    stats.transition(&self.name, CircuitState::Open);

                    warn!(
                        circuit = %self.name,
                        failures = %stats.consecutive_failures,
                        threshold = %self.config.failure_threshold,
                        reset_timeout_ms = %self.config.reset_timeout_ms,
                        "Circuit OPEN: Failure threshold exceeded"
                    );
                }
            }
            CircuitState::HalfOpen => {
                stats.next_attempt_time = Some(Instant::now() + self.config.reset_timeout());
                stats.transition(&self.name, CircuitState::Open);

                warn!(
                    circuit = %self.name,
                    reset_timeout_ms = %self.config.reset_timeout_ms,
                    "Circuit REOPENED: Failed in half-open state"
                );
            }
            CircuitState::Open => {
                // A call admitted before the circuit opened finished late; the
                // open window is not extended.
            }
        }
    }

    /// Gets the current state of the circuit
    pub fn state(&self) -> CircuitState {
        self.stats.lock().state
    }

    /// Gets a point-in-time view of the breaker's counters
    pub fn snapshot(&self) -> BreakerSnapshot {
        let stats = self.stats.lock();
        let retry_in_ms = match (stats.state, stats.next_attempt_time) {
            (CircuitState::Open, Some(next)) => {
                Some(next.saturating_duration_since(Instant::now()).as_millis() as u64)
            }
            _ => None,
        };

        BreakerSnapshot {
            service: self.name.clone(),
            state: stats.state,
            consecutive_failures: stats.consecutive_failures,
            consecutive_successes: stats.consecutive_successes,
            total_requests: stats.total_requests,
            total_failures: stats.total_failures,
            rejected_requests: stats.rejected_requests,
            success_rate: stats.window.success_rate(),
            retry_in_ms,
        }
    }

    /// Gets the recorded state transitions, oldest first
    pub fn transitions(&self) -> Vec<StateTransition> {
        self.stats.lock().transitions.iter().cloned().collect()
    }

    /// Resets the circuit to the closed state, clearing streaks and the window
    pub fn reset(&self) {
        let mut stats = self.stats.lock();
        let previous = stats.state;

        stats.consecutive_failures = 0;
        stats.consecutive_successes = 0;
        stats.next_attempt_time = None;
        stats.window.clear();
        if previous != CircuitState::Closed {
            stats.transition(&self.name, CircuitState::Closed);
        }

        info!(
            circuit = %self.name,
            previous_state = %previous,
            "Circuit manually reset to CLOSED state"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> ServiceBreaker {
        ServiceBreaker::new(
            "pose_estimation",
            CircuitBreakerConfig {
                failure_threshold: 3,
                success_threshold: 2,
                reset_timeout_ms: 1_000,
                timeout_ms: 100,
                window_size: 10,
            },
        )
    }

    #[tokio::test]
    async fn test_opens_on_consecutive_failures() {
        let cb = breaker();
        assert_eq!(cb.state(), CircuitState::Closed);

        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(matches!(cb.try_acquire(), Admission::Rejected { .. }));
    }

    #[tokio::test]
    async fn test_success_resets_failure_streak() {
        let cb = breaker();

        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        cb.record_failure();

        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.snapshot().consecutive_failures, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_after_reset_timeout() {
        let cb = breaker();
        for _ in 0..3 {
            cb.record_failure();
        }

        tokio::time::advance(Duration::from_millis(999)).await;
        assert!(matches!(cb.try_acquire(), Admission::Rejected { .. }));

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(cb.try_acquire(), Admission::Allowed { probing: true });
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let cb = breaker();
        for _ in 0..3 {
            cb.record_failure();
        }

        tokio::time::advance(Duration::from_millis(1_000)).await;
        assert_eq!(cb.try_acquire(), Admission::Allowed { probing: true });

        cb.record_success();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        // Fresh reset window starts at the reopen
        match cb.try_acquire() {
            Admission::Rejected { retry_in } => assert_eq!(retry_in, Duration::from_millis(1_000)),
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_snapshot_counters() {
        let cb = breaker();

        cb.try_acquire();
        cb.record_success();
        cb.try_acquire();
        cb.record_failure();

        let snapshot = cb.snapshot();
        assert_eq!(snapshot.service, "pose_estimation");
        assert_eq!(snapshot.total_requests, 2);
        assert_eq!(snapshot.total_failures, 1);
        assert_eq!(snapshot.rejected_requests, 0);
        assert!((snapshot.success_rate - 0.5).abs() < f64::EPSILON);
        assert!(snapshot.retry_in_ms.is_none());
    }

    #[tokio::test]
    async fn test_reset_closes_circuit() {
        let cb = breaker();
        for _ in 0..3 {
            cb.record_failure();
        }
        assert_eq!(cb.state(), CircuitState::Open);

        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.try_acquire(), Admission::Allowed { probing: false });

        let transitions = cb.transitions();
        assert_eq!(transitions.len(), 2);
        assert_eq!(transitions[0].to, CircuitState::Open);
        assert_eq!(transitions[1].to, CircuitState::Closed);
    }

    #[test]
    fn test_result_window_rolls() {
        let mut window = ResultWindow::new(3);
        assert_eq!(window.success_rate(), 1.0);

        window.add_result(false);
        window.add_result(true);
        window.add_result(true);
        window.add_result(true);

        assert_eq!(window.success_rate(), 1.0);
    }
}
