//! # Health Reporting
//!
//! Passive health metrics for the protected services. The report is built
//! from breaker snapshots on demand, and a periodic sweep keeps the latest
//! report, publishes the overall status and emits gauges. The sweep never
//! pages or alerts; the report is the only monitoring surface.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use metrics::gauge;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::circuit_breaker::{CircuitState, ServiceBreaker};
use crate::config::HealthConfig;

/// Registered breakers, fixed at construction time
pub type BreakerRegistry = Arc<BTreeMap<String, ServiceBreaker>>;

/// Overall health across all services
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    /// Every service is healthy
    Healthy,
    /// At least one service is unhealthy
    Degraded,
    /// Every service is unhealthy
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "HEALTHY"),
            HealthStatus::Degraded => write!(f, "DEGRADED"),
            HealthStatus::Unhealthy => write!(f, "UNHEALTHY"),
        }
    }
}

/// Health of a single protected service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceHealth {
    pub state: CircuitState,
    pub success_rate: f64,
    pub total_requests: u64,
    pub total_failures: u64,
    pub rejected_requests: u64,
    pub consecutive_failures: u32,
    pub retry_in_ms: Option<u64>,
    pub healthy: bool,
}

/// Consolidated health report for an external dashboard
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub generated_at: DateTime<Utc>,
    pub overall: HealthStatus,
    pub services: BTreeMap<String, ServiceHealth>,
    pub unhealthy: Vec<String>,
}

impl HealthReport {
    /// Builds a report from the current breaker state
    pub fn build(breakers: &BTreeMap<String, ServiceBreaker>, config: &HealthConfig) -> Self {
        let mut services = BTreeMap::new();
        let mut unhealthy = Vec::new();

        for (name, breaker) in breakers {
            let snapshot = breaker.snapshot();
            let healthy = snapshot.state != CircuitState::Open
                && snapshot.success_rate >= config.min_success_rate;

            if !healthy {
                unhealthy.push(name.clone());
            }

            services.insert(
                name.clone(),
                ServiceHealth {
                    state: snapshot.state,
                    success_rate: snapshot.success_rate,
                    total_requests: snapshot.total_requests,
                    total_failures: snapshot.total_failures,
                    rejected_requests: snapshot.rejected_requests,
                    consecutive_failures: snapshot.consecutive_failures,
                    retry_in_ms: snapshot.retry_in_ms,
                    healthy,
                },
            );
        }

        let overall = if unhealthy.is_empty() {
            HealthStatus::Healthy
        } else if unhealthy.len() == services.len() {
            HealthStatus::Unhealthy
        } else {
            HealthStatus::Degraded
        };

        Self {
            generated_at: Utc::now(),
            overall,
            services,
            unhealthy,
        }
    }
}

/// Periodic health sweep over the registered breakers
#[derive(Debug)]
pub struct HealthMonitor {
    breakers: BreakerRegistry,
    config: HealthConfig,
    latest: Arc<RwLock<Option<HealthReport>>>,
    status_tx: Arc<watch::Sender<HealthStatus>>,
    shutdown_tx: broadcast::Sender<()>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl HealthMonitor {
    pub fn new(breakers: BreakerRegistry, config: HealthConfig) -> Self {
        let (status_tx, _) = watch::channel(HealthStatus::Healthy);
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            breakers,
            config,
            latest: Arc::new(RwLock::new(None)),
            status_tx: Arc::new(status_tx),
            shutdown_tx,
            worker: Mutex::new(None),
        }
    }

    /// Runs one sweep: rebuilds the report, records it and publishes the status
    pub fn sweep(&self) -> HealthReport {
        sweep_once(&self.breakers, &self.config, &self.latest, &self.status_tx)
    }

    /// Starts the background sweep. Returns false if it is already running.
    pub fn start(&self) -> bool {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return false;
        }

        let breakers = self.breakers.clone();
        let config = self.config.clone();
        let latest = self.latest.clone();
        let status_tx = self.status_tx.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(config.sweep_interval());

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("Health sweep worker shutting down");
                        break;
                    }
                    _ = interval.tick() => {
                        sweep_once(&breakers, &config, &latest, &status_tx);
                    }
                }
            }
        });

        info!(
            interval_ms = self.config.sweep_interval_ms,
            services = self.breakers.len(),
            "Health sweep started"
        );
        *worker = Some(handle);
        true
    }

    /// Stops the background sweep
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(());
        if let Some(handle) = self.worker.lock().take() {
            handle.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker.lock().is_some()
    }

    /// The report produced by the most recent sweep
    pub fn latest(&self) -> Option<HealthReport> {
        self.latest.read().clone()
    }

    /// Receives the overall status after every sweep
    pub fn subscribe(&self) -> watch::Receiver<HealthStatus> {
        self.status_tx.subscribe()
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        if let Some(handle) = self.worker.get_mut().take() {
            handle.abort();
        }
    }
}

fn sweep_once(
    breakers: &BTreeMap<String, ServiceBreaker>,
    config: &HealthConfig,
    latest: &RwLock<Option<HealthReport>>,
    status_tx: &watch::Sender<HealthStatus>,
) -> HealthReport {
    let report = HealthReport::build(breakers, config);

    for (name, health) in &report.services {
        gauge!("circuit_breaker.success_rate", health.success_rate, "service" => name.clone());
        if !health.healthy {
            warn!(
                service = %name,
                state = %health.state,
                success_rate = %format!("{:.2}", health.success_rate),
                "Service unhealthy"
            );
        }
    }

    debug!(
        overall = %report.overall,
        unhealthy = report.unhealthy.len(),
        "Health sweep complete"
    );

    status_tx.send_replace(report.overall);
    *latest.write() = Some(report.clone());
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CircuitBreakerConfig;
    use std::time::Duration;

    fn registry(names: &[&str]) -> BreakerRegistry {
        let breakers = names
            .iter()
            .map(|name| {
                (
                    name.to_string(),
                    ServiceBreaker::new(*name, CircuitBreakerConfig::default()),
                )
            })
            .collect();
        Arc::new(breakers)
    }

    #[tokio::test]
    async fn test_report_flags_open_and_low_success_rate() {
        let breakers = registry(&["video_stream", "sensor_feed", "stats_api"]);

        for _ in 0..5 {
            breakers["video_stream"].record_failure();
        }
        breakers["sensor_feed"].record_success();
        breakers["sensor_feed"].record_failure();

        let report = HealthReport::build(&breakers, &HealthConfig::default());

        assert_eq!(report.overall, HealthStatus::Degraded);
        assert_eq!(report.unhealthy, vec!["sensor_feed", "video_stream"]);
        assert_eq!(report.services["video_stream"].state, CircuitState::Open);
        assert!(report.services["stats_api"].healthy);
        assert_eq!(report.services["sensor_feed"].total_failures, 1);
    }

    #[tokio::test]
    async fn test_all_unhealthy() {
        let breakers = registry(&["video_stream"]);
        breakers["video_stream"].record_failure();

        let report = HealthReport::build(&breakers, &HealthConfig::default());
        assert_eq!(report.overall, HealthStatus::Unhealthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_sweep_publishes_status() {
        let breakers = registry(&["video_stream", "stats_api"]);
        let monitor = HealthMonitor::new(
            breakers.clone(),
            HealthConfig {
                sweep_interval_ms: 100,
                ..HealthConfig::default()
            },
        );
        let mut status = monitor.subscribe();

        assert!(monitor.start());
        assert!(!monitor.start());

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(monitor.latest().map(|r| r.overall), Some(HealthStatus::Healthy));

        for _ in 0..5 {
            breakers["video_stream"].record_failure();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        status.changed().await.unwrap();
        assert_eq!(*status.borrow(), HealthStatus::Degraded);

        monitor.stop();
        assert!(!monitor.is_running());
    }
}
