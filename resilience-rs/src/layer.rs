//! # Resilience Layer
//!
//! Composition root for the resilience primitives. A layer owns one breaker
//! and one fallback chain per registered service, the emergency kill switch
//! and the health monitor. Services are fixed when the layer is built.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::audit::{AuditEntry, AuditLog, AuditSink, JsonlAuditSink};
use crate::circuit_breaker::{Admission, CircuitState, ServiceBreaker, StateTransition};
use crate::config::ResilienceConfig;
use crate::fallback::{ExecutionOutcome, FallbackChain};
use crate::health::{BreakerRegistry, HealthMonitor, HealthReport, HealthStatus};
use crate::kill_switch::{
    EmergencyKillSwitch, ShutdownHandler, ShutdownReport, ShutdownStatus, TriggerSource,
    TriplePressDetector,
};
use crate::types::{FailureReason, ResilienceError, Result};

/// Builder for [`ResilienceLayer`]
pub struct ResilienceLayerBuilder {
    config: ResilienceConfig,
    chains: Vec<FallbackChain>,
    audit_sink: Option<Box<dyn AuditSink>>,
}

impl ResilienceLayerBuilder {
    pub fn new(config: ResilienceConfig) -> Self {
        Self {
            config,
            chains: Vec::new(),
            audit_sink: None,
        }
    }

    /// Registers a service whose fallback is only the emergency stub
    pub fn service<S: Into<String>>(self, name: S) -> Self {
        self.service_with_fallback(FallbackChain::new(name))
    }

    /// Registers a service with its fallback chain
    pub fn service_with_fallback(mut self, chain: FallbackChain) -> Self {
        self.chains.push(chain);
        self
    }

    /// Mirrors the audit log to a custom sink instead of the configured file
    pub fn audit_sink(mut self, sink: Box<dyn AuditSink>) -> Self {
        self.audit_sink = Some(sink);
        self
    }

    pub fn build(self) -> Result<ResilienceLayer> {
        self.config.validate()?;

        let mut breakers = BTreeMap::new();
        let mut fallbacks = HashMap::new();
        for chain in self.chains {
            let name = chain.service().to_string();
            if fallbacks.contains_key(&name) {
                return Err(ResilienceError::DuplicateService(name));
            }
            let breaker = ServiceBreaker::new(name.clone(), self.config.breaker_for(&name).clone());
            breakers.insert(name.clone(), breaker);
            fallbacks.insert(name, chain);
        }

        let audit = match (self.audit_sink, &self.config.kill_switch.audit_log_path) {
            (Some(sink), _) => AuditLog::with_sink(sink),
            (None, Some(path)) => AuditLog::with_sink(Box::new(JsonlAuditSink::open(path)?)),
            (None, None) => AuditLog::new(),
        };

        let breakers: BreakerRegistry = Arc::new(breakers);
        let monitor = HealthMonitor::new(breakers.clone(), self.config.health.clone());
        let kill_switch = Arc::new(EmergencyKillSwitch::new(
            self.config.kill_switch.clone(),
            audit,
        ));
        let triple_press = TriplePressDetector::new(self.config.kill_switch.triple_press_window());

        info!(
            services = breakers.len(),
            durable_audit = self.config.kill_switch.audit_log_path.is_some(),
            "Resilience layer initialized"
        );

        Ok(ResilienceLayer {
            config: self.config,
            breakers,
            fallbacks,
            kill_switch,
            monitor,
            triple_press,
        })
    }
}

/// Circuit breakers, fallbacks, health and the kill switch for a fixed set of services
#[derive(Debug)]
pub struct ResilienceLayer {
    config: ResilienceConfig,
    breakers: BreakerRegistry,
    fallbacks: HashMap<String, FallbackChain>,
    kill_switch: Arc<EmergencyKillSwitch>,
    monitor: HealthMonitor,
    triple_press: TriplePressDetector,
}

impl ResilienceLayer {
    pub fn builder(config: ResilienceConfig) -> ResilienceLayerBuilder {
        ResilienceLayerBuilder::new(config)
    }

    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }

    /// Names of the registered services, sorted
    pub fn services(&self) -> impl Iterator<Item = &str> {
        self.breakers.keys().map(String::as_str)
    }

    /// Runs `operation` behind the service's breaker.
    ///
    /// For a registered service this always yields a value, from the real
    /// operation or from the fallback chain. The only error is an unknown
    /// service name.
    pub async fn execute_with_circuit_breaker<F, Fut>(
        &self,
        service: &str,
        operation: F,
    ) -> Result<ExecutionOutcome>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let (breaker, chain) = match (self.breakers.get(service), self.fallbacks.get(service)) {
            (Some(breaker), Some(chain)) => (breaker, chain),
            _ => return Err(ResilienceError::UnknownService(service.to_string())),
        };

        if self.kill_switch.is_active() {
            debug!(service = %service, "Kill switch active, operation skipped");
            counter!("circuit_breaker.emergency_skips", 1, "service" => service.to_string());
            return Ok(chain.resolve(FailureReason::EmergencyStop).await);
        }

        if let Admission::Rejected { .. } = breaker.try_acquire() {
            return Ok(chain.resolve(FailureReason::CircuitOpen).await);
        }

        let start = Instant::now();

        // Building the future runs caller code too
        let failure = match panic::catch_unwind(AssertUnwindSafe(operation)) {
            Err(_) => FailureReason::Panicked,
            Ok(future) => {
                let task = tokio::spawn(future);

                // On timeout the task is detached, not aborted.
                match tokio::time::timeout(breaker.config().timeout(), task).await {
                    Ok(Ok(Ok(value))) => {
                        breaker.record_success();
                        histogram!(
                            "circuit_breaker.call_duration_ms",
                            start.elapsed().as_millis() as f64,
                            "service" => service.to_string()
                        );
                        return Ok(ExecutionOutcome::primary(value));
                    }
                    Ok(Ok(Err(e))) => FailureReason::OperationFailed(e.to_string()),
                    Ok(Err(_join_error)) => FailureReason::Panicked,
                    Err(_) => FailureReason::Timeout,
                }
            }
        };

        breaker.record_failure();
        warn!(
            service = %service,
            reason = %failure,
            state = %breaker.state(),
            "Protected operation failed"
        );

        Ok(chain.resolve(failure).await)
    }

    /// Builds a health report from the current breaker state
    pub fn get_health_report(&self) -> HealthReport {
        HealthReport::build(&self.breakers, &self.config.health)
    }

    pub fn breaker_state(&self, service: &str) -> Result<CircuitState> {
        self.breaker(service).map(ServiceBreaker::state)
    }

    pub fn breaker_transitions(&self, service: &str) -> Result<Vec<StateTransition>> {
        self.breaker(service).map(ServiceBreaker::transitions)
    }

    /// Manually closes a service's breaker
    pub fn reset_breaker(&self, service: &str) -> Result<()> {
        self.breaker(service)?.reset();
        Ok(())
    }

    fn breaker(&self, service: &str) -> Result<&ServiceBreaker> {
        self.breakers
            .get(service)
            .ok_or_else(|| ResilienceError::UnknownService(service.to_string()))
    }

    /// Starts the periodic health sweep; false if it is already running
    pub fn start_health_monitor(&self) -> bool {
        self.monitor.start()
    }

    pub fn stop_health_monitor(&self) {
        self.monitor.stop();
    }

    pub fn latest_health(&self) -> Option<HealthReport> {
        self.monitor.latest()
    }

    pub fn subscribe_health(&self) -> tokio::sync::watch::Receiver<HealthStatus> {
        self.monitor.subscribe()
    }

    pub fn kill_switch(&self) -> Arc<EmergencyKillSwitch> {
        self.kill_switch.clone()
    }

    pub fn register_critical_system<S: Into<String>>(
        &self,
        name: S,
        handler: Arc<dyn ShutdownHandler>,
    ) -> Result<()> {
        self.kill_switch.register_critical_system(name, handler)
    }

    pub fn register_pre_shutdown_callback<S, F, Fut>(&self, system: S, callback: F)
    where
        S: Into<String>,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.kill_switch.register_pre_shutdown_callback(system, callback);
    }

    pub fn register_cleanup_task<S, F, Fut>(&self, name: S, task: F)
    where
        S: Into<String>,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.kill_switch.register_cleanup_task(name, task);
    }

    pub async fn activate_emergency_kill_switch<S: Into<String>>(
        &self,
        reason: S,
        source: TriggerSource,
    ) -> ShutdownReport {
        self.kill_switch.activate(reason, source).await
    }

    /// Feeds one cancel-key press; the third press inside the window pulls the switch
    pub async fn cancel_pressed(&self) -> Option<ShutdownReport> {
        if !self.triple_press.press() {
            return None;
        }
        Some(
            self.kill_switch
                .activate("triple cancel press", TriggerSource::TriplePressCancel)
                .await,
        )
    }

    pub fn get_audit_log(&self) -> Vec<AuditEntry> {
        self.kill_switch.get_audit_log()
    }

    pub fn get_shutdown_status(&self) -> ShutdownStatus {
        self.kill_switch.get_shutdown_status()
    }

    pub fn rearm_kill_switch<S: Into<String>>(&self, operator: S) -> bool {
        self.kill_switch.rearm(operator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditAction;
    use crate::fallback::{FallbackTier, ResultSource};
    use crate::kill_switch::shutdown_fn;
    use serde_json::json;

    async fn must_not_run() -> anyhow::Result<Value> {
        panic!("must not run while the switch is active")
    }

    fn layer() -> ResilienceLayer {
        ResilienceLayer::builder(ResilienceConfig::default())
            .service("stats_api")
            .service_with_fallback(
                FallbackChain::new("video_stream").with_static(json!({"frames": "placeholder"})),
            )
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_unknown_service_is_the_only_error() {
        let layer = layer();
        let err = layer
            .execute_with_circuit_breaker("weather", || async { Ok(json!(1)) })
            .await
            .unwrap_err();
        assert!(matches!(err, ResilienceError::UnknownService(name) if name == "weather"));
        assert!(layer.reset_breaker("weather").is_err());
    }

    #[tokio::test]
    async fn test_duplicate_service_rejected_at_build() {
        let result = ResilienceLayer::builder(ResilienceConfig::default())
            .service("stats_api")
            .service("stats_api")
            .build();
        assert!(matches!(result, Err(ResilienceError::DuplicateService(_))));
    }

    #[tokio::test]
    async fn test_success_returns_primary() {
        let layer = layer();
        let outcome = layer
            .execute_with_circuit_breaker("stats_api", || async { Ok(json!({"era": 3.12})) })
            .await
            .unwrap();

        assert!(outcome.is_primary());
        assert_eq!(outcome.value["era"], 3.12);
        assert_eq!(layer.get_health_report().services["stats_api"].total_requests, 1);
    }

    #[tokio::test]
    async fn test_failure_serves_fallback_with_reason() {
        let layer = layer();
        let outcome = layer
            .execute_with_circuit_breaker("video_stream", || async {
                Err(anyhow::anyhow!("decoder crashed"))
            })
            .await
            .unwrap();

        assert_eq!(outcome.source, ResultSource::Fallback(FallbackTier::RuleBased));
        assert_eq!(
            outcome.failure,
            Some(FailureReason::OperationFailed("decoder crashed".into()))
        );
    }

    #[tokio::test]
    async fn test_panicking_operation_counts_as_failure() {
        let layer = layer();
        let outcome = layer
            .execute_with_circuit_breaker("stats_api", || async {
                if true {
                    panic!("driver bug");
                }
                Ok(json!(null))
            })
            .await
            .unwrap();

        assert_eq!(outcome.failure, Some(FailureReason::Panicked));
        assert_eq!(layer.get_health_report().services["stats_api"].total_failures, 1);
    }

    #[tokio::test]
    async fn test_panic_while_building_operation_counts_as_failure() {
        let layer = layer();
        let outcome = layer
            .execute_with_circuit_breaker("stats_api", || -> futures::future::Ready<anyhow::Result<Value>> {
                panic!("bad args")
            })
            .await
            .unwrap();

        assert!(outcome.is_fallback());
        assert_eq!(outcome.failure, Some(FailureReason::Panicked));
        let health = layer.get_health_report();
        assert_eq!(health.services["stats_api"].total_failures, 1);
        assert_eq!(health.services["stats_api"].consecutive_failures, 1);
    }

    #[tokio::test]
    async fn test_kill_switch_overrides_breaker() {
        let layer = layer();
        layer
            .register_critical_system("video_stream", shutdown_fn(|| async { Ok(()) }))
            .unwrap();
        layer
            .activate_emergency_kill_switch("drill", TriggerSource::Manual)
            .await;

        let outcome = layer
            .execute_with_circuit_breaker("stats_api", must_not_run)
            .await
            .unwrap();

        assert_eq!(outcome.failure, Some(FailureReason::EmergencyStop));
        assert_eq!(layer.breaker_state("stats_api").unwrap(), CircuitState::Closed);

        assert!(layer.rearm_kill_switch("ops"));
        let outcome = layer
            .execute_with_circuit_breaker("stats_api", || async { Ok(json!("live")) })
            .await
            .unwrap();
        assert!(outcome.is_primary());
    }

    #[tokio::test]
    async fn test_reset_breaker_closes_open_circuit() {
        let layer = layer();
        for _ in 0..5 {
            layer
                .execute_with_circuit_breaker("stats_api", || async { Err(anyhow::anyhow!("503")) })
                .await
                .unwrap();
        }
        assert_eq!(layer.breaker_state("stats_api").unwrap(), CircuitState::Open);
        assert_eq!(layer.get_health_report().unhealthy, vec!["stats_api"]);

        layer.reset_breaker("stats_api").unwrap();
        assert_eq!(layer.breaker_state("stats_api").unwrap(), CircuitState::Closed);
        assert_eq!(layer.breaker_transitions("stats_api").unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_triple_cancel_press_activates() {
        let layer = layer();
        layer
            .register_critical_system("video_stream", shutdown_fn(|| async { Ok(()) }))
            .unwrap();

        assert!(layer.cancel_pressed().await.is_none());
        assert!(layer.cancel_pressed().await.is_none());
        let report = layer.cancel_pressed().await.unwrap();

        assert!(report.verified);
        let activation = &layer.get_audit_log()[0];
        assert_eq!(activation.action, AuditAction::Activation);
        assert_eq!(activation.source.as_deref(), Some("triple_press_cancel"));
    }

    #[tokio::test]
    async fn test_configured_audit_path_is_durable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");

        let mut config = ResilienceConfig::default();
        config.kill_switch.audit_log_path = Some(path.clone());

        let layer = ResilienceLayer::builder(config)
            .service("stats_api")
            .build()
            .unwrap();
        layer
            .register_critical_system("stats_api", shutdown_fn(|| async { Ok(()) }))
            .unwrap();
        let report = layer
            .activate_emergency_kill_switch("drill", TriggerSource::Manual)
            .await;

        let persisted = std::fs::read_to_string(&path).unwrap();
        assert_eq!(persisted.lines().count(), report.audit_log_len);
    }
}
