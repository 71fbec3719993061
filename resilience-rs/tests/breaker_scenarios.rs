use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use resilience_rs::{
    CircuitState, FailureReason, FallbackChain, FallbackTier, ResilienceConfig, ResilienceLayer,
    ResultSource,
};
use serde_json::{json, Value};

fn layer_with(chain: FallbackChain) -> ResilienceLayer {
    ResilienceLayer::builder(ResilienceConfig::default())
        .service_with_fallback(chain)
        .build()
        .unwrap()
}

async fn fail(layer: &ResilienceLayer, service: &str) {
    let outcome = layer
        .execute_with_circuit_breaker(service, || async { Err(anyhow::anyhow!("upstream 503")) })
        .await
        .unwrap();
    assert!(outcome.is_fallback());
}

async fn succeed(layer: &ResilienceLayer, service: &str) -> bool {
    layer
        .execute_with_circuit_breaker(service, || async { Ok(json!({"ok": true})) })
        .await
        .unwrap()
        .is_primary()
}

#[test_log::test(tokio::test)]
async fn breaker_opens_after_failure_threshold() {
    let layer = layer_with(FallbackChain::new("pose_estimation"));

    for _ in 0..4 {
        fail(&layer, "pose_estimation").await;
    }
    assert_eq!(layer.breaker_state("pose_estimation").unwrap(), CircuitState::Closed);

    fail(&layer, "pose_estimation").await;
    assert_eq!(layer.breaker_state("pose_estimation").unwrap(), CircuitState::Open);

    let health = layer.get_health_report();
    assert!(!health.services["pose_estimation"].healthy);
    assert!(health.services["pose_estimation"].retry_in_ms.is_some());
}

#[test_log::test(tokio::test)]
async fn sixth_call_skips_operation_and_falls_back() {
    let layer = layer_with(
        FallbackChain::new("X").with_static(json!({"source": "cached", "value": 42})),
    );
    let calls = Arc::new(AtomicU32::new(0));

    for _ in 0..5 {
        let spy = calls.clone();
        layer
            .execute_with_circuit_breaker("X", move || async move {
                spy.fetch_add(1, Ordering::SeqCst);
                Err(anyhow::anyhow!("connection reset"))
            })
            .await
            .unwrap();
    }
    assert_eq!(calls.load(Ordering::SeqCst), 5);

    let spy = calls.clone();
    let outcome = layer
        .execute_with_circuit_breaker("X", move || async move {
            spy.fetch_add(1, Ordering::SeqCst);
            Ok(json!("live"))
        })
        .await
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 5);
    assert_eq!(outcome.source, ResultSource::Fallback(FallbackTier::RuleBased));
    assert_eq!(outcome.failure, Some(FailureReason::CircuitOpen));
    assert_eq!(outcome.value["value"], 42);
    assert_eq!(layer.get_health_report().services["X"].rejected_requests, 1);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn half_open_successes_close_the_circuit() {
    let layer = layer_with(FallbackChain::new("sensor_feed"));

    for _ in 0..5 {
        fail(&layer, "sensor_feed").await;
    }
    assert!(!succeed(&layer, "sensor_feed").await);

    tokio::time::advance(Duration::from_millis(30_000)).await;

    assert!(succeed(&layer, "sensor_feed").await);
    assert_eq!(layer.breaker_state("sensor_feed").unwrap(), CircuitState::HalfOpen);
    assert!(succeed(&layer, "sensor_feed").await);
    assert_eq!(layer.breaker_state("sensor_feed").unwrap(), CircuitState::HalfOpen);
    assert!(succeed(&layer, "sensor_feed").await);
    assert_eq!(layer.breaker_state("sensor_feed").unwrap(), CircuitState::Closed);

    let transitions: Vec<CircuitState> = layer
        .breaker_transitions("sensor_feed")
        .unwrap()
        .into_iter()
        .map(|t| t.to)
        .collect();
    assert_eq!(
        transitions,
        vec![CircuitState::Open, CircuitState::HalfOpen, CircuitState::Closed]
    );
}

#[test_log::test(tokio::test(start_paused = true))]
async fn half_open_failure_reopens_with_fresh_window() {
    let layer = layer_with(FallbackChain::new("sensor_feed"));

    for _ in 0..5 {
        fail(&layer, "sensor_feed").await;
    }
    tokio::time::advance(Duration::from_millis(30_000)).await;

    assert!(succeed(&layer, "sensor_feed").await);
    fail(&layer, "sensor_feed").await;
    assert_eq!(layer.breaker_state("sensor_feed").unwrap(), CircuitState::Open);

    tokio::time::advance(Duration::from_millis(29_999)).await;
    assert!(!succeed(&layer, "sensor_feed").await);

    tokio::time::advance(Duration::from_millis(1)).await;
    assert!(succeed(&layer, "sensor_feed").await);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn timeout_counts_as_failure() {
    let layer = layer_with(FallbackChain::new("video_stream"));

    let outcome = layer
        .execute_with_circuit_breaker("video_stream", || async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(json!("too late"))
        })
        .await
        .unwrap();

    assert_eq!(outcome.failure, Some(FailureReason::Timeout));
    assert_eq!(outcome.source, ResultSource::Fallback(FallbackTier::EmergencyStub));
    assert_eq!(outcome.value["service"], "video_stream");

    let health = layer.get_health_report();
    assert_eq!(health.services["video_stream"].total_failures, 1);
    assert_eq!(health.services["video_stream"].consecutive_failures, 1);
}

#[test_log::test(tokio::test)]
async fn fallback_tiers_are_tried_in_order() {
    let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

    let primary_order = order.clone();
    let rule_order = order.clone();
    let chain = FallbackChain::new("stats_api")
        .with_primary(move |_| {
            let order = primary_order.clone();
            async move {
                order.lock().push("primary");
                Ok::<Option<Value>, anyhow::Error>(None)
            }
        })
        .with_rule_based(move |_| {
            let order = rule_order.clone();
            async move {
                order.lock().push("rule_based");
                Err::<Option<Value>, _>(anyhow::anyhow!("no rule for this request"))
            }
        });

    let layer = layer_with(chain);
    let outcome = layer
        .execute_with_circuit_breaker("stats_api", || async { Err(anyhow::anyhow!("down")) })
        .await
        .unwrap();

    assert_eq!(*order.lock(), vec!["primary", "rule_based"]);
    assert_eq!(outcome.source, ResultSource::Fallback(FallbackTier::EmergencyStub));
    assert_eq!(outcome.value["fallback"], "emergency_stub");
}

#[test_log::test(tokio::test(start_paused = true))]
async fn health_monitor_flags_open_circuit() {
    let layer = layer_with(FallbackChain::new("pose_estimation"));
    let mut status = layer.subscribe_health();

    assert!(layer.start_health_monitor());
    for _ in 0..5 {
        fail(&layer, "pose_estimation").await;
    }

    tokio::time::sleep(Duration::from_millis(10_001)).await;
    status.changed().await.unwrap();

    let latest = layer.latest_health().unwrap();
    assert_eq!(latest.unhealthy, vec!["pose_estimation"]);
    layer.stop_health_monitor();
}
