//! # Fallback Chains
//!
//! Graceful degradation for a protected service. When the real operation is
//! skipped or fails, the chain tries its tiers in order:
//!
//! 1. primary fallback (e.g. a cached or secondary source)
//! 2. rule-based or static fallback
//! 3. the emergency stub, a static JSON object that cannot fail
//!
//! A tier that yields nothing (`None` or JSON `null`), returns an error or
//! panics hands over to the next tier.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use futures::FutureExt;
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::types::FailureReason;

/// Boxed future returned by a fallback tier
pub type FallbackFuture = BoxFuture<'static, anyhow::Result<Option<Value>>>;

/// A dynamic fallback tier
pub type FallbackFn = Arc<dyn Fn(FallbackContext) -> FallbackFuture + Send + Sync>;

/// Tiers of the fallback chain, in the order they are tried
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackTier {
    Primary,
    RuleBased,
    EmergencyStub,
}

impl FallbackTier {
    fn label(&self) -> &'static str {
        match self {
            FallbackTier::Primary => "primary",
            FallbackTier::RuleBased => "rule_based",
            FallbackTier::EmergencyStub => "emergency_stub",
        }
    }
}

/// Identifies the source of a result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", content = "tier", rename_all = "snake_case")]
pub enum ResultSource {
    /// From the real operation
    Primary,
    /// From a fallback tier
    Fallback(FallbackTier),
}

/// What a fallback tier is told about the failure it is covering
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackContext {
    pub service: String,
    pub reason: FailureReason,
}

/// Result of a protected execution; always carries a usable value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub value: Value,
    pub source: ResultSource,
    /// Why the primary result is missing, if it is
    pub failure: Option<FailureReason>,
}

impl ExecutionOutcome {
    pub fn primary(value: Value) -> Self {
        Self {
            value,
            source: ResultSource::Primary,
            failure: None,
        }
    }

    /// Returns true if the result used a fallback
    pub fn is_fallback(&self) -> bool {
        matches!(self.source, ResultSource::Fallback(_))
    }

    /// Returns true if the result is from the real operation
    pub fn is_primary(&self) -> bool {
        matches!(self.source, ResultSource::Primary)
    }
}

enum RuleBased {
    Dynamic(FallbackFn),
    Static(Value),
}

/// The ordered fallback tiers configured for one service
pub struct FallbackChain {
    service: String,
    primary: Option<FallbackFn>,
    rule_based: Option<RuleBased>,
    emergency_stub: Value,
}

impl std::fmt::Debug for FallbackChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackChain")
            .field("service", &self.service)
            .field("has_primary", &self.primary.is_some())
            .field("has_rule_based", &self.rule_based.is_some())
            .field("emergency_stub", &self.emergency_stub)
            .finish()
    }
}

fn boxed<F, Fut>(f: F) -> FallbackFn
where
    F: Fn(FallbackContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Option<Value>>> + Send + 'static,
{
    Arc::new(move |ctx| f(ctx).boxed())
}

/// The stub served when every other tier came up empty
pub fn default_emergency_stub(service: &str) -> Value {
    json!({
        "service": service,
        "status": "degraded",
        "fallback": "emergency_stub",
        "data": null,
        "message": format!("{} is temporarily unavailable", service),
    })
}

impl FallbackChain {
    /// Creates a chain holding only the default emergency stub
    pub fn new<S: Into<String>>(service: S) -> Self {
        let service = service.into();
        let emergency_stub = default_emergency_stub(&service);
        Self {
            service,
            primary: None,
            rule_based: None,
            emergency_stub,
        }
    }

    /// Sets the first tier
    pub fn with_primary<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(FallbackContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Option<Value>>> + Send + 'static,
    {
        self.primary = Some(boxed(f));
        self
    }

    /// Sets the second tier to a rule evaluated at failure time
    pub fn with_rule_based<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(FallbackContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Option<Value>>> + Send + 'static,
    {
        self.rule_based = Some(RuleBased::Dynamic(boxed(f)));
        self
    }

    /// Sets the second tier to a fixed value
    pub fn with_static(mut self, value: Value) -> Self {
        self.rule_based = Some(RuleBased::Static(value));
        self
    }

    /// Replaces the generated emergency stub
    pub fn with_emergency_stub(mut self, value: Value) -> Self {
        self.emergency_stub = value;
        self
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Walks the tiers in order and returns the first usable value
    pub async fn resolve(&self, reason: FailureReason) -> ExecutionOutcome {
        let start = Instant::now();
        let context = FallbackContext {
            service: self.service.clone(),
            reason: reason.clone(),
        };

        let mut served = None;

        if let Some(primary) = &self.primary {
            served = self
                .run_tier(FallbackTier::Primary, primary, context.clone())
                .await
                .map(|value| (value, FallbackTier::Primary));
        }

        if served.is_none() {
            served = match &self.rule_based {
                Some(RuleBased::Dynamic(rule)) => self
                    .run_tier(FallbackTier::RuleBased, rule, context)
                    .await
                    .map(|value| (value, FallbackTier::RuleBased)),
                Some(RuleBased::Static(value)) if !value.is_null() => {
                    Some((value.clone(), FallbackTier::RuleBased))
                }
                _ => None,
            };
        }

        let (value, tier) = served.unwrap_or_else(|| {
            warn!(
                service = %self.service,
                reason = %reason,
                "All fallback tiers empty, serving emergency stub"
            );
            (self.emergency_stub.clone(), FallbackTier::EmergencyStub)
        });

        counter!(
            "fallback.served",
            1,
            "service" => self.service.clone(),
            "tier" => tier.label()
        );
        histogram!(
            "fallback.duration_ms",
            start.elapsed().as_millis() as f64,
            "service" => self.service.clone()
        );

        info!(
            service = %self.service,
            tier = tier.label(),
            reason = %reason,
            "Fallback served"
        );

        ExecutionOutcome {
            value,
            source: ResultSource::Fallback(tier),
            failure: Some(reason),
        }
    }

    async fn run_tier(
        &self,
        tier: FallbackTier,
        handler: &FallbackFn,
        context: FallbackContext,
    ) -> Option<Value> {
        let attempt = AssertUnwindSafe(async { handler(context).await })
            .catch_unwind()
            .await;

        match attempt {
            Ok(Ok(Some(value))) if !value.is_null() => Some(value),
            Ok(Ok(_)) => {
                debug!(service = %self.service, tier = tier.label(), "Fallback tier returned nothing");
                None
            }
            Ok(Err(e)) => {
                warn!(
                    service = %self.service,
                    tier = tier.label(),
                    error = %e,
                    "Fallback tier failed"
                );
                counter!(
                    "fallback.tier_failures",
                    1,
                    "service" => self.service.clone(),
                    "tier" => tier.label()
                );
                None
            }
            Err(_) => {
                error!(service = %self.service, tier = tier.label(), "Fallback tier panicked");
                counter!(
                    "fallback.tier_failures",
                    1,
                    "service" => self.service.clone(),
                    "tier" => tier.label()
                );
                None
            }
        }
    }
}
