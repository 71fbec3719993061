//! # Emergency Kill Switch
//!
//! One global stop for every registered critical system. Activation fans out
//! one shutdown routine per system under a single time budget, force-marks
//! whatever is still running at the deadline, runs cleanup tasks and verifies
//! that every system ended up in the shutdown set. Each step is written to
//! the append-only audit log.
//!
//! Activation is safe to repeat: a second trigger only appends another
//! activation entry and shuts down systems registered since the last run.

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use metrics::{counter, histogram};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::audit::{AuditAction, AuditEntry, AuditLog, AuditRecord, AuditStatus};
use crate::config::KillSwitchConfig;
use crate::types::{ResilienceError, Result};

/// Async hook run before a system's shutdown or after the fan-out
pub type HookFn = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// What pulled the switch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "caller", rename_all = "snake_case")]
pub enum TriggerSource {
    Manual,
    Hotkey,
    TriplePressCancel,
    Policy,
    /// An API caller, identified by name
    Api(String),
}

impl TriggerSource {
    fn label(&self) -> &'static str {
        match self {
            TriggerSource::Manual => "manual",
            TriggerSource::Hotkey => "hotkey",
            TriggerSource::TriplePressCancel => "triple_press_cancel",
            TriggerSource::Policy => "policy",
            TriggerSource::Api(_) => "api",
        }
    }
}

impl std::fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TriggerSource::Api(caller) => write!(f, "api:{}", caller),
            other => write!(f, "{}", other.label()),
        }
    }
}

/// Stops one critical system
#[async_trait]
pub trait ShutdownHandler: Send + Sync {
    async fn shutdown(&self) -> anyhow::Result<()>;
}

/// Adapts an async closure into a [`ShutdownHandler`]
pub struct FnShutdownHandler<F>(F);

#[async_trait]
impl<F, Fut> ShutdownHandler for FnShutdownHandler<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn shutdown(&self) -> anyhow::Result<()> {
        (self.0)().await
    }
}

/// Wraps an async closure as a shareable shutdown handler
pub fn shutdown_fn<F, Fut>(f: F) -> Arc<dyn ShutdownHandler>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnShutdownHandler(f))
}

fn hook<F, Fut>(f: F) -> HookFn
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move || f().boxed())
}

/// A system whose teardown reported an error or panicked
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownFailure {
    pub system: String,
    pub error: String,
}

/// Summary of an activation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShutdownReport {
    pub elapsed_ms: u64,
    pub systems_shut_down: Vec<String>,
    /// Systems still running at the deadline
    pub forced: Vec<String>,
    pub errors: Vec<ShutdownFailure>,
    pub audit_log_len: usize,
    /// Every registered system is in the shutdown set
    pub verified: bool,
}

/// Current state of the switch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownStatus {
    pub is_active: bool,
    pub systems_shutdown: Vec<String>,
    pub shutdown_complete: bool,
}

#[derive(Debug, Default)]
struct EmergencyState {
    is_active: bool,
    in_progress: bool,
    cleanup_done: bool,
    verified: bool,
    shutdown_systems: BTreeSet<String>,
    forced: Vec<String>,
    errors: Vec<ShutdownFailure>,
    started_at: Option<Instant>,
    elapsed_ms: Option<u64>,
}

impl EmergencyState {
    fn report(&self, audit_log_len: usize) -> ShutdownReport {
        let elapsed_ms = self.elapsed_ms.unwrap_or_else(|| {
            self.started_at
                .map(|start| start.elapsed().as_millis() as u64)
                .unwrap_or(0)
        });

        ShutdownReport {
            elapsed_ms,
            systems_shut_down: self.shutdown_systems.iter().cloned().collect(),
            forced: self.forced.clone(),
            errors: self.errors.clone(),
            audit_log_len,
            verified: self.verified,
        }
    }
}

/// The emergency kill switch
pub struct EmergencyKillSwitch {
    config: KillSwitchConfig,
    systems: RwLock<BTreeMap<String, Arc<dyn ShutdownHandler>>>,
    pre_shutdown: RwLock<HashMap<String, Vec<HookFn>>>,
    cleanup: RwLock<Vec<(String, HookFn)>>,
    state: Arc<Mutex<EmergencyState>>,
    audit: Arc<AuditLog>,
}

impl std::fmt::Debug for EmergencyKillSwitch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let systems: Vec<String> = self.systems.read().keys().cloned().collect();
        f.debug_struct("EmergencyKillSwitch")
            .field("config", &self.config)
            .field("systems", &systems)
            .field("state", &*self.state.lock())
            .field("audit", &self.audit)
            .finish()
    }
}

impl EmergencyKillSwitch {
    pub fn new(config: KillSwitchConfig, audit: AuditLog) -> Self {
        Self {
            config,
            systems: RwLock::new(BTreeMap::new()),
            pre_shutdown: RwLock::new(HashMap::new()),
            cleanup: RwLock::new(Vec::new()),
            state: Arc::new(Mutex::new(EmergencyState::default())),
            audit: Arc::new(audit),
        }
    }

    /// Registers a system that must be stopped on activation
    pub fn register_critical_system<S: Into<String>>(
        &self,
        name: S,
        handler: Arc<dyn ShutdownHandler>,
    ) -> Result<()> {
        let name = name.into();
        let mut systems = self.systems.write();
        if systems.contains_key(&name) {
            return Err(ResilienceError::DuplicateService(name));
        }

        info!(system = %name, "Critical system registered");
        systems.insert(name, handler);
        Ok(())
    }

    /// Registers a hook run right before the named system's shutdown
    pub fn register_pre_shutdown_callback<S, F, Fut>(&self, system: S, callback: F)
    where
        S: Into<String>,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.pre_shutdown
            .write()
            .entry(system.into())
            .or_default()
            .push(hook(callback));
    }

    /// Registers a task run once after the shutdown fan-out
    pub fn register_cleanup_task<S, F, Fut>(&self, name: S, task: F)
    where
        S: Into<String>,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.cleanup.write().push((name.into(), hook(task)));
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().is_active
    }

    pub fn get_audit_log(&self) -> Vec<AuditEntry> {
        self.audit.snapshot()
    }

    pub fn get_shutdown_status(&self) -> ShutdownStatus {
        let state = self.state.lock();
        let systems = self.systems.read();
        let shutdown_complete = state.is_active
            && !state.in_progress
            && systems.keys().all(|name| state.shutdown_systems.contains(name));

        ShutdownStatus {
            is_active: state.is_active,
            systems_shutdown: state.shutdown_systems.iter().cloned().collect(),
            shutdown_complete,
        }
    }

    /// Shuts down every pending critical system
    pub async fn activate<S: Into<String>>(&self, reason: S, source: TriggerSource) -> ShutdownReport {
        let reason = reason.into();

        counter!("kill_switch.activations", 1, "source" => source.label());

        let pending = {
            let mut state = self.state.lock();
            let systems = self.systems.read();
            let pending: Vec<(String, Arc<dyn ShutdownHandler>)> = systems
                .iter()
                .filter(|(name, _)| !state.shutdown_systems.contains(*name))
                .map(|(name, handler)| (name.clone(), handler.clone()))
                .collect();

            let ignored = state.in_progress || (state.is_active && pending.is_empty());
            let mut details = environment_fingerprint();
            details["pending_systems"] = json!(pending.len());

            self.audit.append(
                AuditRecord::new(
                    AuditAction::Activation,
                    if ignored { AuditStatus::Ignored } else { AuditStatus::Initiated },
                )
                .reason(reason.clone())
                .source(source.to_string())
                .details(details),
            );

            if ignored {
                warn!(
                    reason = %reason,
                    source = %source,
                    in_progress = state.in_progress,
                    "Kill switch already engaged, activation recorded only"
                );
                return state.report(self.audit.len());
            }

            if !state.is_active {
                state.is_active = true;
                state.cleanup_done = false;
                state.started_at = Some(Instant::now());
                state.forced.clear();
                state.errors.clear();
            }
            state.in_progress = true;
            state.verified = false;
            state.elapsed_ms = None;
            pending
        };
        let _episode = EpisodeGuard {
            state: self.state.clone(),
        };

        error!(
            reason = %reason,
            source = %source,
            systems = pending.len(),
            "EMERGENCY KILL SWITCH ACTIVATED"
        );

        self.shut_down_systems(pending).await;
        self.run_cleanup().await;
        self.verify()
    }

    async fn shut_down_systems(&self, pending: Vec<(String, Arc<dyn ShutdownHandler>)>) {
        let budget = self.config.shutdown_timeout();

        let mut tasks: Vec<(String, JoinHandle<()>)> = {
            let callbacks = self.pre_shutdown.read();
            pending
                .into_iter()
                .map(|(name, handler)| {
                    let hooks = callbacks.get(&name).cloned().unwrap_or_default();
                    let handle = tokio::spawn(shut_down_system(
                        name.clone(),
                        handler,
                        hooks,
                        self.state.clone(),
                        self.audit.clone(),
                    ));
                    (name, handle)
                })
                .collect()
        };

        let fan_out = join_all(tasks.iter_mut().map(|(_, handle)| handle));
        if tokio::time::timeout(budget, fan_out).await.is_ok() {
            return;
        }

        warn!(
            budget_ms = %budget.as_millis(),
            "Shutdown budget exhausted, forcing remaining systems"
        );

        for (name, handle) in tasks {
            handle.abort();

            let mut state = self.state.lock();
            if !state.shutdown_systems.insert(name.clone()) {
                continue;
            }
            state.forced.push(name.clone());
            self.audit.append(
                AuditRecord::new(AuditAction::ForcedShutdown, AuditStatus::Forced)
                    .system(name.clone())
                    .reason(format!("still running after {} ms", budget.as_millis())),
            );
            counter!("kill_switch.forced", 1, "system" => name.clone());
            error!(system = %name, "System force-marked as shut down");
        }
    }

    async fn run_cleanup(&self) {
        {
            let mut state = self.state.lock();
            if state.cleanup_done {
                return;
            }
            state.cleanup_done = true;
        }

        let tasks = self.cleanup.read().clone();
        let budget = self.config.shutdown_timeout();

        for (name, task) in tasks {
            // Calling the task runs caller code, so it happens inside the unwind boundary
            let contained = AssertUnwindSafe(async { task().await }).catch_unwind();
            let attempt = tokio::time::timeout(budget, contained).await;
            let failure = match attempt {
                Ok(Ok(Ok(()))) => None,
                Ok(Ok(Err(e))) => Some(e.to_string()),
                Ok(Err(payload)) => Some(format!("panicked: {}", panic_message(payload))),
                Err(_) => Some(format!("timed out after {} ms", budget.as_millis())),
            };

            let record = AuditRecord::new(
                AuditAction::Cleanup,
                if failure.is_some() { AuditStatus::Error } else { AuditStatus::Success },
            )
            .system(name.clone());

            match failure {
                Some(e) => {
                    error!(task = %name, error = %e, "Cleanup task failed");
                    self.audit.append(record.reason(e));
                }
                None => {
                    info!(task = %name, "Cleanup task complete");
                    self.audit.append(record);
                }
            }
        }
    }

    fn verify(&self) -> ShutdownReport {
        let mut state = self.state.lock();
        let missing: Vec<String> = self
            .systems
            .read()
            .keys()
            .filter(|name| !state.shutdown_systems.contains(*name))
            .cloned()
            .collect();

        state.verified = missing.is_empty();
        state.in_progress = false;
        let elapsed_ms = state
            .started_at
            .map(|start| start.elapsed().as_millis() as u64)
            .unwrap_or(0);
        state.elapsed_ms = Some(elapsed_ms);

        self.audit.append(
            AuditRecord::new(
                AuditAction::Verification,
                if state.verified { AuditStatus::Passed } else { AuditStatus::Failed },
            )
            .details(json!({
                "systems_shut_down": state.shutdown_systems.len(),
                "missing": missing,
                "elapsed_ms": elapsed_ms,
            })),
        );

        histogram!("kill_switch.shutdown_duration_ms", elapsed_ms as f64);

        if state.verified {
            info!(
                elapsed_ms,
                systems = state.shutdown_systems.len(),
                forced = state.forced.len(),
                errors = state.errors.len(),
                "Emergency shutdown complete"
            );
        } else {
            error!(missing = ?missing, "Emergency shutdown verification failed");
        }

        state.report(self.audit.len())
    }

    /// Ends the current episode so a later activation starts afresh.
    /// Returns false if there was nothing to rearm.
    pub fn rearm<S: Into<String>>(&self, operator: S) -> bool {
        let operator = operator.into();
        let mut state = self.state.lock();

        let refusal = if state.in_progress {
            Some("shutdown in progress")
        } else if !state.is_active {
            Some("kill switch not active")
        } else {
            None
        };

        if let Some(refusal) = refusal {
            self.audit.append(
                AuditRecord::new(AuditAction::Rearm, AuditStatus::Ignored)
                    .source(operator.clone())
                    .reason(refusal),
            );
            warn!(operator = %operator, reason = refusal, "Rearm refused");
            return false;
        }

        let systems: Vec<String> = state.shutdown_systems.iter().cloned().collect();
        *state = EmergencyState::default();

        self.audit.append(
            AuditRecord::new(AuditAction::Rearm, AuditStatus::Success)
                .source(operator.clone())
                .details(json!({ "previously_shut_down": systems })),
        );
        info!(operator = %operator, "Kill switch rearmed");
        true
    }
}

/// Ends the in-progress episode however `activate` exits
struct EpisodeGuard {
    state: Arc<Mutex<EmergencyState>>,
}

impl Drop for EpisodeGuard {
    fn drop(&mut self) {
        self.state.lock().in_progress = false;
    }
}

async fn shut_down_system(
    name: String,
    handler: Arc<dyn ShutdownHandler>,
    hooks: Vec<HookFn>,
    state: Arc<Mutex<EmergencyState>>,
    audit: Arc<AuditLog>,
) {
    let started = Instant::now();

    let routine = async {
        let mut hook_errors = Vec::new();
        for callback in &hooks {
            if let Err(e) = callback().await {
                warn!(system = %name, error = %e, "Pre-shutdown callback failed");
                hook_errors.push(e.to_string());
            }
        }
        (handler.shutdown().await, hook_errors)
    };

    let outcome = AssertUnwindSafe(routine).catch_unwind().await;
    let elapsed_ms = started.elapsed().as_millis() as u64;

    let mut state = state.lock();
    // Already force-marked at the deadline
    if !state.shutdown_systems.insert(name.clone()) {
        return;
    }

    let failure = match outcome {
        Ok((Ok(()), hook_errors)) => {
            info!(system = %name, elapsed_ms, "System shut down");
            audit.append(
                AuditRecord::new(AuditAction::SystemShutdown, AuditStatus::Success)
                    .system(name.clone())
                    .details(json!({ "elapsed_ms": elapsed_ms, "callback_errors": hook_errors })),
            );
            return;
        }
        Ok((Err(e), _)) => e.to_string(),
        Err(payload) => format!("panicked: {}", panic_message(payload)),
    };

    error!(system = %name, error = %failure, "System shutdown failed");
    counter!("kill_switch.shutdown_errors", 1, "system" => name.clone());
    audit.append(
        AuditRecord::new(AuditAction::SystemShutdown, AuditStatus::Error)
            .system(name.clone())
            .reason(failure.clone())
            .details(json!({ "elapsed_ms": elapsed_ms })),
    );
    state.errors.push(ShutdownFailure {
        system: name,
        error: failure,
    });
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Where and what was running when the switch was pulled
fn environment_fingerprint() -> Value {
    json!({
        "os": std::env::consts::OS,
        "arch": std::env::consts::ARCH,
        "pid": std::process::id(),
        "version": env!("CARGO_PKG_VERSION"),
        "host": std::env::var("HOSTNAME").ok(),
    })
}

/// Detects three cancel presses inside a short window
#[derive(Debug)]
pub struct TriplePressDetector {
    window: Duration,
    presses: Mutex<VecDeque<Instant>>,
}

impl TriplePressDetector {
    const PRESSES: usize = 3;

    pub fn new(window: Duration) -> Self {
        Self {
            window,
            presses: Mutex::new(VecDeque::with_capacity(Self::PRESSES)),
        }
    }

    /// Records a press; returns true when it completes a triple press
    pub fn press(&self) -> bool {
        let now = Instant::now();
        let mut presses = self.presses.lock();

        while let Some(first) = presses.front() {
            if now.duration_since(*first) > self.window {
                presses.pop_front();
            } else {
                break;
            }
        }

        presses.push_back(now);
        if presses.len() >= Self::PRESSES {
            presses.clear();
            info!(window_ms = %self.window.as_millis(), "Triple cancel press detected");
            return true;
        }
        false
    }
}
