//! Execution engine
//!
//! The single-operation pipeline:
//!
//! ```text
//! catalog lookup → argument check → policy → audit(decision)
//!     → [allowed, executing] lock → provider (timeout) → unlock → audit(execution)
//!     → envelope
//! ```
//!
//! Unknown operations and invalid arguments stop before policy and are not
//! audited. Every decision is audited before any lock is taken; every
//! attempted execution is audited after its lock is released. An audit
//! failure at either point fails the request with
//! [`EngineError::AuditWriteFailure`].

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use strum::Display;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::audit::{AuditPhase, AuditRecord, AuditTrail};
use crate::catalog::{OperationCatalog, OperationSpec, RejectedRecord};
use crate::envelope::{Envelope, EnvelopeBuilder, OperationStatus};
use crate::error::{EngineError, Result};
use crate::locks::{LockConflict, LockGuard, LockInfo, LockManager};
use crate::policy::{ConfirmationChallenger, Decision, DecisionReason, PolicyContext, PolicyEvaluator};
use crate::provider::{ExecutionResult, Provider, ProviderError, ProviderRequest, run_with_timeout};
use crate::rate_limit::RateLimiter;
use crate::types::{Actor, RequestMode, Role};

/// Extra lease time past the provider timeout, so a lock never expires under
/// a provider that is still within its budget
const LOCK_MARGIN: Duration = Duration::from_secs(1);

/// Runtime knobs for the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    pub lock_ttl: Duration,
    pub lock_poll: Duration,
    pub provider_timeout: Duration,
    pub rate_limit_window: Duration,
    pub confirmation_window: Duration,
    /// Fixed interval for rate-limit and lock sweeps
    pub maintenance_interval: Duration,
    pub max_parallel: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(120),
            lock_poll: Duration::from_millis(50),
            provider_timeout: Duration::from_secs(60),
            rate_limit_window: Duration::from_secs(60),
            confirmation_window: Duration::from_secs(300),
            maintenance_interval: Duration::from_secs(30),
            max_parallel: 4,
        }
    }
}

/// Why a step or request did not succeed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum FailureReason {
    UnknownOperation,
    InvalidArguments,
    MissingTarget,
    PolicyDenied,
    LockConflict,
    ProviderError,
    ProviderTimeout,
    /// Provider ran and reported `success = false`
    ProviderFailed,
    AuditWriteFailure,
}

/// One request into the pipeline
#[derive(Debug, Clone, PartialEq)]
pub struct OperationRequest {
    pub operation_id: String,
    pub target_id: String,
    pub actor: Actor,
    pub arguments: Value,
    pub confirmation_token: Option<String>,
    pub supplied_capabilities: BTreeSet<String>,
    pub mode: RequestMode,
    pub correlation_id: Option<String>,
    pub workflow_id: Option<String>,
    /// Wait up to this long for a busy target instead of failing at once
    pub lock_wait: Option<Duration>,
}

impl OperationRequest {
    pub fn new(operation_id: impl Into<String>, target_id: impl Into<String>, actor: Actor) -> Self {
        Self {
            operation_id: operation_id.into(),
            target_id: target_id.into(),
            actor,
            arguments: Value::Null,
            confirmation_token: None,
            supplied_capabilities: BTreeSet::new(),
            mode: RequestMode::Execute,
            correlation_id: None,
            workflow_id: None,
            lock_wait: None,
        }
    }

    pub fn with_arguments(mut self, arguments: Value) -> Self {
        self.arguments = arguments;
        self
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.supplied_capabilities.insert(capability.into());
        self
    }

    pub fn with_confirmation(mut self, token: impl Into<String>) -> Self {
        self.confirmation_token = Some(token.into());
        self
    }

    pub fn with_mode(mut self, mode: RequestMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn simulate(self) -> Self {
        self.with_mode(RequestMode::Simulate)
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_workflow_id(mut self, id: impl Into<String>) -> Self {
        self.workflow_id = Some(id.into());
        self
    }

    pub fn with_lock_wait(mut self, wait: Duration) -> Self {
        self.lock_wait = Some(wait);
        self
    }

    fn policy_context(&self) -> PolicyContext {
        PolicyContext {
            confirmation_token: self.confirmation_token.clone(),
            supplied_capabilities: self.supplied_capabilities.clone(),
        }
    }
}

pub(crate) fn new_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

/// Why a lock+provider attempt did not produce a result
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AttemptFailure {
    #[error(transparent)]
    Lock(#[from] LockConflict),

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

impl AttemptFailure {
    pub fn reason(&self) -> FailureReason {
        match self {
            Self::Lock(_) => FailureReason::LockConflict,
            Self::Provider(ProviderError::Timeout { .. }) => FailureReason::ProviderTimeout,
            Self::Provider(_) => FailureReason::ProviderError,
        }
    }
}

/// Outcome of one audited lock+provider attempt
#[derive(Debug, Clone)]
pub(crate) struct Attempt {
    pub result: std::result::Result<ExecutionResult, AttemptFailure>,
    pub audit_sequence: u64,
}

impl Attempt {
    pub fn succeeded(&self) -> bool {
        matches!(&self.result, Ok(result) if result.success)
    }

    pub fn failure_reason(&self) -> Option<FailureReason> {
        match &self.result {
            Ok(result) if result.success => None,
            Ok(_) => Some(FailureReason::ProviderFailed),
            Err(failure) => Some(failure.reason()),
        }
    }
}

/// Counts from one maintenance pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub rate_counters: usize,
    pub locks: usize,
}

fn sweep(limiter: &RateLimiter, locks: &LockManager) -> SweepReport {
    SweepReport {
        rate_counters: limiter.sweep(Instant::now()),
        locks: locks.sweep_expired(),
    }
}

/// Background sweeper; stops when dropped
struct Maintenance {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Maintenance {
    fn spawn(limiter: Arc<RateLimiter>, locks: Arc<LockManager>, interval: Duration) -> Option<Self> {
        let (stop, stopped) = mpsc::channel::<()>();
        let spawned = std::thread::Builder::new()
            .name("engine-maintenance".to_string())
            .spawn(move || {
                debug!("Maintenance thread started");
                loop {
                    match stopped.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            let report = sweep(&limiter, &locks);
                            if report != SweepReport::default() {
                                debug!(?report, "Maintenance sweep");
                            }
                        }
                        _ => break,
                    }
                }
                debug!("Maintenance thread stopped");
            });
        match spawned {
            Ok(handle) => Some(Self {
                stop: Some(stop),
                handle: Some(handle),
            }),
            Err(e) => {
                warn!("Failed to start maintenance thread, sweeps disabled: {}", e);
                None
            }
        }
    }
}

impl Drop for Maintenance {
    fn drop(&mut self) {
        drop(self.stop.take());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Policy-gated execution engine
pub struct Engine {
    catalog: RwLock<Arc<OperationCatalog>>,
    policy: PolicyEvaluator,
    locks: Arc<LockManager>,
    audit: Arc<dyn AuditTrail>,
    provider: Arc<dyn Provider>,
    settings: EngineSettings,
    runs: DashMap<String, Arc<AtomicBool>>,
    _maintenance: Option<Maintenance>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("operations", &self.catalog().len())
            .field("provider", &self.provider.name())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Engine {
    pub fn builder(
        catalog: OperationCatalog,
        audit: Arc<dyn AuditTrail>,
        provider: Arc<dyn Provider>,
    ) -> EngineBuilder {
        EngineBuilder::new(catalog, audit, provider)
    }

    /// Snapshot of the current catalog
    pub fn catalog(&self) -> Arc<OperationCatalog> {
        let guard = self.catalog.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(&guard)
    }

    /// Swap in a new catalog; in-flight requests keep their snapshot
    pub fn replace_catalog(&self, catalog: OperationCatalog) {
        let mut guard = self.catalog.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Arc::new(catalog);
        info!("Catalog replaced ({} operations)", guard.len());
    }

    /// Load `dir` and swap it in; returns the rejected records
    pub fn reload_catalog(&self, dir: &Path) -> Result<Vec<RejectedRecord>> {
        let load = OperationCatalog::load_from_directory(dir)?;
        self.replace_catalog(load.catalog);
        Ok(load.rejected)
    }

    pub fn policy(&self) -> &PolicyEvaluator {
        &self.policy
    }

    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// The confirmation token a caller must present right now
    pub fn challenge_for(&self, operation_id: &str, target_id: &str, actor_id: &str) -> String {
        self.policy
            .challenger()
            .challenge(operation_id, target_id, actor_id, std::time::SystemTime::now())
    }

    /// Run one maintenance pass now
    pub fn sweep(&self) -> SweepReport {
        sweep(self.policy.limiter(), &self.locks)
    }

    /// Run one operation through the full pipeline
    pub fn submit(&self, request: OperationRequest) -> Result<Envelope> {
        let catalog = self.catalog();
        let spec = self.resolve(&catalog, &request)?;
        let correlation_id = request
            .correlation_id
            .clone()
            .unwrap_or_else(new_correlation_id);

        let decision = self.decide(&request, spec, &correlation_id)?;
        if !decision.allowed {
            return Ok(self.deny_envelope(&request, &decision, &correlation_id));
        }
        if request.mode.is_simulation() {
            return Ok(self.simulate_envelope(&request, &decision, &correlation_id));
        }

        let attempt = self.attempt(&request, spec, &decision, &correlation_id, 1)?;
        match attempt.result {
            Err(AttemptFailure::Lock(conflict)) => Err(EngineError::LockConflict(conflict)),
            _ => Ok(self.execute_envelope(&request, &decision, &attempt, &correlation_id)),
        }
    }

    /// Operations visible to `role` (all of them when `None`)
    pub fn inspect_catalog(&self, role: Option<Role>) -> Envelope {
        let catalog = self.catalog();
        let operations: Vec<&OperationSpec> = match role {
            Some(role) => catalog.list_for_role(role),
            None => catalog.all().collect(),
        };
        let mut builder = EnvelopeBuilder::inspect(&new_correlation_id(), "catalog.list").data(json!({
            "count": operations.len(),
            "operations": operations,
        }));
        if let Some(role) = role {
            builder = builder.metadata("role", json!(role));
        }
        builder.build()
    }

    /// Lock status of a target
    pub fn inspect_target(&self, target_id: &str) -> Envelope {
        let holder = self.locks.holder(target_id);
        EnvelopeBuilder::inspect(&new_correlation_id(), "target.status")
            .data(json!({
                "target": target_id,
                "locked": holder.is_some(),
                "holder": holder,
            }))
            .build()
    }

    /// Flag a running workflow for cancellation; false if none is running
    pub fn cancel(&self, correlation_id: &str) -> bool {
        match self.runs.get(correlation_id) {
            Some(flag) => {
                flag.store(true, Ordering::SeqCst);
                info!(correlation = correlation_id, "Cancellation requested");
                true
            }
            None => false,
        }
    }

    /// Flag every running workflow for cancellation
    pub fn cancel_all(&self) -> usize {
        let mut flagged = 0;
        for entry in self.runs.iter() {
            entry.value().store(true, Ordering::SeqCst);
            flagged += 1;
        }
        if flagged > 0 {
            info!(flagged, "Cancellation requested for all running workflows");
        }
        flagged
    }

    pub(crate) fn register_run(&self, correlation_id: &str) -> Arc<AtomicBool> {
        let flag = Arc::new(AtomicBool::new(false));
        self.runs.insert(correlation_id.to_string(), Arc::clone(&flag));
        flag
    }

    pub(crate) fn finish_run(&self, correlation_id: &str) {
        self.runs.remove(correlation_id);
    }

    /// Catalog lookup and schema check
    pub(crate) fn resolve<'c>(
        &self,
        catalog: &'c OperationCatalog,
        request: &OperationRequest,
    ) -> Result<&'c OperationSpec> {
        let spec = catalog
            .get_by_id(&request.operation_id)
            .map_err(|_| EngineError::UnknownOperation {
                id: request.operation_id.clone(),
            })?;
        spec.validate_arguments(&request.arguments).map_err(|e| {
            debug!(operation = %spec.id, "Rejected arguments: {}", e);
            EngineError::InvalidArguments {
                operation: spec.id.clone(),
                reason: match e {
                    crate::catalog::CatalogError::InvalidArguments { reason, .. } => reason,
                    other => other.to_string(),
                },
            }
        })?;
        Ok(spec)
    }

    fn record(
        &self,
        request: &OperationRequest,
        correlation_id: &str,
        phase: AuditPhase,
        decision: &Decision,
        attempt: u32,
    ) -> AuditRecord {
        AuditRecord {
            correlation_id: correlation_id.to_string(),
            workflow_id: request.workflow_id.clone(),
            actor_id: request.actor.id.clone(),
            actor_role: request.actor.role,
            operation_id: request.operation_id.clone(),
            target_id: request.target_id.clone(),
            arguments: request.arguments.clone(),
            mode: request.mode,
            phase,
            decision: decision.clone(),
            execution_result: None,
            failure: None,
            attempt,
        }
    }

    /// Evaluate policy and audit the decision
    pub(crate) fn decide(
        &self,
        request: &OperationRequest,
        spec: &OperationSpec,
        correlation_id: &str,
    ) -> Result<Decision> {
        let decision = self.policy.evaluate(
            &request.actor,
            spec,
            &request.target_id,
            &request.policy_context(),
            request.mode,
        );
        let record = self.record(request, correlation_id, AuditPhase::Decision, &decision, 1);
        self.audit.append(record).map_err(|e| {
            error!(
                correlation = correlation_id,
                operation = %spec.id,
                "Failed to audit decision: {}", e
            );
            EngineError::audit_write(false, &e)
        })?;
        Ok(decision)
    }

    /// Lock, execute, unlock, then audit the outcome
    pub(crate) fn attempt(
        &self,
        request: &OperationRequest,
        spec: &OperationSpec,
        decision: &Decision,
        correlation_id: &str,
        attempt: u32,
    ) -> Result<Attempt> {
        let timeout = spec.timeout().unwrap_or(self.settings.provider_timeout);
        let ttl = self.settings.lock_ttl.max(timeout + LOCK_MARGIN);
        let holder = request.actor.id.as_str();

        let acquired = match request.lock_wait {
            Some(wait) => self.locks.acquire_wait(
                &request.target_id,
                holder,
                ttl,
                wait,
                self.settings.lock_poll,
            ),
            None => self.locks.acquire(&request.target_id, holder, ttl),
        };

        let result = match acquired {
            Err(conflict) => Err(AttemptFailure::Lock(conflict)),
            Ok(token) => {
                let guard = LockGuard::adopt(Arc::clone(&self.locks), &request.target_id, token);
                let provider_request = ProviderRequest {
                    operation_id: spec.id.clone(),
                    target_id: request.target_id.clone(),
                    arguments: request.arguments.clone(),
                    correlation_id: correlation_id.to_string(),
                    actor_id: request.actor.id.clone(),
                    timeout,
                    expected_sha256: spec.script_sha256.clone(),
                };
                let outcome = run_with_timeout(Arc::clone(&self.provider), provider_request);
                guard.release();
                outcome.map_err(AttemptFailure::Provider)
            }
        };

        let mut record = self.record(request, correlation_id, AuditPhase::Execution, decision, attempt);
        let provider_succeeded = match &result {
            Ok(execution) => {
                record.execution_result = Some(execution.clone());
                if !execution.success {
                    record.failure = Some(FailureReason::ProviderFailed.to_string());
                }
                execution.success
            }
            Err(failure) => {
                record.failure = Some(format!("{}: {}", failure.reason(), failure));
                false
            }
        };

        let entry = self.audit.append(record).map_err(|e| {
            error!(
                correlation = correlation_id,
                operation = %spec.id,
                provider_succeeded,
                "Failed to audit execution: {}", e
            );
            EngineError::audit_write(provider_succeeded, &e)
        })?;

        info!(
            correlation = correlation_id,
            operation = %spec.id,
            target = %request.target_id,
            attempt,
            success = provider_succeeded,
            "Execution recorded at sequence {}", entry.sequence_number
        );
        Ok(Attempt {
            result,
            audit_sequence: entry.sequence_number,
        })
    }

    /// Lock holder that would block an execution right now
    pub(crate) fn blocking_holder(&self, target_id: &str) -> Option<LockInfo> {
        self.locks.holder(target_id)
    }

    fn deny_envelope(&self, request: &OperationRequest, decision: &Decision, correlation_id: &str) -> Envelope {
        let challenge = (decision.reason == DecisionReason::ConfirmationRequired).then(|| {
            self.challenge_for(&request.operation_id, &request.target_id, &request.actor.id)
        });
        EnvelopeBuilder::policy_deny(
            correlation_id,
            &request.operation_id,
            decision,
            challenge.as_deref(),
            request.mode,
        )
        .metadata("target", json!(request.target_id))
        .metadata("actor", json!(request.actor.id))
        .build()
    }

    fn simulate_envelope(&self, request: &OperationRequest, decision: &Decision, correlation_id: &str) -> Envelope {
        let holder = self.blocking_holder(&request.target_id);
        let status = if holder.is_some() {
            OperationStatus::Failure
        } else {
            OperationStatus::Success
        };
        EnvelopeBuilder::simulate(correlation_id, &request.operation_id, status)
            .data(json!({
                "target": request.target_id,
                "decision": decision,
                "wouldExecute": holder.is_none(),
                "lockHolder": holder,
            }))
            .metadata("actor", json!(request.actor.id))
            .build()
    }

    fn execute_envelope(
        &self,
        request: &OperationRequest,
        decision: &Decision,
        attempt: &Attempt,
        correlation_id: &str,
    ) -> Envelope {
        let status = if attempt.succeeded() {
            OperationStatus::Success
        } else {
            OperationStatus::Failure
        };
        let (result, failure) = match &attempt.result {
            Ok(result) => (Some(result), None),
            Err(failure) => (None, Some(failure.to_string())),
        };
        EnvelopeBuilder::execute(correlation_id, &request.operation_id, status)
            .data(json!({
                "target": request.target_id,
                "decision": decision,
                "result": result,
                "failure": failure,
                "failureReason": attempt.failure_reason(),
                "auditSequence": attempt.audit_sequence,
            }))
            .metadata("actor", json!(request.actor.id))
            .build()
    }
}

/// Builder for [`Engine`]
pub struct EngineBuilder {
    catalog: OperationCatalog,
    audit: Arc<dyn AuditTrail>,
    provider: Arc<dyn Provider>,
    settings: EngineSettings,
    challenger: Option<ConfirmationChallenger>,
    maintenance: bool,
}

impl EngineBuilder {
    pub fn new(catalog: OperationCatalog, audit: Arc<dyn AuditTrail>, provider: Arc<dyn Provider>) -> Self {
        Self {
            catalog,
            audit,
            provider,
            settings: EngineSettings::default(),
            challenger: None,
            maintenance: true,
        }
    }

    pub fn settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Use a fixed challenger (otherwise a random secret is generated)
    pub fn challenger(mut self, challenger: ConfirmationChallenger) -> Self {
        self.challenger = Some(challenger);
        self
    }

    /// Skip the background sweeper; call [`Engine::sweep`] manually
    pub fn without_maintenance(mut self) -> Self {
        self.maintenance = false;
        self
    }

    pub fn build(self) -> Engine {
        let challenger = self
            .challenger
            .unwrap_or_else(|| ConfirmationChallenger::new(self.settings.confirmation_window));
        let policy = PolicyEvaluator::new(challenger, RateLimiter::new(self.settings.rate_limit_window));
        let locks = Arc::new(LockManager::new());
        let maintenance = if self.maintenance {
            Maintenance::spawn(
                policy.shared_limiter(),
                Arc::clone(&locks),
                self.settings.maintenance_interval,
            )
        } else {
            None
        };
        info!(
            "Engine ready: {} operation(s), provider '{}'",
            self.catalog.len(),
            self.provider.name()
        );
        Engine {
            catalog: RwLock::new(Arc::new(self.catalog)),
            policy,
            locks,
            audit: self.audit,
            provider: self.provider,
            settings: self.settings,
            runs: DashMap::new(),
            _maintenance: maintenance,
        }
    }
}
