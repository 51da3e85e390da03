//! Workflow Engine
//!
//! Ordered steps, each a full pass through the engine pipeline, with a per-step
//! failure policy.
//!
//! # Step Outcomes
//!
//! | Outcome | `Abort`             | `Continue` | `Retry { .. }`                    |
//! |---------|---------------------|------------|-----------------------------------|
//! | Denied  | stop, rest skipped  | next step  | same as `Abort`                   |
//! | Failed  | stop, rest skipped  | next step  | re-run lock+provider, then `Abort`|
//! | Locked  | stop, rest skipped  | next step  | same as `Abort`                   |
//!
//! An audit write failure always stops the run. Cancelling a run lets the
//! in-flight step finish (without further retries) and ends it as `Aborted`. Consecutive steps marked
//! `independent` that touch distinct targets run as one batch with bounded
//! parallelism.
//!
//! # Workflow File
//!
//! ```json
//! {
//!   "id": "reprovision",
//!   "steps": [
//!     { "id": "wipe", "operationId": "disk.wipe", "targetId": "disk0",
//!       "arguments": { "method": "quick" },
//!       "onFailure": { "policy": "retry", "maxAttempts": 3, "backoffMs": 200 } },
//!     { "id": "reboot", "operationId": "device.reboot" }
//!   ]
//! }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use strum::Display;
use tracing::{debug, error, info, warn};

use crate::engine::{Engine, FailureReason, OperationRequest, new_correlation_id};
use crate::envelope::{Envelope, EnvelopeBuilder, OperationStatus};
use crate::error::EngineError;
use crate::policy::Decision;
use crate::provider::ExecutionResult;
use crate::types::{Actor, RequestMode};

/// What to do when a step does not succeed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "lowercase")]
pub enum FailurePolicy {
    #[default]
    Abort,
    Continue,
    Retry {
        /// Total attempts, the first included
        #[serde(rename = "maxAttempts")]
        max_attempts: u32,
        #[serde(rename = "backoffMs", default)]
        backoff_ms: u64,
    },
}

impl FailurePolicy {
    /// Delay before attempt `failed_attempt + 1`
    pub fn backoff(&self, failed_attempt: u32) -> Duration {
        match self {
            Self::Retry { backoff_ms, .. } => {
                let factor = 1u64 << failed_attempt.saturating_sub(1).min(16);
                Duration::from_millis(backoff_ms.saturating_mul(factor))
            }
            _ => Duration::ZERO,
        }
    }

    fn max_attempts(&self) -> u32 {
        match self {
            Self::Retry { max_attempts, .. } => (*max_attempts).max(1),
            _ => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStep {
    pub id: String,
    pub operation_id: String,
    /// Falls back to the run's default target
    #[serde(default)]
    pub target_id: Option<String>,
    #[serde(default)]
    pub arguments: Value,
    #[serde(default)]
    pub on_failure: FailurePolicy,
    #[serde(default)]
    pub independent: bool,
}

impl WorkflowStep {
    pub fn new(id: impl Into<String>, operation_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            operation_id: operation_id.into(),
            target_id: None,
            arguments: Value::Null,
            on_failure: FailurePolicy::Abort,
            independent: false,
        }
    }

    pub fn target(mut self, target_id: impl Into<String>) -> Self {
        self.target_id = Some(target_id.into());
        self
    }

    pub fn arguments(mut self, arguments: Value) -> Self {
        self.arguments = arguments;
        self
    }

    pub fn on_failure(mut self, policy: FailurePolicy) -> Self {
        self.on_failure = policy;
        self
    }

    pub fn independent(mut self) -> Self {
        self.independent = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub id: String,
    pub steps: Vec<WorkflowStep>,
}

impl Workflow {
    pub fn new(id: impl Into<String>, steps: Vec<WorkflowStep>) -> Self {
        Self {
            id: id.into(),
            steps,
        }
    }

    /// Load a workflow definition from a JSON file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        use anyhow::Context;
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read workflow file: {}", path.display()))?;
        let workflow: Workflow = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse workflow file: {}", path.display()))?;
        let mut seen = HashSet::new();
        for step in &workflow.steps {
            if !seen.insert(step.id.as_str()) {
                anyhow::bail!("Workflow '{}' has duplicate step id '{}'", workflow.id, step.id);
            }
        }
        Ok(workflow)
    }
}

/// Who runs the workflow and with what evidence
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowContext {
    pub actor: Actor,
    pub default_target: Option<String>,
    pub supplied_capabilities: BTreeSet<String>,
    /// Confirmation token per step id
    pub confirmations: BTreeMap<String, String>,
    pub mode: RequestMode,
    pub correlation_id: Option<String>,
}

impl WorkflowContext {
    pub fn new(actor: Actor) -> Self {
        Self {
            actor,
            default_target: None,
            supplied_capabilities: BTreeSet::new(),
            confirmations: BTreeMap::new(),
            mode: RequestMode::Execute,
            correlation_id: None,
        }
    }

    pub fn with_target(mut self, target_id: impl Into<String>) -> Self {
        self.default_target = Some(target_id.into());
        self
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.supplied_capabilities.insert(capability.into());
        self
    }

    pub fn with_confirmation(mut self, step_id: impl Into<String>, token: impl Into<String>) -> Self {
        self.confirmations.insert(step_id.into(), token.into());
        self
    }

    pub fn simulate(mut self) -> Self {
        self.mode = RequestMode::Simulate;
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    PartiallyCompleted,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum StepStatus {
    Success,
    Failed,
    Denied,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub step_id: String,
    pub operation_id: String,
    pub target_id: String,
    pub status: StepStatus,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision: Option<Decision>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_result: Option<ExecutionResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<FailureReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl StepResult {
    fn new(step: &WorkflowStep, target_id: &str, status: StepStatus) -> Self {
        Self {
            step_id: step.id.clone(),
            operation_id: step.operation_id.clone(),
            target_id: target_id.to_string(),
            status,
            attempts: 0,
            decision: None,
            execution_result: None,
            reason: None,
            detail: None,
        }
    }

    fn failed(mut self, reason: FailureReason, detail: impl Into<String>) -> Self {
        self.status = StepStatus::Failed;
        self.reason = Some(reason);
        self.detail = Some(detail.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRun {
    pub id: String,
    pub workflow_id: String,
    pub correlation_id: String,
    pub status: RunStatus,
    pub step_results: Vec<StepResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fatal_error: Option<String>,
}

impl WorkflowRun {
    pub fn statuses(&self) -> Vec<StepStatus> {
        self.step_results.iter().map(|r| r.status).collect()
    }

    pub fn envelope(&self, mode: RequestMode) -> Envelope {
        let status = match self.status {
            RunStatus::Completed => OperationStatus::Success,
            RunStatus::PartiallyCompleted => OperationStatus::Partial,
            _ => OperationStatus::Failure,
        };
        let builder = match mode {
            RequestMode::Execute => EnvelopeBuilder::execute(&self.correlation_id, &self.workflow_id, status),
            RequestMode::Simulate => EnvelopeBuilder::simulate(&self.correlation_id, &self.workflow_id, status),
        };
        builder
            .data(json!(self))
            .metadata("workflow", json!(true))
            .build()
    }
}

/// How a step's outcome steers the run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Proceed,
    Stop,
    Fatal,
}

fn flow_after(step: &WorkflowStep, result: &StepResult) -> Flow {
    if result.reason == Some(FailureReason::AuditWriteFailure) {
        return Flow::Fatal;
    }
    match (result.status, step.on_failure) {
        (StepStatus::Success | StepStatus::Skipped, _) => Flow::Proceed,
        (_, FailurePolicy::Continue) => Flow::Proceed,
        // Retry exhausted, a lock conflict or a denial under Retry ends like Abort
        (_, FailurePolicy::Abort | FailurePolicy::Retry { .. }) => Flow::Stop,
    }
}

/// Group consecutive independent steps with distinct targets
fn plan_batches(steps: &[(usize, String)], workflow: &Workflow) -> Vec<Vec<usize>> {
    let mut batches: Vec<Vec<usize>> = Vec::new();
    let mut targets: HashSet<&str> = HashSet::new();
    for (index, target) in steps {
        let step = &workflow.steps[*index];
        let joins = step.independent
            && !targets.contains(target.as_str())
            && batches
                .last()
                .is_some_and(|batch| batch.iter().all(|&i| workflow.steps[i].independent));
        if joins {
            if let Some(batch) = batches.last_mut() {
                batch.push(*index);
            }
        } else {
            targets.clear();
            batches.push(vec![*index]);
        }
        targets.insert(target.as_str());
    }
    batches
}

impl Engine {
    /// Run a workflow to completion (or abort/cancellation)
    pub fn execute_workflow(&self, workflow: &Workflow, context: &WorkflowContext) -> WorkflowRun {
        let correlation_id = context
            .correlation_id
            .clone()
            .unwrap_or_else(new_correlation_id);
        let mut run = WorkflowRun {
            id: new_correlation_id(),
            workflow_id: workflow.id.clone(),
            correlation_id: correlation_id.clone(),
            status: RunStatus::Pending,
            step_results: Vec::with_capacity(workflow.steps.len()),
            fatal_error: None,
        };
        let cancelled = self.register_run(&correlation_id);
        run.status = RunStatus::Running;
        info!(
            workflow = %workflow.id,
            correlation = %correlation_id,
            steps = workflow.steps.len(),
            mode = %context.mode,
            "Workflow started"
        );

        let targets: Vec<(usize, String)> = workflow
            .steps
            .iter()
            .enumerate()
            .map(|(i, step)| {
                let target = step
                    .target_id
                    .clone()
                    .or_else(|| context.default_target.clone())
                    .unwrap_or_default();
                (i, target)
            })
            .collect();

        let mut results: Vec<Option<StepResult>> = vec![None; workflow.steps.len()];
        let mut stopped = false;
        let mut aborted_by_cancel = false;
        let mut any_failure = false;

        for batch in plan_batches(&targets, workflow) {
            if cancelled.load(Ordering::SeqCst) {
                aborted_by_cancel = true;
                break;
            }

            let batch_results: Vec<(usize, StepResult)> = if batch.len() == 1 {
                let index = batch[0];
                vec![(
                    index,
                    self.run_step(workflow, &workflow.steps[index], &targets[index].1, context, &correlation_id, &cancelled),
                )]
            } else {
                self.run_batch(workflow, &batch, &targets, context, &correlation_id, &cancelled)
            };

            for (index, result) in batch_results {
                let step = &workflow.steps[index];
                if result.status != StepStatus::Success {
                    any_failure = true;
                }
                match flow_after(step, &result) {
                    Flow::Proceed => {}
                    Flow::Stop => stopped = true,
                    Flow::Fatal => {
                        stopped = true;
                        if run.fatal_error.is_none() {
                            run.fatal_error = result.detail.clone();
                        }
                    }
                }
                results[index] = Some(result);
            }
            if stopped {
                // A step cut short by cancellation ends the run as aborted
                if run.fatal_error.is_none() && cancelled.load(Ordering::SeqCst) {
                    aborted_by_cancel = true;
                }
                break;
            }
        }

        for (index, slot) in results.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(StepResult::new(&workflow.steps[index], &targets[index].1, StepStatus::Skipped));
            }
        }
        run.step_results = results.into_iter().flatten().collect();
        run.status = if aborted_by_cancel {
            RunStatus::Aborted
        } else if stopped {
            RunStatus::Failed
        } else if any_failure {
            RunStatus::PartiallyCompleted
        } else {
            RunStatus::Completed
        };
        self.finish_run(&correlation_id);

        if let Some(fatal) = &run.fatal_error {
            error!(workflow = %workflow.id, correlation = %correlation_id, "Workflow failed fatally: {}", fatal);
        }
        info!(
            workflow = %workflow.id,
            correlation = %correlation_id,
            status = %run.status,
            "Workflow finished"
        );
        run
    }

    fn run_batch(
        &self,
        workflow: &Workflow,
        batch: &[usize],
        targets: &[(usize, String)],
        context: &WorkflowContext,
        correlation_id: &str,
        cancelled: &AtomicBool,
    ) -> Vec<(usize, StepResult)> {
        let width = self.settings().max_parallel.max(1);
        debug!(size = batch.len(), width, "Running independent batch");
        let mut out = Vec::with_capacity(batch.len());
        for chunk in batch.chunks(width) {
            std::thread::scope(|scope| {
                let handles: Vec<_> = chunk
                    .iter()
                    .map(|&index| {
                        let step = &workflow.steps[index];
                        let target = targets[index].1.as_str();
                        (
                            index,
                            scope.spawn(move || {
                                self.run_step(workflow, step, target, context, correlation_id, cancelled)
                            }),
                        )
                    })
                    .collect();
                for (index, handle) in handles {
                    let result = handle.join().unwrap_or_else(|_| {
                        StepResult::new(&workflow.steps[index], &targets[index].1, StepStatus::Failed)
                            .failed(FailureReason::ProviderError, "step thread panicked")
                    });
                    out.push((index, result));
                }
            });
        }
        out
    }

    fn run_step(
        &self,
        workflow: &Workflow,
        step: &WorkflowStep,
        target_id: &str,
        context: &WorkflowContext,
        correlation_id: &str,
        cancelled: &AtomicBool,
    ) -> StepResult {
        let result = StepResult::new(step, target_id, StepStatus::Failed);
        if target_id.is_empty() {
            return result.failed(FailureReason::MissingTarget, "step has no target and no default target is set");
        }

        let mut request = OperationRequest::new(&step.operation_id, target_id, context.actor.clone())
            .with_arguments(step.arguments.clone())
            .with_mode(context.mode)
            .with_correlation_id(correlation_id)
            .with_workflow_id(&workflow.id);
        request.supplied_capabilities = context.supplied_capabilities.clone();
        request.confirmation_token = context.confirmations.get(&step.id).cloned();

        let catalog = self.catalog();
        let spec = match self.resolve(&catalog, &request) {
            Ok(spec) => spec,
            Err(EngineError::UnknownOperation { id }) => {
                return result.failed(FailureReason::UnknownOperation, format!("unknown operation '{}'", id));
            }
            Err(e) => return result.failed(FailureReason::InvalidArguments, e.to_string()),
        };

        let decision = match self.decide(&request, spec, correlation_id) {
            Ok(decision) => decision,
            Err(e) => return result.failed(FailureReason::AuditWriteFailure, e.to_string()),
        };
        let mut result = StepResult {
            decision: Some(decision.clone()),
            ..result
        };

        if !decision.allowed {
            debug!(step = %step.id, reason = %decision.reason, "Step denied");
            result.status = StepStatus::Denied;
            result.reason = Some(FailureReason::PolicyDenied);
            result.detail = Some(decision.reason.to_string());
            return result;
        }

        if context.mode.is_simulation() {
            return match self.blocking_holder(target_id) {
                Some(holder) => result.failed(
                    FailureReason::LockConflict,
                    format!("target '{}' is locked by '{}'", target_id, holder.holder_id),
                ),
                None => StepResult {
                    status: StepStatus::Success,
                    ..result
                },
            };
        }

        let max_attempts = step.on_failure.max_attempts();
        for attempt_no in 1..=max_attempts {
            result.attempts = attempt_no;
            let attempt = match self.attempt(&request, spec, &decision, correlation_id, attempt_no) {
                Ok(attempt) => attempt,
                Err(e) => return result.failed(FailureReason::AuditWriteFailure, e.to_string()),
            };

            match attempt.failure_reason() {
                None => {
                    result.status = StepStatus::Success;
                    result.reason = None;
                    result.detail = None;
                    result.execution_result = attempt.result.ok();
                    return result;
                }
                Some(reason) => {
                    let detail = match &attempt.result {
                        Ok(execution) => execution.raw_output.clone(),
                        Err(failure) => failure.to_string(),
                    };
                    result.execution_result = attempt.result.ok();
                    result = result.failed(reason, detail);
                }
            }

            if attempt_no == max_attempts {
                break;
            }
            // Lock acquisition is never retried on the caller's behalf
            if result.reason == Some(FailureReason::LockConflict) {
                debug!(step = %step.id, target = target_id, "Target locked, not retrying");
                break;
            }
            if cancelled.load(Ordering::SeqCst) {
                debug!(step = %step.id, "Cancelled, not retrying");
                break;
            }
            let delay = step.on_failure.backoff(attempt_no);
            warn!(
                step = %step.id,
                attempt = attempt_no,
                delay_ms = delay.as_millis() as u64,
                "Step failed, retrying"
            );
            std::thread::sleep(delay);
            if cancelled.load(Ordering::SeqCst) {
                debug!(step = %step.id, "Cancelled during backoff");
                break;
            }
        }
        result
    }
}
