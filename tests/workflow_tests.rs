//! Tests for the Workflow Engine
//!
//! These tests verify:
//! - Abort, Continue and Retry failure policies
//! - Cancellation between steps and during retry backoff
//! - Lock conflicts are never retried
//! - Audit write failures stop the run
//! - Independent steps on distinct targets run in parallel

use opgate::audit::{AuditEntry, AuditError, AuditPhase, AuditRecord, AuditTrail, GENESIS_HASH};
use opgate::catalog::{OperationCatalog, OperationSpec};
use opgate::engine::{Engine, FailureReason};
use opgate::envelope::OperationStatus;
use opgate::provider::{ExecutionResult, FnProvider, Provider, ProviderRequest};
use opgate::types::{Actor, RequestMode, Role};
use opgate::workflow::{
    FailurePolicy, RunStatus, StepStatus, Workflow, WorkflowContext, WorkflowStep,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

// =============================================================================
// Fixtures
// =============================================================================

#[derive(Default)]
struct MemoryAudit {
    entries: Mutex<Vec<AuditEntry>>,
    /// Fail every append once this many have succeeded
    fail_after: Option<usize>,
}

impl MemoryAudit {
    fn failing_after(count: usize) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            fail_after: Some(count),
        }
    }

    fn records(&self) -> Vec<AuditRecord> {
        self.entries.lock().unwrap().iter().map(|e| e.record.clone()).collect()
    }
}

impl AuditTrail for MemoryAudit {
    fn append(&self, record: AuditRecord) -> Result<AuditEntry, AuditError> {
        let mut entries = self.entries.lock().unwrap();
        if self.fail_after.is_some_and(|limit| entries.len() >= limit) {
            return Err(AuditError::WriterUnavailable);
        }
        let previous = entries
            .last()
            .map(|e| e.hash.clone())
            .unwrap_or_else(|| GENESIS_HASH.to_string());
        let entry = AuditEntry::seal(entries.len() as u64 + 1, chrono::Utc::now(), previous, record).unwrap();
        entries.push(entry.clone());
        Ok(entry)
    }
}

/// Behaviour keyed on the target name:
/// `fail*` always fails, `flaky*` fails twice then succeeds, `slow*` sleeps
fn scripted_provider(calls: Arc<AtomicUsize>) -> Arc<dyn Provider> {
    let flaky = Arc::new(AtomicUsize::new(0));
    Arc::new(FnProvider::new("scripted", move |req: &ProviderRequest| {
        calls.fetch_add(1, Ordering::SeqCst);
        let target = req.target_id.as_str();
        if target.starts_with("slow") {
            thread::sleep(Duration::from_millis(300));
        }
        if target.starts_with("fail") {
            return Ok(ExecutionResult::failed("target refused"));
        }
        if target.starts_with("flaky") && flaky.fetch_add(1, Ordering::SeqCst) < 2 {
            return Ok(ExecutionResult::failed("not yet"));
        }
        Ok(ExecutionResult::succeeded(format!("{} on {}", req.operation_id, target)))
    }))
}

fn engine(audit: Arc<MemoryAudit>, calls: Arc<AtomicUsize>) -> Engine {
    let catalog = OperationCatalog::from_specs([
        OperationSpec::builder("device.reboot")
            .allow(Role::Admin)
            .allow(Role::Owner)
            .build()
            .unwrap(),
        OperationSpec::builder("config.push")
            .allow(Role::Owner)
            .build()
            .unwrap(),
    ])
    .unwrap();
    Engine::builder(catalog, audit, scripted_provider(calls))
        .without_maintenance()
        .build()
}

fn admin() -> WorkflowContext {
    WorkflowContext::new(Actor::new("admin-1", Role::Admin))
}

fn step(id: &str, target: &str) -> WorkflowStep {
    WorkflowStep::new(id, "device.reboot").target(target)
}

// =============================================================================
// Failure Policies
// =============================================================================

#[test]
fn test_abort_skips_remaining_steps() {
    let audit = Arc::new(MemoryAudit::default());
    let calls = Arc::new(AtomicUsize::new(0));
    let engine = engine(audit, calls.clone());
    let workflow = Workflow::new(
        "w",
        vec![step("one", "a"), step("two", "fail-b"), step("three", "c")],
    );

    let run = engine.execute_workflow(&workflow, &admin());
    assert_eq!(
        run.statuses(),
        vec![StepStatus::Success, StepStatus::Failed, StepStatus::Skipped]
    );
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.step_results[1].reason, Some(FailureReason::ProviderFailed));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn test_continue_runs_past_failure() {
    let audit = Arc::new(MemoryAudit::default());
    let engine = engine(audit, Arc::new(AtomicUsize::new(0)));
    let workflow = Workflow::new(
        "w",
        vec![
            step("one", "a"),
            step("two", "fail-b").on_failure(FailurePolicy::Continue),
            step("three", "c"),
        ],
    );

    let run = engine.execute_workflow(&workflow, &admin());
    assert_eq!(
        run.statuses(),
        vec![StepStatus::Success, StepStatus::Failed, StepStatus::Success]
    );
    assert_eq!(run.status, RunStatus::PartiallyCompleted);
    assert_eq!(run.envelope(RequestMode::Execute).status(), OperationStatus::Partial);
}

#[test]
fn test_retry_succeeds_within_budget() {
    let audit = Arc::new(MemoryAudit::default());
    let calls = Arc::new(AtomicUsize::new(0));
    let engine = engine(audit.clone(), calls.clone());
    let workflow = Workflow::new(
        "w",
        vec![step("flash", "flaky-a").on_failure(FailurePolicy::Retry {
            max_attempts: 3,
            backoff_ms: 10,
        })],
    );

    let run = engine.execute_workflow(&workflow, &admin());
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.step_results[0].attempts, 3);
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    // One decision, then one execution entry per attempt
    let records = audit.records();
    let phases: Vec<(AuditPhase, u32)> = records.iter().map(|r| (r.phase, r.attempt)).collect();
    assert_eq!(
        phases,
        vec![
            (AuditPhase::Decision, 1),
            (AuditPhase::Execution, 1),
            (AuditPhase::Execution, 2),
            (AuditPhase::Execution, 3),
        ]
    );
}

#[test]
fn test_retry_exhausted_aborts() {
    let audit = Arc::new(MemoryAudit::default());
    let calls = Arc::new(AtomicUsize::new(0));
    let engine = engine(audit, calls.clone());
    let workflow = Workflow::new(
        "w",
        vec![
            step("flash", "fail-a").on_failure(FailurePolicy::Retry {
                max_attempts: 2,
                backoff_ms: 5,
            }),
            step("after", "b"),
        ],
    );

    let run = engine.execute_workflow(&workflow, &admin());
    assert_eq!(run.statuses(), vec![StepStatus::Failed, StepStatus::Skipped]);
    assert_eq!(run.step_results[0].attempts, 2);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(run.status, RunStatus::Failed);
}

#[test]
fn test_denied_step_is_not_retried() {
    let audit = Arc::new(MemoryAudit::default());
    let calls = Arc::new(AtomicUsize::new(0));
    let engine = engine(audit.clone(), calls.clone());
    let workflow = Workflow::new(
        "w",
        vec![
            WorkflowStep::new("push", "config.push")
                .target("a")
                .on_failure(FailurePolicy::Retry {
                    max_attempts: 5,
                    backoff_ms: 1,
                }),
            step("reboot", "a"),
        ],
    );

    let run = engine.execute_workflow(&workflow, &admin());
    assert_eq!(run.statuses(), vec![StepStatus::Denied, StepStatus::Skipped]);
    assert_eq!(run.step_results[0].reason, Some(FailureReason::PolicyDenied));
    assert_eq!(run.step_results[0].detail.as_deref(), Some("RoleNotAllowed"));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(audit.records().len(), 1);
}

#[test]
fn test_locked_target_is_not_retried() {
    let audit = Arc::new(MemoryAudit::default());
    let calls = Arc::new(AtomicUsize::new(0));
    let engine = engine(audit, calls.clone());
    engine
        .locks()
        .acquire("a", "someone-else", Duration::from_secs(60))
        .unwrap();
    let workflow = Workflow::new(
        "w",
        vec![
            step("reboot", "a").on_failure(FailurePolicy::Retry {
                max_attempts: 4,
                backoff_ms: 1,
            }),
            step("after", "b"),
        ],
    );

    let run = engine.execute_workflow(&workflow, &admin());
    assert_eq!(run.statuses(), vec![StepStatus::Failed, StepStatus::Skipped]);
    assert_eq!(run.step_results[0].reason, Some(FailureReason::LockConflict));
    assert_eq!(run.step_results[0].attempts, 1);
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

// =============================================================================
// Targets and Correlation
// =============================================================================

#[test]
fn test_steps_share_correlation_and_default_target() {
    let audit = Arc::new(MemoryAudit::default());
    let engine = engine(audit.clone(), Arc::new(AtomicUsize::new(0)));
    let workflow = Workflow::new(
        "maintenance",
        vec![WorkflowStep::new("one", "device.reboot"), step("two", "other")],
    );
    let context = admin().with_target("default-host").with_correlation_id("corr-42");

    let run = engine.execute_workflow(&workflow, &context);
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.correlation_id, "corr-42");
    assert_eq!(run.step_results[0].target_id, "default-host");

    let records = audit.records();
    assert_eq!(records.len(), 4);
    for record in &records {
        assert_eq!(record.correlation_id, "corr-42");
        assert_eq!(record.workflow_id.as_deref(), Some("maintenance"));
    }
}

#[test]
fn test_missing_target_fails_step() {
    let engine = engine(Arc::new(MemoryAudit::default()), Arc::new(AtomicUsize::new(0)));
    let workflow = Workflow::new("w", vec![WorkflowStep::new("one", "device.reboot")]);
    let run = engine.execute_workflow(&workflow, &admin());
    assert_eq!(run.statuses(), vec![StepStatus::Failed]);
    assert_eq!(run.step_results[0].reason, Some(FailureReason::MissingTarget));
}

#[test]
fn test_unknown_operation_fails_step() {
    let engine = engine(Arc::new(MemoryAudit::default()), Arc::new(AtomicUsize::new(0)));
    let workflow = Workflow::new(
        "w",
        vec![
            WorkflowStep::new("one", "device.melt").target("a").on_failure(FailurePolicy::Continue),
            step("two", "a"),
        ],
    );
    let run = engine.execute_workflow(&workflow, &admin());
    assert_eq!(run.statuses(), vec![StepStatus::Failed, StepStatus::Success]);
    assert_eq!(run.step_results[0].reason, Some(FailureReason::UnknownOperation));
}

// =============================================================================
// Simulation
// =============================================================================

#[test]
fn test_simulated_workflow_calls_no_provider() {
    let audit = Arc::new(MemoryAudit::default());
    let calls = Arc::new(AtomicUsize::new(0));
    let engine = engine(audit.clone(), calls.clone());
    let workflow = Workflow::new("w", vec![step("one", "fail-a"), step("two", "b")]);

    let run = engine.execute_workflow(&workflow, &admin().simulate());
    assert_eq!(run.statuses(), vec![StepStatus::Success, StepStatus::Success]);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(engine.locks().is_empty());
    assert!(audit.records().iter().all(|r| r.phase == AuditPhase::Decision));
    assert_eq!(
        run.envelope(RequestMode::Simulate).metadata["mode"],
        "simulate"
    );
}

// =============================================================================
// Fatal Conditions
// =============================================================================

#[test]
fn test_audit_failure_stops_run_even_under_continue() {
    // step one: decision + execution, step two: decision, then failure
    let audit = Arc::new(MemoryAudit::failing_after(3));
    let calls = Arc::new(AtomicUsize::new(0));
    let engine = engine(audit, calls.clone());
    let workflow = Workflow::new(
        "w",
        vec![
            step("one", "a"),
            step("two", "b").on_failure(FailurePolicy::Continue),
            step("three", "c"),
        ],
    );

    let run = engine.execute_workflow(&workflow, &admin());
    assert_eq!(
        run.statuses(),
        vec![StepStatus::Success, StepStatus::Failed, StepStatus::Skipped]
    );
    assert_eq!(run.step_results[1].reason, Some(FailureReason::AuditWriteFailure));
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.fatal_error.is_some());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn test_cancel_stops_before_next_step() {
    let audit = Arc::new(MemoryAudit::default());
    let engine = engine(audit, Arc::new(AtomicUsize::new(0)));
    let workflow = Workflow::new("w", vec![step("one", "slow-a"), step("two", "b")]);
    let context = admin().with_correlation_id("cancel-me");

    let run = thread::scope(|scope| {
        let handle = scope.spawn(|| engine.execute_workflow(&workflow, &context));
        let deadline = Instant::now() + Duration::from_secs(5);
        while engine.locks().holder("slow-a").is_none() {
            assert!(Instant::now() < deadline);
            thread::sleep(Duration::from_millis(5));
        }
        assert!(engine.cancel("cancel-me"));
        handle.join().unwrap()
    });

    assert_eq!(run.statuses(), vec![StepStatus::Success, StepStatus::Skipped]);
    assert_eq!(run.status, RunStatus::Aborted);
    assert!(!engine.cancel("cancel-me"));
}

#[test]
fn test_cancel_during_retry_backoff_aborts_run() {
    let audit = Arc::new(MemoryAudit::default());
    let calls = Arc::new(AtomicUsize::new(0));
    let engine = engine(audit, calls.clone());
    let workflow = Workflow::new(
        "w",
        vec![
            step("flash", "fail-a").on_failure(FailurePolicy::Retry {
                max_attempts: 10,
                backoff_ms: 400,
            }),
            step("after", "b"),
        ],
    );
    let context = admin().with_correlation_id("cancel-retry");

    let run = thread::scope(|scope| {
        let handle = scope.spawn(|| engine.execute_workflow(&workflow, &context));
        let deadline = Instant::now() + Duration::from_secs(5);
        while calls.load(Ordering::SeqCst) == 0 {
            assert!(Instant::now() < deadline);
            thread::sleep(Duration::from_millis(5));
        }
        assert!(engine.cancel("cancel-retry"));
        handle.join().unwrap()
    });

    assert_eq!(run.statuses(), vec![StepStatus::Failed, StepStatus::Skipped]);
    assert_eq!(run.status, RunStatus::Aborted);
    assert_eq!(run.step_results[0].attempts, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(run.fatal_error.is_none());
}

// =============================================================================
// Parallel Batches
// =============================================================================

#[test]
fn test_independent_steps_run_in_parallel() {
    let engine = engine(Arc::new(MemoryAudit::default()), Arc::new(AtomicUsize::new(0)));
    let workflow = Workflow::new(
        "w",
        vec![
            step("a", "slow-1").independent(),
            step("b", "slow-2").independent(),
            step("c", "slow-3").independent(),
        ],
    );

    let started = Instant::now();
    let run = engine.execute_workflow(&workflow, &admin());
    assert_eq!(run.status, RunStatus::Completed);
    assert!(started.elapsed() < Duration::from_millis(850));
    let ids: Vec<&str> = run.step_results.iter().map(|r| r.step_id.as_str()).collect();
    assert_eq!(ids, vec!["a", "b", "c"]);
}
