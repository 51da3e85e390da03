//! opgate Library
//!
//! Policy-gated execution of privileged operations against managed targets:
//! a catalog of operations, a policy evaluator, per-target locks, a
//! hash-chained encrypted audit log and a workflow engine, all reporting
//! through uniform JSON envelopes.

pub mod audit;
pub mod catalog;
pub mod cli;
pub mod config;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod locks;
pub mod policy;
pub mod process_guard;
pub mod provider;
pub mod rate_limit;
pub mod script_provider;
pub mod types;
pub mod workflow;

// Re-export main types for convenience
pub use audit::{
    AuditCipher, AuditEntry, AuditError, AuditFilter, AuditRecord, AuditSettings, AuditTrail,
    ChainVerification, RetentionAction, SegmentId, ShadowAuditLog,
};
pub use catalog::{CatalogError, OperationCatalog, OperationSpec, ParameterSchema};
pub use config::EngineConfig;
pub use engine::{Engine, EngineBuilder, EngineSettings, FailureReason, OperationRequest};
pub use envelope::{Envelope, EnvelopeBuilder, EnvelopeKind, OperationStatus};
pub use error::EngineError;
pub use locks::{LockConflict, LockGuard, LockManager, LockToken};
pub use policy::{ConfirmationChallenger, Decision, DecisionReason, PolicyContext, PolicyEvaluator};
pub use process_guard::{ChildRegistry, CommandProcessGroup, ProcessGuard};
pub use provider::{ExecutionResult, FnProvider, Provider, ProviderError, ProviderRequest};
pub use rate_limit::RateLimiter;
pub use script_provider::ScriptProvider;
pub use types::{Actor, RequestMode, RiskLevel, Role};
pub use workflow::{
    FailurePolicy, RunStatus, StepResult, StepStatus, Workflow, WorkflowContext, WorkflowRun,
    WorkflowStep,
};
