//! Error handling for the engine
//!
//! Module errors (`CatalogError`, `AuditError`, `ProviderError`, ...) are
//! thiserror enums close to where they arise. `EngineError` is what the
//! request pipeline returns. Policy denials are not errors: they come back as
//! `policy-deny` envelopes.

use thiserror::Error;

use crate::audit::AuditError;
use crate::catalog::CatalogError;
use crate::locks::LockConflict;

/// Errors returned by the engine pipeline
#[derive(Error, Debug)]
pub enum EngineError {
    /// Catalog miss; not audited
    #[error("Unknown operation: {id}")]
    UnknownOperation { id: String },

    /// Arguments violate the parameter schema; not audited
    #[error("Invalid arguments for '{operation}': {reason}")]
    InvalidArguments { operation: String, reason: String },

    /// Target held by another holder; never auto-retried for single operations
    #[error("Lock conflict: {0}")]
    LockConflict(#[from] LockConflict),

    /// Fail closed: the outcome could not be recorded
    #[error("Audit write failed (provider succeeded: {provider_succeeded}): {reason}")]
    AuditWriteFailure {
        provider_succeeded: bool,
        reason: String,
    },

    /// Catalog reload errors
    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    pub fn audit_write(provider_succeeded: bool, err: &AuditError) -> Self {
        Self::AuditWriteFailure {
            provider_succeeded,
            reason: err.to_string(),
        }
    }

    /// Whether the request never reached policy evaluation
    pub fn is_request_error(&self) -> bool {
        matches!(
            self,
            Self::UnknownOperation { .. } | Self::InvalidArguments { .. }
        )
    }
}
