//! Envelope Builder
//!
//! Every outcome leaves the engine wrapped in one of four envelope kinds
//! with a common header:
//!
//! ```json
//! {
//!   "kind": "execute",
//!   "correlationId": "5f0c…",
//!   "timestamp": "2024-06-10T12:00:00Z",
//!   "operation": { "id": "device.reboot", "status": "success" },
//!   "data": { … },
//!   "metadata": { "mode": "execute" }
//! }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use strum::Display;

use crate::policy::{Decision, DecisionReason};
use crate::types::RequestMode;

/// Which envelope this is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum EnvelopeKind {
    /// Read-only information
    Inspect,
    /// A real attempt was made
    Execute,
    /// Policy path only; nothing touched
    Simulate,
    /// Evaluation stopped at a gate
    PolicyDeny,
}

/// Outcome carried in the operation header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum OperationStatus {
    Success,
    Failure,
    /// Some steps of a workflow failed but the run continued
    Partial,
    Denied,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationRef {
    pub id: String,
    pub status: OperationStatus,
}

/// Standard response wrapper
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub kind: EnvelopeKind,
    pub correlation_id: String,
    pub timestamp: DateTime<Utc>,
    pub operation: OperationRef,
    pub data: Value,
    pub metadata: Map<String, Value>,
}

impl Envelope {
    pub fn status(&self) -> OperationStatus {
        self.operation.status
    }

    pub fn is_success(&self) -> bool {
        self.operation.status == OperationStatus::Success
    }

    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

/// Builder for [`Envelope`]s; start from one of the kind constructors
#[derive(Debug, Clone)]
pub struct EnvelopeBuilder {
    envelope: Envelope,
}

impl EnvelopeBuilder {
    fn new(kind: EnvelopeKind, correlation_id: &str, operation_id: &str, status: OperationStatus) -> Self {
        Self {
            envelope: Envelope {
                kind,
                correlation_id: correlation_id.to_string(),
                timestamp: Utc::now(),
                operation: OperationRef {
                    id: operation_id.to_string(),
                    status,
                },
                data: Value::Null,
                metadata: Map::new(),
            },
        }
    }

    /// Read-only information about `subject` (a catalog, a target)
    pub fn inspect(correlation_id: &str, subject: &str) -> Self {
        Self::new(EnvelopeKind::Inspect, correlation_id, subject, OperationStatus::Success)
    }

    pub fn execute(correlation_id: &str, operation_id: &str, status: OperationStatus) -> Self {
        Self::new(EnvelopeKind::Execute, correlation_id, operation_id, status)
            .metadata("mode", json!(RequestMode::Execute))
    }

    pub fn simulate(correlation_id: &str, operation_id: &str, status: OperationStatus) -> Self {
        Self::new(EnvelopeKind::Simulate, correlation_id, operation_id, status)
            .metadata("mode", json!(RequestMode::Simulate))
    }

    /// Denial envelope; `challenge` is included for `ConfirmationRequired`
    pub fn policy_deny(
        correlation_id: &str,
        operation_id: &str,
        decision: &Decision,
        challenge: Option<&str>,
        mode: RequestMode,
    ) -> Self {
        let mut data = json!({
            "reason": decision.reason,
            "requiresConfirmation": decision.requires_confirmation,
            "missingCapabilities": decision.missing_capabilities,
        });
        if decision.reason == DecisionReason::ConfirmationRequired {
            if let (Some(token), Some(map)) = (challenge, data.as_object_mut()) {
                map.insert("challenge".to_string(), json!(token));
            }
        }
        Self::new(EnvelopeKind::PolicyDeny, correlation_id, operation_id, OperationStatus::Denied)
            .data(data)
            .metadata("mode", json!(mode))
    }

    pub fn data(mut self, data: Value) -> Self {
        self.envelope.data = data;
        self
    }

    pub fn metadata(mut self, key: &str, value: Value) -> Self {
        self.envelope.metadata.insert(key.to_string(), value);
        self
    }

    pub fn build(self) -> Envelope {
        self.envelope
    }
}
