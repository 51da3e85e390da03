//! Audit entry layout and hashing

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::policy::Decision;
use crate::provider::ExecutionResult;
use crate::types::{RequestMode, Role};

/// `previous_hash` of the first entry in every segment
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Which step of the pipeline produced the entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditPhase {
    /// Policy outcome, written before any lock is taken
    Decision,
    /// Outcome of the lock and provider steps
    Execution,
}

/// Caller-supplied part of an entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    pub correlation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    pub actor_id: String,
    pub actor_role: Role,
    pub operation_id: String,
    pub target_id: String,
    pub arguments: Value,
    pub mode: RequestMode,
    pub phase: AuditPhase,
    pub decision: Decision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_result: Option<ExecutionResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    /// 1-based attempt number inside a retried workflow step
    #[serde(default = "first_attempt")]
    pub attempt: u32,
}

fn first_attempt() -> u32 {
    1
}

/// A sealed, chained entry as stored on disk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub sequence_number: u64,
    pub timestamp: DateTime<Utc>,
    pub previous_hash: String,
    pub hash: String,
    pub record: AuditRecord,
}

/// Borrowed view of everything the hash covers
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HashedFields<'a> {
    sequence_number: u64,
    timestamp: &'a DateTime<Utc>,
    previous_hash: &'a str,
    record: &'a AuditRecord,
}

/// `hex(SHA-256(previous_hash ‖ canonical(entry without hash)))`
///
/// Canonical form is compact JSON with struct fields in declaration order and
/// argument object keys sorted.
pub fn compute_hash(
    sequence_number: u64,
    timestamp: &DateTime<Utc>,
    previous_hash: &str,
    record: &AuditRecord,
) -> Result<String, serde_json::Error> {
    let canonical = serde_json::to_vec(&HashedFields {
        sequence_number,
        timestamp,
        previous_hash,
        record,
    })?;
    let mut hasher = Sha256::new();
    hasher.update(previous_hash.as_bytes());
    hasher.update(&canonical);
    Ok(hex::encode(hasher.finalize()))
}

impl AuditEntry {
    /// Seal a record into the chain
    pub fn seal(
        sequence_number: u64,
        timestamp: DateTime<Utc>,
        previous_hash: String,
        record: AuditRecord,
    ) -> Result<Self, serde_json::Error> {
        let hash = compute_hash(sequence_number, &timestamp, &previous_hash, &record)?;
        Ok(Self {
            sequence_number,
            timestamp,
            previous_hash,
            hash,
            record,
        })
    }

    /// Recompute the hash against the given predecessor hash
    pub fn hash_against(&self, previous_hash: &str) -> Result<String, serde_json::Error> {
        compute_hash(self.sequence_number, &self.timestamp, previous_hash, &self.record)
    }
}
