//! Segment files
//!
//! A segment is one file of newline-terminated encrypted records, named
//! `segment-<created unix ms>-<first sequence>.log`. Segments sort by creation
//! time, then by first sequence.

use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::warn;

use super::AuditError;
use super::cipher::AuditCipher;
use super::entry::AuditEntry;

const PREFIX: &str = "segment-";
const SUFFIX: &str = ".log";

/// Identity of a segment, encoded in its file name
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentId {
    pub created_ms: u64,
    pub first_sequence: u64,
}

impl SegmentId {
    pub fn file_name(&self) -> String {
        format!("{}{}", self, SUFFIX)
    }

    pub fn path_in(&self, dir: &Path) -> PathBuf {
        dir.join(self.file_name())
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}-{}", PREFIX, self.created_ms, self.first_sequence)
    }
}

impl FromStr for SegmentId {
    type Err = AuditError;

    /// Accepts `segment-<ms>-<seq>` with or without the `.log` suffix
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || AuditError::UnknownSegment {
            segment: s.to_string(),
        };
        let stem = s.strip_suffix(SUFFIX).unwrap_or(s);
        let rest = stem.strip_prefix(PREFIX).ok_or_else(invalid)?;
        let (created, first) = rest.split_once('-').ok_or_else(invalid)?;
        Ok(Self {
            created_ms: created.parse().map_err(|_| invalid())?,
            first_sequence: first.parse().map_err(|_| invalid())?,
        })
    }
}

/// All segments in `dir`, oldest first. A missing directory has none.
pub fn list_segments(dir: &Path) -> Result<Vec<SegmentId>, AuditError> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut segments: Vec<SegmentId> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
        .filter(|name| name.ends_with(SUFFIX))
        .filter_map(|name| name.parse().ok())
        .collect();
    segments.sort();
    Ok(segments)
}

/// Complete lines of a segment.
///
/// A final line without a terminating newline is an interrupted write and is
/// left out; empty lines are ignored.
pub fn read_lines(path: &Path) -> Result<Vec<String>, AuditError> {
    let content = std::fs::read_to_string(path)?;
    let mut lines: Vec<&str> = content.split('\n').collect();
    // split always yields a last piece: "" for a well-terminated file
    if let Some(tail) = lines.pop() {
        if !tail.trim().is_empty() {
            warn!("Ignoring partial trailing record in {}", path.display());
        }
    }
    Ok(lines
        .into_iter()
        .filter(|line| !line.trim().is_empty())
        .map(str::to_string)
        .collect())
}

/// Decrypt and parse one line
pub fn decode_line(cipher: &AuditCipher, line: &str) -> Result<AuditEntry, AuditError> {
    let plaintext = cipher.open(line)?;
    serde_json::from_slice(&plaintext).map_err(|e| AuditError::Crypto {
        reason: format!("decrypted record is not an audit entry: {}", e),
    })
}

/// Result of verifying one segment
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainVerification {
    pub segment: SegmentId,
    pub valid: bool,
    pub entries_checked: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_bad_sequence: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Walk a segment and check every link
pub fn verify_segment(
    cipher: &AuditCipher,
    dir: &Path,
    segment: SegmentId,
) -> Result<ChainVerification, AuditError> {
    let lines = read_lines(&segment.path_in(dir))?;
    let mut expected_sequence = segment.first_sequence;
    let mut previous_hash = super::entry::GENESIS_HASH.to_string();
    let mut checked = 0u64;

    let fail = |sequence: u64, checked: u64, error: String| ChainVerification {
        segment,
        valid: false,
        entries_checked: checked,
        first_bad_sequence: Some(sequence),
        error: Some(error),
    };

    for line in lines {
        let entry = match decode_line(cipher, &line) {
            Ok(entry) => entry,
            Err(e) => return Ok(fail(expected_sequence, checked, e.to_string())),
        };
        checked += 1;

        if entry.sequence_number != expected_sequence {
            return Ok(fail(
                expected_sequence,
                checked,
                format!(
                    "sequence gap: expected {}, found {}",
                    expected_sequence, entry.sequence_number
                ),
            ));
        }
        if entry.previous_hash != previous_hash {
            return Ok(fail(
                entry.sequence_number,
                checked,
                "previous hash does not link to prior entry".to_string(),
            ));
        }
        let recomputed = entry.hash_against(&previous_hash).map_err(|e| AuditError::Serialize {
            reason: e.to_string(),
        })?;
        if recomputed != entry.hash {
            return Ok(fail(
                entry.sequence_number,
                checked,
                "hash mismatch".to_string(),
            ));
        }

        previous_hash = entry.hash;
        expected_sequence += 1;
    }

    Ok(ChainVerification {
        segment,
        valid: true,
        entries_checked: checked,
        first_bad_sequence: None,
        error: None,
    })
}
