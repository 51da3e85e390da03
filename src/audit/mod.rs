//! Shadow Audit Log
//!
//! Append-only, encrypted, hash-chained record of every policy decision and
//! execution outcome.
//!
//! # Layout
//!
//! ```text
//! <audit dir>/
//!   segment-1718000000000-1.log     closed
//!   segment-1718086400000-913.log   active (written by this process)
//! ```
//!
//! Each line is `base64(nonce ‖ AES-256-GCM(json entry))`. Inside a segment,
//! entry *n* carries the hash of entry *n-1* (the first carries
//! [`GENESIS_HASH`]). Sequence numbers are global across segments and
//! survive restarts.
//!
//! All writes go through one writer thread (see `writer`). Reads and
//! verification run on the caller's thread and skip a torn trailing line.

mod cipher;
mod entry;
mod segment;
mod writer;

pub use cipher::AuditCipher;
pub use entry::{AuditEntry, AuditPhase, AuditRecord, GENESIS_HASH, compute_hash};
pub use segment::{ChainVerification, SegmentId};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::mpsc::{self, Sender};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{info, warn};

use writer::{SegmentWriter, WriterCommand};

/// Errors that can occur in the audit log
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuditError {
    #[error("Audit IO error: {reason}")]
    Io { reason: String },

    /// A record failed to encrypt or decrypt
    #[error("Audit crypto error: {reason}")]
    Crypto { reason: String },

    #[error("Invalid audit key: {reason}")]
    Key { reason: String },

    #[error("Failed to serialize audit entry: {reason}")]
    Serialize { reason: String },

    /// Existing records do not decrypt under the supplied key
    #[error("Audit segment {segment} cannot be decrypted with this key")]
    WrongKey { segment: String },

    #[error("Unknown audit segment: {segment}")]
    UnknownSegment { segment: String },

    /// The writer thread has stopped
    #[error("Audit writer is not running")]
    WriterUnavailable,
}

impl From<std::io::Error> for AuditError {
    fn from(err: std::io::Error) -> Self {
        AuditError::Io {
            reason: err.to_string(),
        }
    }
}

/// What happens to segments past retention
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetentionAction {
    #[default]
    Delete,
    /// Move into this directory
    Archive(PathBuf),
}

/// Runtime settings for the audit log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditSettings {
    pub dir: PathBuf,
    pub max_segment_bytes: u64,
    pub max_segment_age: Duration,
    /// `None` keeps segments forever
    pub retention: Option<Duration>,
    pub retention_action: RetentionAction,
    pub fsync: bool,
}

impl AuditSettings {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            max_segment_bytes: 8 * 1024 * 1024,
            max_segment_age: Duration::from_secs(24 * 60 * 60),
            retention: None,
            retention_action: RetentionAction::Delete,
            fsync: true,
        }
    }
}

/// Selection criteria for [`ShadowAuditLog::read`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditFilter {
    pub correlation_id: Option<String>,
    pub actor_id: Option<String>,
    pub operation_id: Option<String>,
    pub target_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub min_sequence: Option<u64>,
}

impl AuditFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn correlation(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn actor(mut self, id: impl Into<String>) -> Self {
        self.actor_id = Some(id.into());
        self
    }

    pub fn operation(mut self, id: impl Into<String>) -> Self {
        self.operation_id = Some(id.into());
        self
    }

    pub fn target(mut self, id: impl Into<String>) -> Self {
        self.target_id = Some(id.into());
        self
    }

    pub fn between(mut self, since: DateTime<Utc>, until: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self.until = Some(until);
        self
    }

    pub fn from_sequence(mut self, sequence: u64) -> Self {
        self.min_sequence = Some(sequence);
        self
    }

    pub fn matches(&self, entry: &AuditEntry) -> bool {
        let record = &entry.record;
        let eq = |want: &Option<String>, have: &str| want.as_deref().is_none_or(|w| w == have);
        eq(&self.correlation_id, &record.correlation_id)
            && eq(&self.actor_id, &record.actor_id)
            && eq(&self.operation_id, &record.operation_id)
            && eq(&self.target_id, &record.target_id)
            && self.since.is_none_or(|since| entry.timestamp >= since)
            && self.until.is_none_or(|until| entry.timestamp <= until)
            && self.min_sequence.is_none_or(|min| entry.sequence_number >= min)
    }
}

/// Outcome of [`ShadowAuditLog::apply_retention`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionReport {
    pub deleted: Vec<SegmentId>,
    pub archived: Vec<SegmentId>,
    pub kept: usize,
}

/// Where the engine writes audit records
pub trait AuditTrail: Send + Sync {
    /// Append one record; on error the caller must treat the operation as unaudited
    fn append(&self, record: AuditRecord) -> Result<AuditEntry, AuditError>;
}

/// Encrypted, hash-chained, segmented audit log
pub struct ShadowAuditLog {
    settings: AuditSettings,
    cipher: AuditCipher,
    commands: Sender<WriterCommand>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ShadowAuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShadowAuditLog")
            .field("dir", &self.settings.dir)
            .finish_non_exhaustive()
    }
}

fn unix_ms(at: SystemTime) -> u64 {
    at.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Next sequence number after everything already on disk
fn resume_sequence(cipher: &AuditCipher, dir: &Path) -> Result<u64, AuditError> {
    let segments = segment::list_segments(dir)?;
    let mut floor = 1u64;
    for id in &segments {
        floor = floor.max(id.first_sequence);
    }

    for id in segments.iter().rev() {
        let lines = segment::read_lines(&id.path_in(dir))?;
        if lines.is_empty() {
            continue;
        }
        // Newest decryptable entry, plus any unreadable lines after it
        for (trailing, line) in lines.iter().rev().enumerate() {
            if let Ok(entry) = segment::decode_line(cipher, line) {
                if trailing > 0 {
                    warn!(
                        "{} unreadable record(s) at the end of audit segment {}",
                        trailing, id
                    );
                }
                return Ok(floor.max(entry.sequence_number + trailing as u64 + 1));
            }
        }
        return Err(AuditError::WrongKey {
            segment: id.to_string(),
        });
    }
    Ok(floor)
}

impl ShadowAuditLog {
    /// Open (or create) the log in `settings.dir` and start the writer thread
    pub fn open(settings: AuditSettings, cipher: AuditCipher) -> Result<Self, AuditError> {
        fs::create_dir_all(&settings.dir)?;
        let next_sequence = resume_sequence(&cipher, &settings.dir)?;
        info!(
            "Opened audit log at {} (next sequence {})",
            settings.dir.display(),
            next_sequence
        );

        let (commands, inbox) = mpsc::channel();
        let writer = SegmentWriter::new(settings.clone(), cipher.clone(), next_sequence);
        let handle = std::thread::Builder::new()
            .name("audit-writer".to_string())
            .spawn(move || writer.run(inbox))?;

        Ok(Self {
            settings,
            cipher,
            commands,
            writer: Mutex::new(Some(handle)),
        })
    }

    pub fn settings(&self) -> &AuditSettings {
        &self.settings
    }

    fn request<T>(&self, make: impl FnOnce(Sender<T>) -> WriterCommand) -> Result<T, AuditError> {
        let (reply, response) = mpsc::channel();
        self.commands
            .send(make(reply))
            .map_err(|_| AuditError::WriterUnavailable)?;
        response.recv().map_err(|_| AuditError::WriterUnavailable)
    }

    /// Queue a record and wait until it is durably written
    pub fn append(&self, record: AuditRecord) -> Result<AuditEntry, AuditError> {
        self.request(|reply| WriterCommand::Append {
            record: Box::new(record),
            reply,
        })?
    }

    /// Segment ids in creation order
    pub fn segments(&self) -> Result<Vec<SegmentId>, AuditError> {
        segment::list_segments(&self.settings.dir)
    }

    /// The segment the writer is appending to, if one is open
    pub fn active_segment(&self) -> Result<Option<SegmentId>, AuditError> {
        self.request(|reply| WriterCommand::ActiveSegment { reply })
    }

    /// Close the active segment; the next append opens a new one
    pub fn rotate(&self) -> Result<Option<SegmentId>, AuditError> {
        self.request(|reply| WriterCommand::Rotate { reply })
    }

    /// Decrypt every segment in order and return matching entries
    pub fn read(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>, AuditError> {
        let mut entries = Vec::new();
        for id in self.segments()? {
            for (index, line) in segment::read_lines(&id.path_in(&self.settings.dir))?
                .iter()
                .enumerate()
            {
                match segment::decode_line(&self.cipher, line) {
                    Ok(entry) if filter.matches(&entry) => entries.push(entry),
                    Ok(_) => {}
                    Err(e) => warn!("Skipping record {} of audit segment {}: {}", index + 1, id, e),
                }
            }
        }
        Ok(entries)
    }

    /// Verify one segment's hash chain
    pub fn verify_chain(&self, segment: SegmentId) -> Result<ChainVerification, AuditError> {
        if !segment.path_in(&self.settings.dir).exists() {
            return Err(AuditError::UnknownSegment {
                segment: segment.to_string(),
            });
        }
        let result = segment::verify_segment(&self.cipher, &self.settings.dir, segment)?;
        if !result.valid {
            warn!(
                "Audit chain violation in {} at sequence {:?}: {}",
                segment,
                result.first_bad_sequence,
                result.error.as_deref().unwrap_or("unknown")
            );
        }
        Ok(result)
    }

    /// Verify every segment
    pub fn verify_all(&self) -> Result<Vec<ChainVerification>, AuditError> {
        self.segments()?
            .into_iter()
            .map(|id| self.verify_chain(id))
            .collect()
    }

    /// Delete or archive closed segments created before `now - retention`
    pub fn apply_retention(&self, now: SystemTime) -> Result<RetentionReport, AuditError> {
        let mut report = RetentionReport::default();
        let segments = self.segments()?;
        let Some(retention) = self.settings.retention else {
            report.kept = segments.len();
            return Ok(report);
        };
        let active = self.active_segment()?;
        let cutoff = unix_ms(now).saturating_sub(retention.as_millis() as u64);

        for id in segments {
            if Some(id) == active || id.created_ms >= cutoff {
                report.kept += 1;
                continue;
            }
            let path = id.path_in(&self.settings.dir);
            match &self.settings.retention_action {
                RetentionAction::Delete => {
                    fs::remove_file(&path)?;
                    info!("Deleted audit segment {} past retention", id);
                    report.deleted.push(id);
                }
                RetentionAction::Archive(archive_dir) => {
                    fs::create_dir_all(archive_dir)?;
                    let destination = archive_dir.join(id.file_name());
                    if fs::rename(&path, &destination).is_err() {
                        // Different filesystem
                        fs::copy(&path, &destination)?;
                        fs::remove_file(&path)?;
                    }
                    info!("Archived audit segment {} to {}", id, archive_dir.display());
                    report.archived.push(id);
                }
            }
        }
        Ok(report)
    }
}

impl AuditTrail for ShadowAuditLog {
    fn append(&self, record: AuditRecord) -> Result<AuditEntry, AuditError> {
        ShadowAuditLog::append(self, record)
    }
}

impl Drop for ShadowAuditLog {
    fn drop(&mut self) {
        let _ = self.commands.send(WriterCommand::Shutdown);
        if let Ok(mut writer) = self.writer.lock() {
            if let Some(handle) = writer.take() {
                let _ = handle.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::entry::tests::sample_record;

    fn open(dir: &Path, cipher: &AuditCipher) -> ShadowAuditLog {
        ShadowAuditLog::open(AuditSettings::new(dir), cipher.clone()).unwrap()
    }

    #[test]
    fn test_append_assigns_sequence_and_chain() {
        let dir = tempfile::tempdir().unwrap();
        let cipher = AuditCipher::generate();
        let log = open(dir.path(), &cipher);

        let first = log.append(sample_record("a")).unwrap();
        let second = log.append(sample_record("b")).unwrap();
        assert_eq!(first.sequence_number, 1);
        assert_eq!(first.previous_hash, GENESIS_HASH);
        assert_eq!(second.sequence_number, 2);
        assert_eq!(second.previous_hash, first.hash);

        let all = log.read(&AuditFilter::new()).unwrap();
        assert_eq!(all, vec![first, second]);
    }

    #[test]
    fn test_no_segment_until_first_append() {
        let dir = tempfile::tempdir().unwrap();
        let log = open(dir.path(), &AuditCipher::generate());
        assert!(log.segments().unwrap().is_empty());
        assert_eq!(log.active_segment().unwrap(), None);
    }

    #[test]
    fn test_sequence_resumes_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let cipher = AuditCipher::generate();
        {
            let log = open(dir.path(), &cipher);
            log.append(sample_record("a")).unwrap();
            log.append(sample_record("b")).unwrap();
        }
        let log = open(dir.path(), &cipher);
        let third = log.append(sample_record("c")).unwrap();
        assert_eq!(third.sequence_number, 3);
        // New process, new segment, fresh chain
        assert_eq!(third.previous_hash, GENESIS_HASH);
        assert_eq!(log.segments().unwrap().len(), 2);
        assert!(log.verify_all().unwrap().iter().all(|v| v.valid));
    }

    #[test]
    fn test_open_with_wrong_key_fails() {
        let dir = tempfile::tempdir().unwrap();
        {
            let log = open(dir.path(), &AuditCipher::generate());
            log.append(sample_record("a")).unwrap();
        }
        let result = ShadowAuditLog::open(AuditSettings::new(dir.path()), AuditCipher::generate());
        assert!(matches!(result, Err(AuditError::WrongKey { .. })));
    }

    #[test]
    fn test_rotate_starts_new_segment() {
        let dir = tempfile::tempdir().unwrap();
        let log = open(dir.path(), &AuditCipher::generate());
        log.append(sample_record("a")).unwrap();
        let closed = log.rotate().unwrap().unwrap();
        assert_eq!(closed.first_sequence, 1);

        let next = log.append(sample_record("b")).unwrap();
        assert_eq!(next.sequence_number, 2);
        assert_eq!(next.previous_hash, GENESIS_HASH);
        let segments = log.segments().unwrap();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[1].first_sequence, 2);
    }

    #[test]
    fn test_size_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = AuditSettings::new(dir.path());
        settings.max_segment_bytes = 1;
        let log = ShadowAuditLog::open(settings, AuditCipher::generate()).unwrap();
        for op in ["a", "b", "c"] {
            log.append(sample_record(op)).unwrap();
        }
        assert_eq!(log.segments().unwrap().len(), 3);
        assert_eq!(log.read(&AuditFilter::new()).unwrap().len(), 3);
    }

    #[test]
    fn test_filter() {
        let dir = tempfile::tempdir().unwrap();
        let log = open(dir.path(), &AuditCipher::generate());
        let mut other = sample_record("b");
        other.correlation_id = "corr-2".to_string();
        other.actor_id = "bob".to_string();
        log.append(sample_record("a")).unwrap();
        log.append(other).unwrap();

        assert_eq!(log.read(&AuditFilter::new().actor("bob")).unwrap().len(), 1);
        assert_eq!(log.read(&AuditFilter::new().correlation("corr-1")).unwrap().len(), 1);
        assert_eq!(log.read(&AuditFilter::new().operation("zzz")).unwrap().len(), 0);
        let from_two = log.read(&AuditFilter::new().from_sequence(2)).unwrap();
        assert_eq!(from_two.len(), 1);
        assert_eq!(from_two[0].record.actor_id, "bob");
    }

    #[test]
    fn test_verify_unknown_segment() {
        let dir = tempfile::tempdir().unwrap();
        let log = open(dir.path(), &AuditCipher::generate());
        let missing = SegmentId {
            created_ms: 1,
            first_sequence: 1,
        };
        assert!(matches!(
            log.verify_chain(missing),
            Err(AuditError::UnknownSegment { .. })
        ));
    }

    #[test]
    fn test_retention_spares_active_segment() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("archive");
        let mut settings = AuditSettings::new(dir.path().join("audit"));
        settings.retention = Some(Duration::from_secs(60));
        settings.retention_action = RetentionAction::Archive(archive.clone());
        let log = ShadowAuditLog::open(settings, AuditCipher::generate()).unwrap();

        log.append(sample_record("a")).unwrap();
        log.rotate().unwrap();
        log.append(sample_record("b")).unwrap();

        let later = SystemTime::now() + Duration::from_secs(3600);
        let report = log.apply_retention(later).unwrap();
        assert_eq!(report.archived.len(), 1);
        assert_eq!(report.kept, 1);
        assert!(archive.join(report.archived[0].file_name()).exists());
        assert_eq!(log.segments().unwrap().len(), 1);
    }

    #[test]
    fn test_retention_disabled_keeps_everything() {
        let dir = tempfile::tempdir().unwrap();
        let log = open(dir.path(), &AuditCipher::generate());
        log.append(sample_record("a")).unwrap();
        log.rotate().unwrap();
        let report = log
            .apply_retention(SystemTime::now() + Duration::from_secs(86_400 * 365))
            .unwrap();
        assert_eq!(report.kept, 1);
        assert!(report.deleted.is_empty());
    }
}
