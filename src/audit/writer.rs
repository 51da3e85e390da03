//! Single writer thread
//!
//! Every mutation of the audit directory goes through one thread that owns
//! the active segment. Callers send a [`WriterCommand`] and block on the
//! reply channel, so appends from any number of threads are applied one at a
//! time and sequence numbers never interleave.

use chrono::Utc;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::mpsc::{Receiver, Sender};
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info};

use super::cipher::AuditCipher;
use super::entry::{AuditEntry, AuditRecord, GENESIS_HASH};
use super::segment::SegmentId;
use super::{AuditError, AuditSettings};

/// Requests handled by the writer thread
pub(crate) enum WriterCommand {
    Append {
        record: Box<AuditRecord>,
        reply: Sender<Result<AuditEntry, AuditError>>,
    },
    Rotate {
        reply: Sender<Option<SegmentId>>,
    },
    ActiveSegment {
        reply: Sender<Option<SegmentId>>,
    },
    Shutdown,
}

struct ActiveSegment {
    id: SegmentId,
    file: File,
    bytes: u64,
    opened: Instant,
    last_hash: String,
}

pub(crate) struct SegmentWriter {
    settings: AuditSettings,
    cipher: AuditCipher,
    next_sequence: u64,
    active: Option<ActiveSegment>,
}

fn unix_ms(at: SystemTime) -> u64 {
    at.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl SegmentWriter {
    pub(crate) fn new(settings: AuditSettings, cipher: AuditCipher, next_sequence: u64) -> Self {
        Self {
            settings,
            cipher,
            next_sequence,
            active: None,
        }
    }

    fn segment_path(&self, id: &SegmentId) -> PathBuf {
        id.path_in(&self.settings.dir)
    }

    fn needs_rotation(&self, active: &ActiveSegment) -> bool {
        active.bytes >= self.settings.max_segment_bytes
            || active.opened.elapsed() >= self.settings.max_segment_age
    }

    /// Create a fresh segment starting at the next sequence number
    fn open_segment(&mut self) -> Result<(), AuditError> {
        std::fs::create_dir_all(&self.settings.dir)?;
        let mut id = SegmentId {
            created_ms: unix_ms(SystemTime::now()),
            first_sequence: self.next_sequence,
        };
        // A failed write can leave a file with the same name behind
        let file = loop {
            match OpenOptions::new()
                .create_new(true)
                .append(true)
                .open(self.segment_path(&id))
            {
                Ok(file) => break file,
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => id.created_ms += 1,
                Err(e) => return Err(e.into()),
            }
        };
        info!("Opened audit segment {}", id);
        self.active = Some(ActiveSegment {
            id,
            file,
            bytes: 0,
            opened: Instant::now(),
            last_hash: GENESIS_HASH.to_string(),
        });
        Ok(())
    }

    fn close_active(&mut self) -> Option<SegmentId> {
        let closed = self.active.take().map(|active| active.id);
        if let Some(id) = &closed {
            info!("Closed audit segment {}", id);
        }
        closed
    }

    fn append(&mut self, record: AuditRecord) -> Result<AuditEntry, AuditError> {
        let rotate = self
            .active
            .as_ref()
            .map(|active| self.needs_rotation(active))
            .unwrap_or(false);
        if rotate {
            self.close_active();
        }
        if self.active.is_none() {
            self.open_segment()?;
        }
        let fsync = self.settings.fsync;
        let sequence = self.next_sequence;
        let Some(active) = self.active.as_mut() else {
            return Err(AuditError::WriterUnavailable);
        };

        let entry = AuditEntry::seal(sequence, Utc::now(), active.last_hash.clone(), record)
            .map_err(|e| AuditError::Serialize {
                reason: e.to_string(),
            })?;
        let plaintext = serde_json::to_vec(&entry).map_err(|e| AuditError::Serialize {
            reason: e.to_string(),
        })?;
        let mut line = self.cipher.seal(&plaintext)?;
        line.push('\n');

        let written = active
            .file
            .write_all(line.as_bytes())
            .and_then(|_| active.file.flush())
            .and_then(|_| if fsync { active.file.sync_data() } else { Ok(()) });
        if let Err(e) = written {
            error!(
                "Audit write to {} failed at sequence {}: {}",
                active.id, sequence, e
            );
            // Some or all of the line may be on disk: never append after it,
            // and never hand its sequence number out again
            self.active = None;
            self.next_sequence += 1;
            return Err(e.into());
        }

        active.bytes += line.len() as u64;
        active.last_hash = entry.hash.clone();
        self.next_sequence += 1;
        debug!(sequence, segment = %active.id, "Audit entry appended");
        Ok(entry)
    }

    /// Serve commands until shutdown or until every sender is gone
    pub(crate) fn run(mut self, commands: Receiver<WriterCommand>) {
        debug!("Audit writer thread started");
        while let Ok(command) = commands.recv() {
            match command {
                WriterCommand::Append { record, reply } => {
                    let _ = reply.send(self.append(*record));
                }
                WriterCommand::Rotate { reply } => {
                    let _ = reply.send(self.close_active());
                }
                WriterCommand::ActiveSegment { reply } => {
                    let _ = reply.send(self.active.as_ref().map(|a| a.id));
                }
                WriterCommand::Shutdown => break,
            }
        }
        if let Some(active) = self.active.as_mut() {
            let _ = active.file.sync_all();
        }
        debug!("Audit writer thread stopped");
    }
}
