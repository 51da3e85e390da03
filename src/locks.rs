//! Resource Lock Manager
//!
//! At most one active operation per target. The lock table is a sharded
//! concurrent map; acquiring touches only the target's entry, so operations on
//! different targets never wait on each other.
//!
//! Expired leases are replaced in place by the next acquire of the same key.
//! Targets that are never touched again are reclaimed by [`LockManager::sweep_expired`].

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

/// Proof of lock ownership
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockToken(Uuid);

impl LockToken {
    fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for LockToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Returned when the target is held by someone else
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Target '{target_id}' is locked by '{holder_id}' for another {remaining:?}")]
pub struct LockConflict {
    pub target_id: String,
    pub holder_id: String,
    pub remaining: Duration,
}

/// Errors from lock maintenance calls
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    #[error("No lock held on '{target_id}'")]
    NotHeld { target_id: String },

    #[error("Token does not own the lock on '{target_id}'")]
    TokenMismatch { target_id: String },

    #[error("Lock on '{target_id}' has expired")]
    Expired { target_id: String },
}

/// Public snapshot of a live lock
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LockInfo {
    pub target_id: String,
    pub holder_id: String,
    pub acquired_at: chrono::DateTime<chrono::Utc>,
    pub remaining_ms: u64,
}

#[derive(Debug, Clone)]
struct Lease {
    holder_id: String,
    token: LockToken,
    acquired_at: chrono::DateTime<chrono::Utc>,
    expires_at: Instant,
}

impl Lease {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// Per-target lock table
#[derive(Debug, Default)]
pub struct LockManager {
    leases: DashMap<String, Lease>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomic check-and-set on the target's entry
    pub fn acquire(&self, target_id: &str, holder_id: &str, ttl: Duration) -> Result<LockToken, LockConflict> {
        let now = Instant::now();
        let lease = Lease {
            holder_id: holder_id.to_string(),
            token: LockToken::generate(),
            acquired_at: chrono::Utc::now(),
            expires_at: now + ttl,
        };
        let token = lease.token;

        match self.leases.entry(target_id.to_string()) {
            Entry::Occupied(mut occupied) => {
                let current = occupied.get();
                if current.is_live(now) {
                    let conflict = LockConflict {
                        target_id: target_id.to_string(),
                        holder_id: current.holder_id.clone(),
                        remaining: current.expires_at.saturating_duration_since(now),
                    };
                    warn!(target = target_id, requester = holder_id, holder = %conflict.holder_id, "Lock conflict");
                    return Err(conflict);
                }
                debug!(target = target_id, previous = %current.holder_id, "Replacing expired lock");
                occupied.insert(lease);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(lease);
            }
        }

        debug!(target = target_id, holder = holder_id, ttl_ms = ttl.as_millis() as u64, "Lock acquired");
        Ok(token)
    }

    /// Poll [`acquire`](Self::acquire) until it succeeds or `timeout` elapses
    pub fn acquire_wait(
        &self,
        target_id: &str,
        holder_id: &str,
        ttl: Duration,
        timeout: Duration,
        poll: Duration,
    ) -> Result<LockToken, LockConflict> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.acquire(target_id, holder_id, ttl) {
                Ok(token) => return Ok(token),
                Err(conflict) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(conflict);
                    }
                    let nap = poll
                        .min(conflict.remaining.max(Duration::from_millis(1)))
                        .min(deadline - now);
                    std::thread::sleep(nap);
                }
            }
        }
    }

    /// Remove the lock only if `token` owns it
    pub fn release(&self, target_id: &str, token: LockToken) -> bool {
        let removed = self
            .leases
            .remove_if(target_id, |_, lease| lease.token == token)
            .is_some();
        if removed {
            debug!(target = target_id, "Lock released");
        }
        removed
    }

    /// Push the expiry out to `now + new_ttl`
    pub fn extend(&self, target_id: &str, token: LockToken, new_ttl: Duration) -> Result<(), LockError> {
        let now = Instant::now();
        let mut lease = self.leases.get_mut(target_id).ok_or_else(|| LockError::NotHeld {
            target_id: target_id.to_string(),
        })?;
        if lease.token != token {
            return Err(LockError::TokenMismatch {
                target_id: target_id.to_string(),
            });
        }
        if !lease.is_live(now) {
            return Err(LockError::Expired {
                target_id: target_id.to_string(),
            });
        }
        lease.expires_at = now + new_ttl;
        Ok(())
    }

    /// Current live holder, if any
    pub fn holder(&self, target_id: &str) -> Option<LockInfo> {
        let now = Instant::now();
        let lease = self.leases.get(target_id)?;
        lease.is_live(now).then(|| LockInfo {
            target_id: target_id.to_string(),
            holder_id: lease.holder_id.clone(),
            acquired_at: lease.acquired_at,
            remaining_ms: lease.expires_at.saturating_duration_since(now).as_millis() as u64,
        })
    }

    /// Drop expired leases; returns how many were removed
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.leases.len();
        self.leases.retain(|_, lease| lease.is_live(now));
        let removed = before.saturating_sub(self.leases.len());
        if removed > 0 {
            debug!(removed, "Swept expired locks");
        }
        removed
    }

    /// Number of entries in the table, expired ones included
    pub fn len(&self) -> usize {
        self.leases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leases.is_empty()
    }
}

/// Releases its lock when dropped, including during unwinding
#[derive(Debug)]
pub struct LockGuard {
    manager: Arc<LockManager>,
    target_id: String,
    token: LockToken,
    released: bool,
}

impl LockGuard {
    /// Acquire a lock and wrap it in a guard
    pub fn acquire(
        manager: Arc<LockManager>,
        target_id: &str,
        holder_id: &str,
        ttl: Duration,
    ) -> Result<Self, LockConflict> {
        let token = manager.acquire(target_id, holder_id, ttl)?;
        Ok(Self::adopt(manager, target_id, token))
    }

    /// Take ownership of an already-acquired token
    pub fn adopt(manager: Arc<LockManager>, target_id: &str, token: LockToken) -> Self {
        Self {
            manager,
            target_id: target_id.to_string(),
            token,
            released: false,
        }
    }

    pub fn token(&self) -> LockToken {
        self.token
    }

    pub fn target_id(&self) -> &str {
        &self.target_id
    }

    /// Release now; returns whether the lock was still ours
    pub fn release(mut self) -> bool {
        self.released = true;
        self.manager.release(&self.target_id, self.token)
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.released {
            self.manager.release(&self.target_id, self.token);
        }
    }
}
