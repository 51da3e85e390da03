//! Policy Evaluator
//!
//! Decides whether an actor may run an operation against a target. Each check
//! is a gate: a small function over the same `(actor, spec, context)` input.
//! Gates run in a fixed order and the first failure decides.
//!
//! # Gate Order
//!
//! ```text
//! role membership → capabilities → confirmation → rate limit
//! ```
//!
//! A denial is an ordinary [`Decision`], never an error. The engine audits it
//! like any other decision.

use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use strum::Display;
use tracing::{debug, warn};

use crate::catalog::OperationSpec;
use crate::rate_limit::{RateCheck, RateKey, RateLimiter};
use crate::types::{Actor, RequestMode};

const CHALLENGE_LEN: usize = 16;

/// Why a decision came out the way it did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum DecisionReason {
    Allowed,
    RoleNotAllowed,
    MissingCapability,
    /// Soft deny: re-request with the challenge token
    ConfirmationRequired,
    RateLimited,
}

/// Outcome of policy evaluation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub allowed: bool,
    pub reason: DecisionReason,
    pub requires_confirmation: bool,
    #[serde(default)]
    pub missing_capabilities: BTreeSet<String>,
}

impl Decision {
    fn allow(requires_confirmation: bool) -> Self {
        Self {
            allowed: true,
            reason: DecisionReason::Allowed,
            requires_confirmation,
            missing_capabilities: BTreeSet::new(),
        }
    }

    fn deny(reason: DecisionReason, requires_confirmation: bool) -> Self {
        Self {
            allowed: false,
            reason,
            requires_confirmation,
            missing_capabilities: BTreeSet::new(),
        }
    }
}

/// Caller-supplied evidence for the gates
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicyContext {
    pub confirmation_token: Option<String>,
    pub supplied_capabilities: BTreeSet<String>,
}

impl PolicyContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.supplied_capabilities.insert(capability.into());
        self
    }

    pub fn with_confirmation(mut self, token: impl Into<String>) -> Self {
        self.confirmation_token = Some(token.into());
        self
    }
}

/// Everything a pure gate looks at
#[derive(Debug, Clone, Copy)]
pub struct GateInput<'a> {
    pub actor: &'a Actor,
    pub spec: &'a OperationSpec,
    pub context: &'a PolicyContext,
    /// Challenges currently accepted for this operation+target+actor
    pub accepted_challenges: &'a [String],
}

/// A pure policy check; `Err` carries the denial
pub type Gate = fn(&GateInput<'_>) -> Result<(), Decision>;

/// Gate 1: explicit role membership
pub fn role_gate(input: &GateInput<'_>) -> Result<(), Decision> {
    if input.spec.allows(input.actor.role) {
        Ok(())
    } else {
        Err(Decision::deny(
            DecisionReason::RoleNotAllowed,
            input.spec.needs_confirmation(),
        ))
    }
}

/// Gate 2: required capabilities must all be supplied
pub fn capability_gate(input: &GateInput<'_>) -> Result<(), Decision> {
    let missing: BTreeSet<String> = input
        .spec
        .required_capabilities
        .difference(&input.context.supplied_capabilities)
        .cloned()
        .collect();
    if missing.is_empty() {
        return Ok(());
    }
    let mut decision = Decision::deny(
        DecisionReason::MissingCapability,
        input.spec.needs_confirmation(),
    );
    decision.missing_capabilities = missing;
    Err(decision)
}

/// Gate 3: confirmation token must match an accepted challenge
pub fn confirmation_gate(input: &GateInput<'_>) -> Result<(), Decision> {
    if !input.spec.needs_confirmation() {
        return Ok(());
    }
    let confirmed = input
        .context
        .confirmation_token
        .as_deref()
        .map(|token| input.accepted_challenges.iter().any(|c| c == token))
        .unwrap_or(false);
    if confirmed {
        Ok(())
    } else {
        Err(Decision::deny(DecisionReason::ConfirmationRequired, true))
    }
}

/// The stateless gates, in evaluation order. The rate limit runs last.
pub const PURE_GATES: [Gate; 3] = [role_gate, capability_gate, confirmation_gate];

/// Derives confirmation challenges bound to operation, target and actor.
///
/// Challenges are deterministic within a time window, so a simulation and a
/// subsequent execution see the same token. Tokens from the previous window
/// are still accepted so a challenge issued just before a boundary works.
#[derive(Clone)]
pub struct ConfirmationChallenger {
    secret: [u8; 32],
    window_secs: u64,
}

impl std::fmt::Debug for ConfirmationChallenger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfirmationChallenger")
            .field("window_secs", &self.window_secs)
            .finish_non_exhaustive()
    }
}

impl ConfirmationChallenger {
    /// Create a challenger with a fresh random secret
    pub fn new(window: Duration) -> Self {
        let mut secret = [0u8; 32];
        OsRng.fill_bytes(&mut secret);
        Self::with_secret(secret, window)
    }

    pub fn with_secret(secret: [u8; 32], window: Duration) -> Self {
        Self {
            secret,
            window_secs: window.as_secs().max(1),
        }
    }

    fn epoch(&self, at: SystemTime) -> u64 {
        at.duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
            / self.window_secs
    }

    fn derive(&self, operation_id: &str, target_id: &str, actor_id: &str, epoch: u64) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.secret);
        // Length-prefix each field so boundaries cannot be shifted
        for part in [operation_id, target_id, actor_id] {
            hasher.update((part.len() as u64).to_be_bytes());
            hasher.update(part.as_bytes());
        }
        hasher.update(epoch.to_be_bytes());
        let mut token = hex::encode(hasher.finalize());
        token.truncate(CHALLENGE_LEN);
        token
    }

    /// The challenge a caller must echo back for this request
    pub fn challenge(
        &self,
        operation_id: &str,
        target_id: &str,
        actor_id: &str,
        at: SystemTime,
    ) -> String {
        self.derive(operation_id, target_id, actor_id, self.epoch(at))
    }

    /// Challenges accepted at `at`: current window and the one before it
    pub fn accepted(
        &self,
        operation_id: &str,
        target_id: &str,
        actor_id: &str,
        at: SystemTime,
    ) -> Vec<String> {
        let epoch = self.epoch(at);
        let mut accepted = vec![self.derive(operation_id, target_id, actor_id, epoch)];
        if epoch > 0 {
            accepted.push(self.derive(operation_id, target_id, actor_id, epoch - 1));
        }
        accepted
    }
}

/// Runs the gate pipeline
#[derive(Debug)]
pub struct PolicyEvaluator {
    challenger: ConfirmationChallenger,
    limiter: Arc<RateLimiter>,
}

impl PolicyEvaluator {
    pub fn new(challenger: ConfirmationChallenger, limiter: RateLimiter) -> Self {
        Self {
            challenger,
            limiter: Arc::new(limiter),
        }
    }

    pub fn challenger(&self) -> &ConfirmationChallenger {
        &self.challenger
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Shared handle for the maintenance sweeper
    pub fn shared_limiter(&self) -> Arc<RateLimiter> {
        Arc::clone(&self.limiter)
    }

    /// Evaluate the gates for one request.
    ///
    /// In `Simulate` mode the rate-limit gate peeks instead of consuming a
    /// slot, so simulating never changes what a later execution is told.
    pub fn evaluate(
        &self,
        actor: &Actor,
        spec: &OperationSpec,
        target_id: &str,
        context: &PolicyContext,
        mode: RequestMode,
    ) -> Decision {
        let accepted = if spec.needs_confirmation() {
            self.challenger
                .accepted(&spec.id, target_id, &actor.id, SystemTime::now())
        } else {
            Vec::new()
        };
        let input = GateInput {
            actor,
            spec,
            context,
            accepted_challenges: &accepted,
        };

        for gate in PURE_GATES {
            if let Err(denial) = gate(&input) {
                warn!(
                    actor = %actor,
                    operation = %spec.id,
                    target = target_id,
                    reason = %denial.reason,
                    "Policy denied"
                );
                return denial;
            }
        }

        let key = RateKey::new(actor.id.as_str(), spec.id.as_str());
        let now = Instant::now();
        let check = match mode {
            RequestMode::Execute => {
                self.limiter
                    .check_and_record(key, spec.rate_limit_per_minute, now)
            }
            RequestMode::Simulate => self.limiter.peek(&key, spec.rate_limit_per_minute, now),
        };
        if let RateCheck::Limited { retry_after } = check {
            warn!(
                actor = %actor,
                operation = %spec.id,
                retry_after_ms = retry_after.as_millis() as u64,
                "Rate limit exceeded"
            );
            return Decision::deny(DecisionReason::RateLimited, spec.needs_confirmation());
        }

        debug!(actor = %actor, operation = %spec.id, target = target_id, "Policy allowed");
        Decision::allow(spec.needs_confirmation())
    }
}
