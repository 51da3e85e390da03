//! Fixed-window rate limiting per `(actor, operation)` pair.
//!
//! Counters live in a sharded concurrent map, so an evaluation touches exactly
//! one key and costs the same regardless of how many actors are tracked.
//! Stale counters are never cleaned up on the request path: the engine's
//! maintenance thread calls [`RateLimiter::sweep`] on a fixed interval.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::time::{Duration, Instant};
use tracing::debug;

/// Counter key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateKey {
    pub actor_id: String,
    pub operation_id: String,
}

impl RateKey {
    pub fn new(actor_id: impl Into<String>, operation_id: impl Into<String>) -> Self {
        Self {
            actor_id: actor_id.into(),
            operation_id: operation_id.into(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct WindowCounter {
    started: Instant,
    count: u32,
}

/// Result of a rate-limit check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateCheck {
    /// Call fits in the window; `remaining` slots are left after it
    Allowed { remaining: u32 },
    /// Window is full until `retry_after` elapses
    Limited { retry_after: Duration },
    /// Operation has no limit configured
    Unlimited,
}

impl RateCheck {
    pub fn is_allowed(&self) -> bool {
        !matches!(self, RateCheck::Limited { .. })
    }
}

/// In-memory fixed-window rate limiter
#[derive(Debug)]
pub struct RateLimiter {
    window: Duration,
    counters: DashMap<RateKey, WindowCounter>,
}

impl RateLimiter {
    /// Create a limiter with the given window (one minute in production)
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            counters: DashMap::new(),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Check the limit and consume a slot if the call is allowed
    pub fn check_and_record(&self, key: RateKey, limit: u32, now: Instant) -> RateCheck {
        if limit == 0 {
            return RateCheck::Unlimited;
        }

        match self.counters.entry(key) {
            Entry::Occupied(mut occupied) => {
                let counter = occupied.get_mut();
                let mut elapsed = now.saturating_duration_since(counter.started);
                if elapsed >= self.window {
                    counter.started = now;
                    counter.count = 0;
                    elapsed = Duration::ZERO;
                }
                if counter.count >= limit {
                    RateCheck::Limited {
                        retry_after: self.window - elapsed,
                    }
                } else {
                    counter.count += 1;
                    RateCheck::Allowed {
                        remaining: limit - counter.count,
                    }
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(WindowCounter {
                    started: now,
                    count: 1,
                });
                RateCheck::Allowed {
                    remaining: limit - 1,
                }
            }
        }
    }

    /// Same answer as [`check_and_record`](Self::check_and_record) without consuming a slot
    pub fn peek(&self, key: &RateKey, limit: u32, now: Instant) -> RateCheck {
        if limit == 0 {
            return RateCheck::Unlimited;
        }

        let Some(counter) = self.counters.get(key) else {
            return RateCheck::Allowed {
                remaining: limit - 1,
            };
        };
        let elapsed = now.saturating_duration_since(counter.started);
        if elapsed >= self.window {
            RateCheck::Allowed {
                remaining: limit - 1,
            }
        } else if counter.count >= limit {
            RateCheck::Limited {
                retry_after: self.window - elapsed,
            }
        } else {
            RateCheck::Allowed {
                remaining: limit - counter.count - 1,
            }
        }
    }

    /// Drop counters whose window has ended; returns how many were removed
    pub fn sweep(&self, now: Instant) -> usize {
        let before = self.counters.len();
        self.counters
            .retain(|_, counter| now.saturating_duration_since(counter.started) < self.window);
        let removed = before.saturating_sub(self.counters.len());
        if removed > 0 {
            debug!(removed, "Swept expired rate-limit counters");
        }
        removed
    }

    /// Number of counters currently tracked
    pub fn tracked(&self) -> usize {
        self.counters.len()
    }
}
