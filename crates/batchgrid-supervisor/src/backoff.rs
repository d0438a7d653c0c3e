//! Per-host launch backoff.
//!
//! A host moves to `Backoff` on any launch failure and back to `Healthy`
//! on its next successful launch. While backing off, the host is not
//! eligible for allocation until `next_eligible_at`:
//!
//! ```text
//! next_eligible_at = now + min(cap, base * 2^(fail_streak - 1))
//! ```

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use batchgrid_core::{BatchConfig, HostId};

/// Health of a host from the allocator's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostHealth {
    Healthy,
    Backoff {
        fail_streak: u32,
        next_eligible_at: Instant,
    },
}

/// Backoff record for one host. Absent means healthy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostBackoffState {
    pub fail_streak: u32,
    pub next_eligible_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(10),
            cap: Duration::from_secs(300),
        }
    }
}

impl BackoffPolicy {
    pub fn from_config(config: &BatchConfig) -> Self {
        Self {
            base: config.backoff_base(),
            cap: config.backoff_cap(),
        }
    }

    /// Delay after the `fail_streak`-th consecutive failure.
    pub fn delay_for(&self, fail_streak: u32) -> Duration {
        if fail_streak == 0 {
            return Duration::ZERO;
        }
        let exponent = fail_streak - 1;
        if exponent >= 32 {
            return self.cap;
        }
        self.base.saturating_mul(1u32 << exponent).min(self.cap)
    }
}

/// Backoff state for every host that has failed since its last success.
#[derive(Debug, Clone, Default)]
pub struct BackoffTable {
    policy: BackoffPolicy,
    hosts: HashMap<HostId, HostBackoffState>,
}

impl BackoffTable {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            hosts: HashMap::new(),
        }
    }

    pub fn policy(&self) -> BackoffPolicy {
        self.policy
    }

    /// Record a launch failure and return how long the host sits out.
    pub fn record_failure(&mut self, host_id: &str, now: Instant) -> Duration {
        let policy = self.policy;
        let state = self
            .hosts
            .entry(host_id.to_string())
            .or_insert(HostBackoffState {
                fail_streak: 0,
                next_eligible_at: now,
            });
        state.fail_streak = state.fail_streak.saturating_add(1);
        let delay = policy.delay_for(state.fail_streak);
        state.next_eligible_at = now + delay;

        warn!(
            host = host_id,
            fail_streak = state.fail_streak,
            backoff_ms = delay.as_millis() as u64,
            "host entered backoff"
        );
        delay
    }

    /// Record a successful launch. Returns true if the host was backing off.
    pub fn record_success(&mut self, host_id: &str) -> bool {
        match self.hosts.remove(host_id) {
            Some(state) => {
                info!(host = host_id, fail_streak = state.fail_streak, "host recovered from backoff");
                true
            }
            None => false,
        }
    }

    pub fn state(&self, host_id: &str) -> Option<&HostBackoffState> {
        self.hosts.get(host_id)
    }

    pub fn health(&self, host_id: &str) -> HostHealth {
        match self.hosts.get(host_id) {
            Some(s) => HostHealth::Backoff {
                fail_streak: s.fail_streak,
                next_eligible_at: s.next_eligible_at,
            },
            None => HostHealth::Healthy,
        }
    }

    /// Whether the allocator may use this host at `now`.
    pub fn is_eligible(&self, host_id: &str, now: Instant) -> bool {
        self.hosts
            .get(host_id)
            .is_none_or(|s| now >= s.next_eligible_at)
    }

    /// Hosts the allocator must skip at `now`.
    pub fn blocked_hosts(&self, now: Instant) -> HashSet<HostId> {
        let blocked: HashSet<HostId> = self
            .hosts
            .iter()
            .filter(|(_, s)| now < s.next_eligible_at)
            .map(|(h, _)| h.clone())
            .collect();
        if !blocked.is_empty() {
            debug!(count = blocked.len(), "hosts under backoff");
        }
        blocked
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}
