use dashmap::DashMap;
use std::{
    net::IpAddr,
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::warn;

/// Thresholds applied by [`FailureRateLimiter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    /// Failures within the reset window that trigger a block.
    pub max_failures: u32,
    /// How long an address stays blocked.
    pub block_duration: Duration,
    /// Quiet period after which the failure count starts again from zero.
    pub reset_window: Duration,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            max_failures: 5,
            block_duration: Duration::from_secs(15 * 60),
            reset_window: Duration::from_secs(10 * 60),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct FailedAttempt {
    count: u32,
    last_failure: Instant,
    blocked_until: Option<Instant>,
}

/// Per-address brute-force guard.
///
/// Only failed or unauthenticated attempts are recorded; authenticated viewers
/// never touch the table. Cloning shares the underlying table.
#[derive(Clone, Debug, Default)]
pub struct FailureRateLimiter {
    attempts: Arc<DashMap<IpAddr, FailedAttempt>>,
    policy: RateLimitPolicy,
}

impl FailureRateLimiter {
    pub fn new(policy: RateLimitPolicy) -> Self {
        Self {
            attempts: Arc::new(DashMap::new()),
            policy,
        }
    }

    pub fn policy(&self) -> RateLimitPolicy {
        self.policy
    }

    /// Returns `true` while `addr` is inside an active block.
    pub fn is_blocked(&self, addr: IpAddr) -> bool {
        self.is_blocked_at(addr, Instant::now())
    }

    pub fn is_blocked_at(&self, addr: IpAddr, now: Instant) -> bool {
        self.attempts
            .get(&addr)
            .and_then(|attempt| attempt.blocked_until)
            .map_or(false, |until| now < until)
    }

    /// Records a failed attempt from `addr`, blocking it once the threshold is reached.
    ///
    /// Returns `true` if this failure started a block.
    pub fn record_failure(&self, addr: IpAddr) -> bool {
        self.record_failure_at(addr, Instant::now())
    }

    pub fn record_failure_at(&self, addr: IpAddr, now: Instant) -> bool {
        let policy = self.policy;
        let mut entry = self.attempts.entry(addr).or_insert(FailedAttempt {
            count: 0,
            last_failure: now,
            blocked_until: None,
        });
        let attempt = entry.value_mut();

        if now.saturating_duration_since(attempt.last_failure) > policy.reset_window {
            attempt.count = 0;
        }
        attempt.count = attempt.count.saturating_add(1);
        attempt.last_failure = now;

        if attempt.count >= policy.max_failures {
            attempt.blocked_until = Some(now + policy.block_duration);
            warn!(
                "SECURITY: {} blocked for {} minutes after {} failed attempts",
                addr,
                policy.block_duration.as_secs() / 60,
                attempt.count
            );
            return true;
        }
        false
    }

    /// Current failure count for `addr`, zero if none recorded.
    pub fn failure_count(&self, addr: IpAddr) -> u32 {
        self.attempts.get(&addr).map_or(0, |attempt| attempt.count)
    }

    /// Drops entries that are neither blocked nor inside their reset window.
    pub fn purge_expired(&self) -> usize {
        self.purge_expired_at(Instant::now())
    }

    pub fn purge_expired_at(&self, now: Instant) -> usize {
        let before = self.attempts.len();
        let reset_window = self.policy.reset_window;
        self.attempts.retain(|_, attempt| {
            let blocked = attempt.blocked_until.map_or(false, |until| now < until);
            let recent = now.saturating_duration_since(attempt.last_failure) <= reset_window;
            blocked || recent
        });
        before.saturating_sub(self.attempts.len())
    }

    pub fn tracked_addresses(&self) -> usize {
        self.attempts.len()
    }
}
