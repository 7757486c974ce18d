//! Per-client-IP sliding-window auth rate limiter with lockout.
//!
//! Failed auth attempts accumulate in a per-IP window; crossing the attempt
//! cap locks the IP out for a fixed period during which even correct
//! credentials are rejected. Loopback addresses are exempt. A periodic
//! prune task drops empty entries.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::{debug, warn};

const DEFAULT_WINDOW_MS: i64 = 60_000;
const DEFAULT_MAX_ATTEMPTS: usize = 10;
const DEFAULT_LOCKOUT_MS: i64 = 300_000;
const PRUNE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    /// Remaining lockout when not allowed.
    pub retry_after_ms: i64,
}

#[derive(Default)]
struct IpState {
    /// Failure timestamps (ms) inside the sliding window.
    failures: Vec<i64>,
    locked_until: Option<i64>,
}

pub struct AuthRateLimiter {
    entries: DashMap<IpAddr, IpState>,
    window_ms: i64,
    max_attempts: usize,
    lockout_ms: i64,
}

impl Default for AuthRateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_MS, DEFAULT_MAX_ATTEMPTS, DEFAULT_LOCKOUT_MS)
    }
}

impl AuthRateLimiter {
    pub fn new(window_ms: i64, max_attempts: usize, lockout_ms: i64) -> Self {
        Self {
            entries: DashMap::new(),
            window_ms,
            max_attempts,
            lockout_ms,
        }
    }

    /// Whether an auth attempt from `ip` may proceed right now.
    pub fn check(&self, ip: IpAddr) -> RateDecision {
        if is_loopback(ip) {
            return RateDecision {
                allowed: true,
                retry_after_ms: 0,
            };
        }
        let now = now_ms();
        let Some(state) = self.entries.get(&ip) else {
            return RateDecision {
                allowed: true,
                retry_after_ms: 0,
            };
        };
        if let Some(until) = state.locked_until {
            if until > now {
                return RateDecision {
                    allowed: false,
                    retry_after_ms: until - now,
                };
            }
        }
        RateDecision {
            allowed: true,
            retry_after_ms: 0,
        }
    }

    /// Record a failed auth attempt; locks the IP when the window fills.
    pub fn record_failure(&self, ip: IpAddr) {
        if is_loopback(ip) {
            return;
        }
        let now = now_ms();
        let mut state = self.entries.entry(ip).or_default();
        state.failures.retain(|t| now - t < self.window_ms);
        state.failures.push(now);
        if state.failures.len() >= self.max_attempts {
            warn!(%ip, attempts = state.failures.len(), "auth rate limit hit, locking out");
            state.locked_until = Some(now + self.lockout_ms);
        }
    }

    /// Successful auth clears an expired lock; the failure window itself is
    /// not reset.
    pub fn record_success(&self, ip: IpAddr) {
        if let Some(mut state) = self.entries.get_mut(&ip) {
            let now = now_ms();
            if state.locked_until.is_some_and(|until| until <= now) {
                state.locked_until = None;
            }
        }
    }

    /// Drop entries with no recent failures and no active lock.
    pub fn prune(&self) {
        let now = now_ms();
        let before = self.entries.len();
        self.entries.retain(|_, state| {
            state.failures.retain(|t| now - t < self.window_ms);
            !state.failures.is_empty() || state.locked_until.is_some_and(|u| u > now)
        });
        let removed = before - self.entries.len();
        if removed > 0 {
            debug!(removed, "rate limiter entries pruned");
        }
    }

    /// Spawn the periodic prune task.
    pub fn spawn_prune_task(self: &Arc<Self>) {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(PRUNE_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                limiter.prune();
            }
        });
    }
}

/// 127.0.0.0/8, ::1, and v4-mapped loopback.
pub fn is_loopback(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback(),
        IpAddr::V6(v6) => {
            v6.is_loopback() || v6.to_ipv4_mapped().is_some_and(|v4| v4.is_loopback())
        }
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn lockout_after_max_attempts_in_window() {
        let limiter = AuthRateLimiter::new(60_000, 10, 300_000);
        let attacker = ip("10.0.0.5");
        for _ in 0..10 {
            assert!(limiter.check(attacker).allowed);
            limiter.record_failure(attacker);
        }
        let decision = limiter.check(attacker);
        assert!(!decision.allowed);
        // retry-after communicates the lockout remainder
        assert!(decision.retry_after_ms > 290_000 && decision.retry_after_ms <= 300_000);
    }

    #[test]
    fn other_ips_unaffected_by_lockout() {
        let limiter = AuthRateLimiter::new(60_000, 10, 300_000);
        for _ in 0..11 {
            limiter.record_failure(ip("10.0.0.5"));
        }
        assert!(!limiter.check(ip("10.0.0.5")).allowed);
        assert!(limiter.check(ip("10.0.0.6")).allowed);
    }

    #[test]
    fn loopback_is_always_allowed() {
        let limiter = AuthRateLimiter::new(60_000, 2, 300_000);
        for addr in ["127.0.0.1", "127.8.8.8", "::1", "::ffff:127.0.0.1"] {
            for _ in 0..5 {
                limiter.record_failure(ip(addr));
            }
            assert!(limiter.check(ip(addr)).allowed, "{addr} must stay exempt");
        }
    }

    #[test]
    fn old_failures_age_out_of_the_window() {
        let limiter = AuthRateLimiter::new(1, 3, 300_000);
        let client = ip("192.168.1.9");
        limiter.record_failure(client);
        limiter.record_failure(client);
        std::thread::sleep(Duration::from_millis(5));
        // the previous two are outside the 1ms window now
        limiter.record_failure(client);
        assert!(limiter.check(client).allowed);
    }

    #[test]
    fn prune_drops_idle_entries_but_keeps_locks() {
        let limiter = AuthRateLimiter::new(1, 2, 300_000);
        let locked = ip("10.1.1.1");
        limiter.record_failure(locked);
        limiter.record_failure(locked);
        let idle = ip("10.1.1.2");
        limiter.record_failure(idle);

        std::thread::sleep(Duration::from_millis(5));
        limiter.prune();
        assert!(!limiter.check(locked).allowed);
        assert_eq!(limiter.entries.len(), 1);
    }
}
