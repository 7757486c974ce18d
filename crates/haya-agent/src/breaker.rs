//! Per-provider circuit breaker.
//!
//! closed → open after `failure_threshold` consecutive failures;
//! open → half-open once `recovery_time` has elapsed (observed on the next
//! availability check); half-open → closed on one success, → open on one
//! failure.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    HalfOpen,
    Open,
}

/// Public snapshot of one provider's breaker record.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerEntry {
    pub name: String,
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub total_requests: u64,
    pub total_failures: u64,
    pub last_success_at: Option<i64>,
    pub last_failure_at: Option<i64>,
}

struct Internal {
    state: BreakerState,
    consecutive_failures: u32,
    total_requests: u64,
    total_failures: u64,
    last_success_at: Option<i64>,
    last_failure_at: Option<i64>,
    opened_at: Option<Instant>,
}

impl Internal {
    fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            total_requests: 0,
            total_failures: 0,
            last_success_at: None,
            last_failure_at: None,
            opened_at: None,
        }
    }
}

pub struct CircuitBreaker {
    entries: DashMap<String, Internal>,
    failure_threshold: u32,
    recovery_time: Duration,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(30_000))
    }
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, recovery_time: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            failure_threshold,
            recovery_time,
        }
    }

    pub fn record_success(&self, provider: &str) {
        let mut e = self
            .entries
            .entry(provider.to_string())
            .or_insert_with(Internal::new);
        e.total_requests += 1;
        e.consecutive_failures = 0;
        e.last_success_at = Some(chrono::Utc::now().timestamp_millis());
        if e.state != BreakerState::Closed {
            info!(provider, "breaker closed after successful probe");
        }
        e.state = BreakerState::Closed;
        e.opened_at = None;
    }

    pub fn record_failure(&self, provider: &str) {
        let mut e = self
            .entries
            .entry(provider.to_string())
            .or_insert_with(Internal::new);
        e.total_requests += 1;
        e.total_failures += 1;
        e.consecutive_failures += 1;
        e.last_failure_at = Some(chrono::Utc::now().timestamp_millis());

        let tripped = match e.state {
            // one failed probe re-opens immediately
            BreakerState::HalfOpen => true,
            BreakerState::Closed => e.consecutive_failures >= self.failure_threshold,
            BreakerState::Open => false,
        };
        if tripped {
            warn!(
                provider,
                consecutive = e.consecutive_failures,
                "breaker opened"
            );
            e.state = BreakerState::Open;
            e.opened_at = Some(Instant::now());
        }
    }

    /// Whether a call should proceed. Observing an expired recovery window
    /// transitions open → half-open and lets one probe through.
    pub fn is_available(&self, provider: &str) -> bool {
        let Some(mut e) = self.entries.get_mut(provider) else {
            return true;
        };
        match e.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let expired = e
                    .opened_at
                    .is_some_and(|t| t.elapsed() >= self.recovery_time);
                if expired {
                    info!(provider, "breaker half-open, allowing probe");
                    e.state = BreakerState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn state(&self, provider: &str) -> BreakerState {
        self.entries
            .get(provider)
            .map(|e| e.state)
            .unwrap_or(BreakerState::Closed)
    }

    /// Clear one entry, or all when `provider` is None.
    pub fn reset(&self, provider: Option<&str>) {
        match provider {
            Some(p) => {
                self.entries.remove(p);
            }
            None => self.entries.clear(),
        }
    }

    pub fn snapshot(&self) -> Vec<BreakerEntry> {
        let mut out: Vec<BreakerEntry> = self
            .entries
            .iter()
            .map(|e| BreakerEntry {
                name: e.key().clone(),
                state: e.state,
                consecutive_failures: e.consecutive_failures,
                total_requests: e.total_requests,
                total_failures: e.total_failures,
                last_success_at: e.last_success_at,
                last_failure_at: e.last_failure_at,
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(3, Duration::from_millis(50))
    }

    #[test]
    fn opens_after_threshold_consecutive_failures() {
        let b = breaker();
        b.record_failure("p");
        b.record_failure("p");
        assert!(b.is_available("p"));
        b.record_failure("p");
        assert_eq!(b.state("p"), BreakerState::Open);
        assert!(!b.is_available("p"));
    }

    #[test]
    fn success_resets_consecutive_count() {
        let b = breaker();
        b.record_failure("p");
        b.record_failure("p");
        b.record_success("p");
        b.record_failure("p");
        b.record_failure("p");
        assert_eq!(b.state("p"), BreakerState::Closed);
    }

    #[test]
    fn recovery_window_transitions_to_half_open() {
        let b = breaker();
        for _ in 0..3 {
            b.record_failure("p");
        }
        assert!(!b.is_available("p"));
        std::thread::sleep(Duration::from_millis(60));
        assert!(b.is_available("p"));
        assert_eq!(b.state("p"), BreakerState::HalfOpen);
    }

    #[test]
    fn half_open_success_closes() {
        let b = breaker();
        for _ in 0..3 {
            b.record_failure("p");
        }
        std::thread::sleep(Duration::from_millis(60));
        assert!(b.is_available("p"));
        b.record_success("p");
        assert_eq!(b.state("p"), BreakerState::Closed);
        let snap = b.snapshot();
        assert_eq!(snap[0].consecutive_failures, 0);
    }

    #[test]
    fn half_open_failure_reopens() {
        let b = breaker();
        for _ in 0..3 {
            b.record_failure("p");
        }
        std::thread::sleep(Duration::from_millis(60));
        assert!(b.is_available("p"));
        b.record_failure("p");
        assert_eq!(b.state("p"), BreakerState::Open);
        assert!(!b.is_available("p"));
    }

    #[test]
    fn unknown_provider_is_available_and_reset_clears() {
        let b = breaker();
        assert!(b.is_available("fresh"));
        for _ in 0..3 {
            b.record_failure("p");
        }
        b.reset(Some("p"));
        assert_eq!(b.state("p"), BreakerState::Closed);
    }

    #[test]
    fn totals_accumulate() {
        let b = breaker();
        b.record_success("p");
        b.record_failure("p");
        let snap = b.snapshot();
        assert_eq!(snap[0].total_requests, 2);
        assert_eq!(snap[0].total_failures, 1);
        assert!(snap[0].last_success_at.is_some());
        assert!(snap[0].last_failure_at.is_some());
    }
}
