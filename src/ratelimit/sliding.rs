//! Sliding-window log limiter.
//!
//! Keeps the exact timestamps of accepted requests per identifier, giving
//! precise windows at the cost of memory proportional to `max_requests`.
//! Rejected attempts are never logged, so abusive callers cannot grow a log
//! past the limit. Logs are keyed by the caller identifier exactly as given;
//! any string, including an empty one, names a log.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, trace};

use super::decision::{ms_between, RateLimitDecision, RateLimitInfo};
use crate::clock::{after, before, Clock, SystemClock};
use crate::error::{RateKeeperError, Result};
use crate::sweeper::Sweep;

/// Sliding-window limiter for a single limit.
#[derive(Debug)]
pub struct SlidingWindowLimiter {
    window: Duration,
    max_requests: u64,
    logs: DashMap<String, VecDeque<DateTime<Utc>>>,
    clock: Arc<dyn Clock>,
}

impl SlidingWindowLimiter {
    /// Allow `max_requests` accepted requests in any span of `window`.
    pub fn new(max_requests: u64, window: Duration) -> Result<Self> {
        Self::with_clock(max_requests, window, Arc::new(SystemClock))
    }

    pub fn with_clock(max_requests: u64, window: Duration, clock: Arc<dyn Clock>) -> Result<Self> {
        if max_requests == 0 || window.is_zero() {
            return Err(RateKeeperError::Config(
                "sliding window needs positive max_requests and window".into(),
            ));
        }
        Ok(Self {
            window,
            max_requests,
            logs: DashMap::new(),
            clock,
        })
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn max_requests(&self) -> u64 {
        self.max_requests
    }

    /// Decide on a request from `identifier`, logging it if accepted.
    pub fn check_request(&self, identifier: &str) -> RateLimitDecision {
        let now = self.clock.now();
        let cutoff = before(now, self.window);

        // The entry guard serializes checks for this identifier
        let mut log = self.logs.entry(identifier.to_string()).or_default();
        prune(&mut log, cutoff);

        let allowed = (log.len() as u64) < self.max_requests;
        if allowed {
            log.push_back(now);
        }

        let in_window = log.len() as u64;
        let reset_at = log
            .front()
            .map(|oldest| after(*oldest, self.window))
            .unwrap_or_else(|| after(now, self.window));

        if allowed {
            trace!(identifier = %identifier, in_window = in_window, "Sliding window request accepted");
        } else {
            debug!(identifier = %identifier, in_window = in_window, "Sliding window limit exceeded");
        }

        RateLimitDecision {
            allowed,
            info: RateLimitInfo {
                limit: self.max_requests,
                total_hits: in_window,
                remaining: self.max_requests.saturating_sub(in_window),
                reset_at,
                ms_until_reset: ms_between(now, reset_at),
            },
            degraded: false,
        }
    }

    /// Accepted requests from `identifier` still inside the window.
    pub fn in_window(&self, identifier: &str) -> usize {
        let cutoff = before(self.clock.now(), self.window);
        self.logs
            .get(identifier)
            .map(|log| log.iter().filter(|t| **t > cutoff).count())
            .unwrap_or(0)
    }

    /// Forget `identifier`'s log.
    pub fn reset(&self, identifier: &str) {
        self.logs.remove(identifier);
    }

    /// Number of identifiers with a log, stale or not.
    pub fn tracked_keys(&self) -> usize {
        self.logs.len()
    }
}

fn prune(log: &mut VecDeque<DateTime<Utc>>, cutoff: DateTime<Utc>) {
    while log.front().is_some_and(|oldest| *oldest <= cutoff) {
        log.pop_front();
    }
}

impl Sweep for SlidingWindowLimiter {
    fn sweep(&self) -> usize {
        let cutoff = before(self.clock.now(), self.window);
        let before_len = self.logs.len();
        self.logs.retain(|_, log| {
            prune(log, cutoff);
            !log.is_empty()
        });
        before_len.saturating_sub(self.logs.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn limiter(max: u64, window_secs: u64) -> (SlidingWindowLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_now());
        let limiter =
            SlidingWindowLimiter::with_clock(max, Duration::from_secs(window_secs), clock.clone())
                .unwrap();
        (limiter, clock)
    }

    #[test]
    fn test_rejects_zero_limits() {
        assert!(SlidingWindowLimiter::new(0, Duration::from_secs(1)).is_err());
        assert!(SlidingWindowLimiter::new(1, Duration::ZERO).is_err());
    }

    #[test]
    fn test_allows_up_to_max() {
        let (limiter, _) = limiter(3, 10);

        for expected_remaining in [2, 1, 0] {
            let decision = limiter.check_request("u1");
            assert!(decision.allowed);
            assert_eq!(decision.info.remaining, expected_remaining);
        }
        let denied = limiter.check_request("u1");
        assert!(!denied.allowed);
        assert_eq!(denied.info.remaining, 0);
    }

    #[test]
    fn test_oldest_entries_age_out() {
        let (limiter, clock) = limiter(3, 10);
        let start = clock.now();

        // Requests at t, t+1, t+2
        for _ in 0..3 {
            assert!(limiter.check_request("u1").allowed);
            clock.advance(Duration::from_secs(1));
        }
        assert!(!limiter.check_request("u1").allowed);

        // t + window + 1: the requests at t and t+1 have aged out
        clock.set(start + chrono::Duration::seconds(11));
        let decision = limiter.check_request("u1");
        assert!(decision.allowed);
        assert_eq!(decision.info.total_hits, 2);
        assert_eq!(decision.info.reset_at, start + chrono::Duration::seconds(12));
    }

    #[test]
    fn test_rejected_requests_are_not_logged() {
        let (limiter, clock) = limiter(2, 10);

        limiter.check_request("u1");
        limiter.check_request("u1");
        for _ in 0..50 {
            assert!(!limiter.check_request("u1").allowed);
        }
        assert_eq!(limiter.in_window("u1"), 2);

        clock.advance(Duration::from_secs(10));
        assert!(limiter.check_request("u1").allowed);
    }

    #[test]
    fn test_reset_time_tracks_oldest_entry() {
        let (limiter, clock) = limiter(5, 10);
        let start = clock.now();

        let first = limiter.check_request("u1");
        assert_eq!(first.info.reset_at, start + chrono::Duration::seconds(10));

        clock.advance(Duration::from_secs(4));
        let second = limiter.check_request("u1");
        assert_eq!(second.info.reset_at, start + chrono::Duration::seconds(10));
        assert_eq!(second.info.ms_until_reset, 6_000);
    }

    #[test]
    fn test_identifiers_are_independent() {
        let (limiter, _) = limiter(1, 10);

        assert!(limiter.check_request("a").allowed);
        assert!(limiter.check_request("b").allowed);
        assert!(!limiter.check_request("a").allowed);
    }

    #[test]
    fn test_reset_clears_log() {
        let (limiter, _) = limiter(1, 10);

        limiter.check_request("a");
        limiter.reset("a");
        assert!(limiter.check_request("a").allowed);
    }

    #[test]
    fn test_sweep_drops_idle_keys() {
        let (limiter, clock) = limiter(5, 10);

        limiter.check_request("idle");
        clock.advance(Duration::from_secs(6));
        limiter.check_request("busy");
        clock.advance(Duration::from_secs(5));

        assert_eq!(limiter.sweep(), 1);
        assert_eq!(limiter.tracked_keys(), 1);
        assert_eq!(limiter.in_window("busy"), 1);
    }

    #[test]
    fn test_identifier_taken_verbatim() {
        let (limiter, _) = limiter(1, 10);

        assert!(limiter.check_request("user 1").allowed);
        assert!(!limiter.check_request("user 1").allowed);
        assert!(limiter.check_request("user\t1").allowed);
        assert!(limiter.check_request("").allowed);
        assert_eq!(limiter.tracked_keys(), 3);
        assert_eq!(limiter.in_window("user 1"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_sweep_drops_idle_logs() {
        let clock = Arc::new(ManualClock::starting_now());
        let limiter = Arc::new(
            SlidingWindowLimiter::with_clock(5, Duration::from_secs(10), clock.clone()).unwrap(),
        );
        let task = crate::sweeper::spawn(Arc::downgrade(&limiter), Duration::from_secs(30));

        limiter.check_request("idle");
        clock.advance(Duration::from_secs(25));
        limiter.check_request("busy");
        clock.advance(Duration::from_secs(6));

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(limiter.tracked_keys(), 1);
        assert_eq!(limiter.in_window("busy"), 1);

        drop(limiter);
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(task.is_finished());
    }
}
