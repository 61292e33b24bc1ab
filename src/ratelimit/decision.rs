//! Decision snapshots returned to callers.
//!
//! A decision is a value copy: it never references store state and is safe to
//! retain, log, or hand to an HTTP boundary layer.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::counter::UsageRecord;
use crate::clock::{after, until};

/// Header carrying the limit ceiling.
pub const HEADER_LIMIT: &str = "X-RateLimit-Limit";
/// Header carrying the remaining quota.
pub const HEADER_REMAINING: &str = "X-RateLimit-Remaining";
/// Header carrying the window reset time in epoch seconds.
pub const HEADER_RESET: &str = "X-RateLimit-Reset";
/// Header carrying the retry delay in seconds on denial.
pub const HEADER_RETRY_AFTER: &str = "Retry-After";

/// Usage metadata for one check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitInfo {
    /// Configured ceiling for the window
    pub limit: u64,
    /// Requests observed in the current window, including this one
    pub total_hits: u64,
    /// Requests still allowed in the current window
    pub remaining: u64,
    /// When the current window resets
    pub reset_at: DateTime<Utc>,
    /// Milliseconds from the check until `reset_at`
    pub ms_until_reset: u64,
}

impl RateLimitInfo {
    /// Build the snapshot for a usage record observed at `now`.
    pub fn from_record(record: &UsageRecord, limit: u64, now: DateTime<Utc>) -> Self {
        Self {
            limit,
            total_hits: record.hit_count,
            remaining: record.remaining(limit),
            reset_at: record.reset_at,
            ms_until_reset: millis(record.until_reset(now)),
        }
    }

    /// Snapshot for a check that never reached the store.
    pub(crate) fn unobserved(limit: u64, remaining: u64, now: DateTime<Utc>, window: Duration) -> Self {
        Self {
            limit,
            total_hits: 0,
            remaining,
            reset_at: after(now, window),
            ms_until_reset: millis(window),
        }
    }

    /// Reset time as Unix epoch seconds.
    pub fn reset_epoch_secs(&self) -> i64 {
        self.reset_at.timestamp()
    }
}

/// Outcome of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitDecision {
    /// Whether the operation may proceed
    pub allowed: bool,
    /// Usage metadata
    pub info: RateLimitInfo,
    /// Set when the store could not be consulted and the fail policy decided
    pub degraded: bool,
}

impl RateLimitDecision {
    /// How long a denied caller should wait before retrying.
    ///
    /// Rounded up to whole seconds with a one second floor; `None` when allowed.
    pub fn retry_after(&self) -> Option<Duration> {
        if self.allowed {
            return None;
        }
        let secs = self.info.ms_until_reset.div_ceil(1000).max(1);
        Some(Duration::from_secs(secs))
    }

    /// Response headers an HTTP layer should attach for this decision.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            (HEADER_LIMIT, self.info.limit.to_string()),
            (HEADER_REMAINING, self.info.remaining.to_string()),
            (HEADER_RESET, self.info.reset_epoch_secs().to_string()),
        ];
        if let Some(retry_after) = self.retry_after() {
            headers.push((HEADER_RETRY_AFTER, retry_after.as_secs().to_string()));
        }
        headers
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

pub(crate) fn ms_between(now: DateTime<Utc>, deadline: DateTime<Utc>) -> u64 {
    millis(until(now, deadline))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn decision(allowed: bool, ms_until_reset: u64) -> RateLimitDecision {
        let reset_at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 15, 0).unwrap();
        RateLimitDecision {
            allowed,
            info: RateLimitInfo {
                limit: 5,
                total_hits: if allowed { 3 } else { 6 },
                remaining: if allowed { 2 } else { 0 },
                reset_at,
                ms_until_reset,
            },
            degraded: false,
        }
    }

    #[test]
    fn test_from_record() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut record = UsageRecord::first_hit(now, Duration::from_secs(900));
        record.hit_count = 4;

        let info = RateLimitInfo::from_record(&record, 5, now + chrono::Duration::seconds(100));
        assert_eq!(info.total_hits, 4);
        assert_eq!(info.remaining, 1);
        assert_eq!(info.ms_until_reset, 800_000);
    }

    #[test]
    fn test_retry_after_only_on_denial() {
        assert_eq!(decision(true, 4_200).retry_after(), None);
        assert_eq!(decision(false, 4_200).retry_after(), Some(Duration::from_secs(5)));
        assert_eq!(decision(false, 0).retry_after(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_headers_allowed() {
        let headers = decision(true, 1_000).headers();

        assert_eq!(headers.len(), 3);
        assert_eq!(headers[0], (HEADER_LIMIT, "5".to_string()));
        assert_eq!(headers[1], (HEADER_REMAINING, "2".to_string()));
        assert_eq!(headers[2], (HEADER_RESET, "1704068100".to_string()));
    }

    #[test]
    fn test_headers_denied_include_retry_after() {
        let headers = decision(false, 61_500).headers();

        assert_eq!(headers.len(), 4);
        assert_eq!(headers[1], (HEADER_REMAINING, "0".to_string()));
        assert_eq!(headers[3], (HEADER_RETRY_AFTER, "62".to_string()));
    }
}
