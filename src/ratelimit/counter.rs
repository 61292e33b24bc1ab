//! Per-key usage counters.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::{after, until};

/// Usage observed for one storage key within its current window.
///
/// Records are owned by the store that produced them; callers only ever see
/// copies. A record whose `reset_at` has passed is logically absent and must
/// never be read literally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    /// Requests observed in the current window
    pub hit_count: u64,
    /// When the current window started
    pub window_start: DateTime<Utc>,
    /// When the current window resets
    pub reset_at: DateTime<Utc>,
}

impl UsageRecord {
    /// Start a fresh window at `now` holding a single hit.
    pub fn first_hit(now: DateTime<Utc>, window: Duration) -> Self {
        Self {
            hit_count: 1,
            window_start: now,
            reset_at: after(now, window),
        }
    }

    /// Whether the window this record belongs to has rolled over.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.reset_at
    }

    /// Register one more hit, starting a fresh window if this one has expired.
    pub fn hit(&mut self, now: DateTime<Utc>, window: Duration) {
        if self.is_expired(now) {
            *self = Self::first_hit(now, window);
        } else {
            self.hit_count = self.hit_count.saturating_add(1);
        }
    }

    /// Remaining quota under `max_requests`.
    pub fn remaining(&self, max_requests: u64) -> u64 {
        max_requests.saturating_sub(self.hit_count)
    }

    /// Time left until the window resets.
    pub fn until_reset(&self, now: DateTime<Utc>) -> Duration {
        until(now, self.reset_at)
    }
}
