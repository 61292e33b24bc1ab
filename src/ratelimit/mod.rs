//! Rate limiting logic and state management.

mod adaptive;
mod approximate;
mod counter;
mod decision;
mod events;
mod key;
mod limiter;
mod rules;
mod sliding;

pub use adaptive::{multiplier_percent, AdaptiveLimiter, LoadSource, DEFAULT_SAMPLE_INTERVAL};
pub use approximate::{ActionRule, ApproximateLimiter};
pub use counter::UsageRecord;
pub use decision::{
    RateLimitDecision, RateLimitInfo, HEADER_LIMIT, HEADER_REMAINING, HEADER_RESET,
    HEADER_RETRY_AFTER,
};
pub use events::{LimitEvent, LimitEvents};
pub use key::{KeyFn, KeyStrategy, StorageKey, MAX_KEY_LEN};
pub use limiter::{RateLimiter, RateLimiterBuilder, DEFAULT_STORE_TIMEOUT};
pub use rules::{FailPolicy, LimitConfig, LimitDefinition, LimitRules, TimeUnit, DEFAULT_MESSAGE};
pub use sliding::SlidingWindowLimiter;
