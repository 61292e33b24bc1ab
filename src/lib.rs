//! Ratekeeper - Request Rate Limiting Engine
//!
//! This crate decides, for a named limit and a caller identity, whether a new
//! operation may proceed and how much budget remains. Counters live either in
//! a bounded in-process store or in a shared cache updated through atomic
//! server-side transactions, so any number of nodes can enforce one limit.
//! Sliding-window, load-adaptive and lightweight approximate limiters cover
//! the remaining strategies.

pub mod clock;
pub mod config;
pub mod error;
pub mod ratelimit;
pub mod service;
pub mod store;
pub mod sweeper;

pub use error::{RateKeeperError, Result};
pub use ratelimit::{LimitConfig, RateLimitDecision, RateLimitInfo, RateLimiter};
pub use service::RateKeeper;
