//! Lightweight, non-authoritative throttling for co-located callers.
//!
//! Suitable for hints such as disabling a UI button; never for enforcement.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::clock::{after, Clock, SystemClock};

/// Per-action allowance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionRule {
    pub max_requests: u32,
    pub window: Duration,
}

impl ActionRule {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
        }
    }
}

impl Default for ActionRule {
    fn default() -> Self {
        Self::new(10, Duration::from_secs(60))
    }
}

#[derive(Debug)]
struct ActionWindow {
    count: u32,
    reset_at: DateTime<Utc>,
}

/// One fixed window per action name, kept in process memory.
#[derive(Debug)]
pub struct ApproximateLimiter {
    rules: HashMap<String, ActionRule>,
    default_rule: ActionRule,
    windows: Mutex<HashMap<String, ActionWindow>>,
    clock: Arc<dyn Clock>,
}

impl ApproximateLimiter {
    pub fn new(default_rule: ActionRule) -> Self {
        Self::with_clock(default_rule, Arc::new(SystemClock))
    }

    pub fn with_clock(default_rule: ActionRule, clock: Arc<dyn Clock>) -> Self {
        Self {
            rules: HashMap::new(),
            default_rule,
            windows: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Use `rule` for `action` instead of the default.
    pub fn with_rule(mut self, action: impl Into<String>, rule: ActionRule) -> Self {
        self.rules.insert(action.into(), rule);
        self
    }

    fn rule(&self, action: &str) -> ActionRule {
        self.rules.get(action).copied().unwrap_or(self.default_rule)
    }

    /// Count an attempt at `action`, returning whether it may go ahead.
    pub fn check(&self, action: &str) -> bool {
        let rule = self.rule(action);
        let now = self.clock.now();
        let mut windows = self.windows.lock();

        let window = windows
            .entry(action.to_string())
            .or_insert_with(|| ActionWindow {
                count: 0,
                reset_at: after(now, rule.window),
            });
        if now >= window.reset_at {
            window.count = 0;
            window.reset_at = after(now, rule.window);
        }

        if window.count < rule.max_requests {
            window.count += 1;
            true
        } else {
            false
        }
    }

    /// Attempts `action` may still make in its current window.
    pub fn remaining(&self, action: &str) -> u32 {
        let rule = self.rule(action);
        let now = self.clock.now();
        match self.windows.lock().get(action) {
            Some(window) if now < window.reset_at => rule.max_requests.saturating_sub(window.count),
            _ => rule.max_requests,
        }
    }

    /// Forget every window.
    pub fn clear(&self) {
        self.windows.lock().clear();
    }
}

impl Default for ApproximateLimiter {
    fn default() -> Self {
        Self::new(ActionRule::default())
    }
}
