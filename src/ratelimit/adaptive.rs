//! Load-adaptive limits.
//!
//! Each tracked identifier has a base limit; the effective limit is the base
//! scaled by a step function of the most recent system load sample. Effective
//! limits are recomputed when load is resampled, so reading one is a map lookup.

use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

use crate::sweeper::{BackgroundTask, MIN_PERIOD};

/// Default interval between load samples.
pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_secs(5);

/// External source of system utilization in `[0, 1]`.
pub trait LoadSource: Send + Sync {
    fn sample(&self) -> f64;
}

impl<F> LoadSource for F
where
    F: Fn() -> f64 + Send + Sync,
{
    fn sample(&self) -> f64 {
        self()
    }
}

/// Capacity multiplier for a load sample, in percent.
///
/// Monotonically non-increasing in load: idle systems get 120%, saturated
/// ones 40%.
pub fn multiplier_percent(load: f64) -> u64 {
    if load < 0.3 {
        120
    } else if load < 0.6 {
        100
    } else if load < 0.8 {
        70
    } else {
        40
    }
}

/// Scales per-identifier base limits by current system load.
#[derive(Debug, Default)]
pub struct AdaptiveLimiter {
    base_limits: DashMap<String, u64>,
    current_limits: DashMap<String, u64>,
    load: RwLock<f64>,
}

impl AdaptiveLimiter {
    /// Create a limiter assuming an idle system until the first sample.
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `identifier` with `base` as its unscaled limit.
    pub fn set_base_limit(&self, identifier: impl Into<String>, base: u64) {
        let identifier = identifier.into();
        // Holding the read lock keeps a concurrent resample from missing this entry
        let load = self.load.read();
        self.current_limits
            .insert(identifier.clone(), scale(base, *load));
        self.base_limits.insert(identifier, base);
    }

    /// Stop tracking `identifier`.
    pub fn remove(&self, identifier: &str) {
        let _load = self.load.read();
        self.base_limits.remove(identifier);
        self.current_limits.remove(identifier);
    }

    pub fn base_limit(&self, identifier: &str) -> Option<u64> {
        self.base_limits.get(identifier).map(|b| *b)
    }

    /// Effective limit for `identifier` under the last load sample.
    pub fn current_limit(&self, identifier: &str) -> Option<u64> {
        self.current_limits.get(identifier).map(|c| *c)
    }

    /// The last accepted load sample.
    pub fn system_load(&self) -> f64 {
        *self.load.read()
    }

    /// Accept a load sample and rescale every tracked limit.
    ///
    /// Samples are clamped to `[0, 1]`; NaN samples are discarded.
    pub fn record_load(&self, sample: f64) {
        if sample.is_nan() {
            warn!("Discarding NaN system load sample");
            return;
        }
        let sample = sample.clamp(0.0, 1.0);

        let mut load = self.load.write();
        let previous = multiplier_percent(*load);
        *load = sample;

        for entry in self.base_limits.iter() {
            self.current_limits
                .insert(entry.key().clone(), scale(*entry.value(), sample));
        }

        let multiplier = multiplier_percent(sample);
        if multiplier != previous {
            debug!(load = sample, multiplier_percent = multiplier, "Adaptive limits rescaled");
        } else {
            trace!(load = sample, "System load sampled");
        }
    }

    /// Resample `source` every `period` until the limiter is dropped.
    pub fn spawn_sampler(self: &Arc<Self>, source: Arc<dyn LoadSource>, period: Duration) -> BackgroundTask {
        let limiter: Weak<Self> = Arc::downgrade(self);
        let period = period.max(MIN_PERIOD);

        BackgroundTask::new(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now(), period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                let Some(limiter) = limiter.upgrade() else {
                    break;
                };
                limiter.record_load(source.sample());
            }
        }))
    }
}

fn scale(base: u64, load: f64) -> u64 {
    let scaled = u128::from(base) * u128::from(multiplier_percent(load)) / 100;
    u64::try_from(scaled).unwrap_or(u64::MAX)
}
