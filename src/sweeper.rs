//! Periodic background sweeping of expired state.

use std::sync::Weak;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, trace};

/// Default interval between sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Shortest period a background task may run at.
pub(crate) const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Something holding expirable entries.
pub trait Sweep: Send + Sync + 'static {
    /// Drop every expired entry, returning how many were removed.
    fn sweep(&self) -> usize;
}

/// Handle to a periodic background task. The task stops when the handle is dropped.
#[derive(Debug)]
pub struct BackgroundTask {
    task: JoinHandle<()>,
}

impl BackgroundTask {
    pub(crate) fn new(task: JoinHandle<()>) -> Self {
        Self { task }
    }

    /// Stop the task.
    pub fn abort(&self) {
        self.task.abort();
    }

    /// Whether the task has exited, either aborted or because its target was dropped.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for BackgroundTask {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Sweep `target` every `period` until it is dropped.
///
/// Only a weak reference is held so the task never keeps the target alive.
/// Must be called from within a tokio runtime.
pub fn spawn<T: Sweep>(target: Weak<T>, period: Duration) -> BackgroundTask {
    let period = period.max(MIN_PERIOD);
    let task = tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let Some(target) = target.upgrade() else {
                trace!("Sweep target dropped, stopping");
                break;
            };
            let removed = target.sweep();
            if removed > 0 {
                debug!(removed = removed, "Swept expired entries");
            }
        }
    });
    BackgroundTask::new(task)
}
