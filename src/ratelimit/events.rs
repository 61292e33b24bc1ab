//! Limit-reached events.
//!
//! Denials are published on a broadcast channel instead of running inline
//! hooks, so alerting and audit logging stay decoupled from the check path.

use serde::Serialize;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::trace;

use super::decision::RateLimitInfo;

/// Default number of events buffered for slow subscribers.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Emitted whenever a check is denied on a limit that reports denials.
#[derive(Debug, Clone, Serialize)]
pub struct LimitEvent {
    /// Name of the limit that was exceeded
    pub limit: String,
    /// Caller identity as supplied to the check
    pub identifier: String,
    /// Storage key the check resolved to
    pub key: String,
    /// Human readable message configured on the limit
    pub message: String,
    /// Usage at the time of denial
    pub info: RateLimitInfo,
}

/// Fan-out point for [`LimitEvent`]s.
#[derive(Debug, Clone)]
pub struct LimitEvents {
    sender: broadcast::Sender<LimitEvent>,
}

impl LimitEvents {
    /// Create a bus buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event. Never blocks; events are dropped when nobody listens.
    pub fn publish(&self, event: LimitEvent) {
        if self.sender.send(event).is_err() {
            trace!("No limit event subscribers");
        }
    }

    /// Subscribe to events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<LimitEvent> {
        self.sender.subscribe()
    }

    /// Subscribe as a stream. Lagging subscribers observe a `Lagged` error item.
    pub fn stream(&self) -> BroadcastStream<LimitEvent> {
        BroadcastStream::new(self.sender.subscribe())
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for LimitEvents {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
