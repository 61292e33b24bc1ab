//! Fixed-window rate limiter over a counter store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, trace, warn};

use super::decision::{RateLimitDecision, RateLimitInfo};
use super::events::{LimitEvent, LimitEvents, DEFAULT_EVENT_CAPACITY};
use super::key::StorageKey;
use super::rules::{FailPolicy, LimitConfig};
use crate::clock::{Clock, SystemClock};
use crate::error::{RateKeeperError, Result};
use crate::store::CounterStore;

/// Store timeout applied when none is configured.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(250);

/// Decides whether operations under named limits may proceed.
///
/// Limits are fixed at construction; many limits may share one store since
/// their key strategies keep storage keys apart. This struct is thread-safe
/// and can be shared across tasks.
pub struct RateLimiter {
    limits: HashMap<String, Arc<LimitConfig>>,
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    events: LimitEvents,
    store_timeout: Duration,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("limits", &self.limits.keys().collect::<Vec<_>>())
            .field("store_timeout", &self.store_timeout)
            .finish()
    }
}

/// Builder for [`RateLimiter`].
pub struct RateLimiterBuilder {
    limits: Vec<LimitConfig>,
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    event_capacity: usize,
    store_timeout: Duration,
}

impl RateLimiterBuilder {
    /// Register a named limit.
    pub fn limit(mut self, limit: LimitConfig) -> Self {
        self.limits.push(limit);
        self
    }

    /// Register several named limits.
    pub fn limits(mut self, limits: impl IntoIterator<Item = LimitConfig>) -> Self {
        self.limits.extend(limits);
        self
    }

    /// Clock used for decision metadata. Should match the store's clock.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Default bound on a store round trip for [`RateLimiter::check_limit`].
    pub fn store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    pub fn build(self) -> Result<RateLimiter> {
        let mut limits = HashMap::with_capacity(self.limits.len());
        for limit in self.limits {
            limit.validate()?;
            if limits.contains_key(&limit.name) {
                return Err(RateKeeperError::Config(format!(
                    "duplicate limit name '{}'",
                    limit.name
                )));
            }
            limits.insert(limit.name.clone(), Arc::new(limit));
        }

        Ok(RateLimiter {
            limits,
            store: self.store,
            clock: self.clock,
            events: LimitEvents::new(self.event_capacity),
            store_timeout: self.store_timeout,
        })
    }
}

impl RateLimiter {
    /// Start building a limiter over `store`.
    pub fn builder(store: Arc<dyn CounterStore>) -> RateLimiterBuilder {
        RateLimiterBuilder {
            limits: Vec::new(),
            store,
            clock: Arc::new(SystemClock),
            event_capacity: DEFAULT_EVENT_CAPACITY,
            store_timeout: DEFAULT_STORE_TIMEOUT,
        }
    }

    /// Register one hit for `identifier` under `limit_name` and decide.
    ///
    /// The Nth request within a window of a limit allowing N is permitted;
    /// the (N+1)th is denied and reports zero remaining.
    pub async fn check_limit(&self, limit_name: &str, identifier: &str) -> Result<RateLimitDecision> {
        self.check_limit_with_timeout(limit_name, identifier, self.store_timeout)
            .await
    }

    /// Like [`check_limit`](Self::check_limit) with a caller-supplied bound on the store round trip.
    ///
    /// An elapsed timeout counts as the store being unavailable and is
    /// resolved by the limit's [`FailPolicy`].
    pub async fn check_limit_with_timeout(
        &self,
        limit_name: &str,
        identifier: &str,
        timeout: Duration,
    ) -> Result<RateLimitDecision> {
        let limit = self.limit_config(limit_name)?;
        let key = limit.storage_key(identifier)?;

        trace!(limit = %limit_name, key = %key, "Checking rate limit");

        let outcome = match tokio::time::timeout(timeout, self.store.increment(&key, limit.window)).await {
            Ok(result) => result,
            Err(_) => Err(RateKeeperError::StoreUnavailable(format!(
                "store did not answer within {:?}",
                timeout
            ))),
        };

        let record = match outcome {
            Ok(record) => record,
            Err(RateKeeperError::StoreUnavailable(reason)) => {
                return self.on_store_unavailable(&limit, &key, reason);
            }
            Err(e) => return Err(e),
        };

        let now = self.clock.now();
        let mut info = RateLimitInfo::from_record(&record, limit.max_requests, now);
        let allowed = record.hit_count <= limit.max_requests;

        if !allowed {
            info.remaining = 0;
            debug!(
                limit = %limit_name,
                key = %key,
                hits = record.hit_count,
                max_requests = limit.max_requests,
                "Rate limit exceeded"
            );
            if limit.report_limit_reached {
                self.events.publish(LimitEvent {
                    limit: limit.name.clone(),
                    identifier: identifier.to_string(),
                    key: key.to_string(),
                    message: limit.message.clone(),
                    info,
                });
            }
        }

        Ok(RateLimitDecision {
            allowed,
            info,
            degraded: false,
        })
    }

    fn on_store_unavailable(
        &self,
        limit: &LimitConfig,
        key: &StorageKey,
        reason: String,
    ) -> Result<RateLimitDecision> {
        let now = self.clock.now();
        match limit.fail_policy {
            FailPolicy::Open => {
                warn!(limit = %limit.name, key = %key, reason = %reason, "Counter store unavailable, failing open");
                Ok(RateLimitDecision {
                    allowed: true,
                    info: RateLimitInfo::unobserved(limit.max_requests, limit.max_requests, now, limit.window),
                    degraded: true,
                })
            }
            FailPolicy::Closed => {
                warn!(limit = %limit.name, key = %key, reason = %reason, "Counter store unavailable, failing closed");
                Ok(RateLimitDecision {
                    allowed: false,
                    info: RateLimitInfo::unobserved(limit.max_requests, 0, now, limit.window),
                    degraded: true,
                })
            }
            FailPolicy::Propagate => Err(RateKeeperError::StoreUnavailable(reason)),
        }
    }

    /// Current usage for `identifier` without registering a hit.
    ///
    /// Returns `None` when the identifier has no live window.
    pub async fn peek(&self, limit_name: &str, identifier: &str) -> Result<Option<RateLimitInfo>> {
        let limit = self.limit_config(limit_name)?;
        let key = limit.storage_key(identifier)?;
        let record = self.store.get(&key).await?;
        let now = self.clock.now();
        Ok(record.map(|r| RateLimitInfo::from_record(&r, limit.max_requests, now)))
    }

    /// Forget everything recorded for `identifier` under `limit_name`.
    ///
    /// Used for manual overrides such as unblocking a user.
    pub async fn reset(&self, limit_name: &str, identifier: &str) -> Result<()> {
        let limit = self.limit_config(limit_name)?;
        let key = limit.storage_key(identifier)?;
        self.store.reset(&key).await?;
        debug!(limit = %limit_name, key = %key, "Rate limit reset");
        Ok(())
    }

    /// Configuration of a named limit.
    pub fn limit(&self, limit_name: &str) -> Option<&LimitConfig> {
        self.limits.get(limit_name).map(|l| l.as_ref())
    }

    /// Names of all configured limits, sorted.
    pub fn limit_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.limits.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Subscribe to limit-reached events.
    pub fn subscribe(&self) -> broadcast::Receiver<LimitEvent> {
        self.events.subscribe()
    }

    /// Limit-reached events as a stream.
    pub fn events(&self) -> BroadcastStream<LimitEvent> {
        self.events.stream()
    }

    fn limit_config(&self, limit_name: &str) -> Result<Arc<LimitConfig>> {
        self.limits
            .get(limit_name)
            .cloned()
            .ok_or_else(|| RateKeeperError::UnknownLimit(limit_name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ratelimit::UsageRecord;
    use crate::store::LocalStore;
    use async_trait::async_trait;
    use tokio_test::assert_ok;

    fn limiter_with(limits: Vec<LimitConfig>) -> (RateLimiter, Arc<ManualClock>, Arc<LocalStore>) {
        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(LocalStore::with_clock(1000, clock.clone()).unwrap());
        let limiter = RateLimiter::builder(store.clone())
            .limits(limits)
            .clock(clock.clone())
            .build()
            .unwrap();
        (limiter, clock, store)
    }

    /// A store that is always down.
    struct DownStore;

    #[async_trait]
    impl CounterStore for DownStore {
        async fn increment(&self, _: &StorageKey, _: Duration) -> Result<UsageRecord> {
            Err(RateKeeperError::StoreUnavailable("connection refused".into()))
        }

        async fn get(&self, _: &StorageKey) -> Result<Option<UsageRecord>> {
            Err(RateKeeperError::StoreUnavailable("connection refused".into()))
        }

        async fn reset(&self, _: &StorageKey) -> Result<()> {
            Err(RateKeeperError::StoreUnavailable("connection refused".into()))
        }
    }

    /// A store that never answers.
    struct HangingStore;

    #[async_trait]
    impl CounterStore for HangingStore {
        async fn increment(&self, _: &StorageKey, _: Duration) -> Result<UsageRecord> {
            std::future::pending().await
        }

        async fn get(&self, _: &StorageKey) -> Result<Option<UsageRecord>> {
            std::future::pending().await
        }

        async fn reset(&self, _: &StorageKey) -> Result<()> {
            Ok(())
        }
    }

    fn limiter_over(store: Arc<dyn CounterStore>, policy: FailPolicy) -> RateLimiter {
        RateLimiter::builder(store)
            .limit(LimitConfig::new("api", 10, Duration::from_secs(60)).with_fail_policy(policy))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_allows_up_to_max_then_denies() {
        let (limiter, _, _) = limiter_with(vec![LimitConfig::new("api", 3, Duration::from_secs(60))]);

        for expected_remaining in [2, 1, 0] {
            let decision = limiter.check_limit("api", "u1").await.unwrap();
            assert!(decision.allowed);
            assert_eq!(decision.info.remaining, expected_remaining);
        }

        for hits in 4..=6 {
            let decision = limiter.check_limit("api", "u1").await.unwrap();
            assert!(!decision.allowed);
            assert_eq!(decision.info.remaining, 0);
            assert_eq!(decision.info.total_hits, hits);
        }
    }

    #[tokio::test]
    async fn test_window_rollover_allows_again() {
        let (limiter, clock, _) = limiter_with(vec![LimitConfig::new("api", 2, Duration::from_secs(60))]);

        for _ in 0..5 {
            assert_ok!(limiter.check_limit("api", "u1").await);
        }
        clock.advance(Duration::from_secs(60));

        let decision = limiter.check_limit("api", "u1").await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.info.total_hits, 1);
        assert_eq!(decision.info.remaining, 1);
    }

    #[tokio::test]
    async fn test_decision_reports_reset_time() {
        let (limiter, clock, _) = limiter_with(vec![LimitConfig::new("api", 2, Duration::from_secs(60))]);
        let start = clock.now();

        limiter.check_limit("api", "u1").await.unwrap();
        clock.advance(Duration::from_secs(20));
        let decision = limiter.check_limit("api", "u1").await.unwrap();

        assert_eq!(decision.info.reset_at, start + chrono::Duration::seconds(60));
        assert_eq!(decision.info.ms_until_reset, 40_000);
        assert_eq!(decision.retry_after(), None);
    }

    #[tokio::test]
    async fn test_unknown_limit_is_configuration_error() {
        let (limiter, _, _) = limiter_with(vec![]);

        let err = limiter.check_limit("missing", "u1").await.unwrap_err();
        assert!(matches!(err, RateKeeperError::UnknownLimit(ref name) if name == "missing"));
        assert!(err.is_configuration_error());
    }

    #[tokio::test]
    async fn test_invalid_key_is_rejected() {
        let (limiter, _, _) = limiter_with(vec![
            LimitConfig::new("api", 2, Duration::from_secs(60)).with_key_fn(|_| String::new()),
        ]);

        let err = limiter.check_limit("api", "u1").await.unwrap_err();
        assert!(matches!(err, RateKeeperError::InvalidKey { .. }));
    }

    #[tokio::test]
    async fn test_limits_sharing_a_store_are_independent() {
        let (limiter, _, store) = limiter_with(vec![
            LimitConfig::new("auth", 1, Duration::from_secs(60)),
            LimitConfig::new("api", 1, Duration::from_secs(60)),
        ]);

        assert!(limiter.check_limit("auth", "u1").await.unwrap().allowed);
        assert!(limiter.check_limit("api", "u1").await.unwrap().allowed);
        assert!(!limiter.check_limit("auth", "u1").await.unwrap().allowed);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_reset_unblocks() {
        let (limiter, _, _) = limiter_with(vec![LimitConfig::new("api", 1, Duration::from_secs(60))]);

        limiter.check_limit("api", "u1").await.unwrap();
        assert!(!limiter.check_limit("api", "u1").await.unwrap().allowed);

        limiter.reset("api", "u1").await.unwrap();
        assert!(limiter.check_limit("api", "u1").await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_peek_does_not_count() {
        let (limiter, _, _) = limiter_with(vec![LimitConfig::new("api", 5, Duration::from_secs(60))]);

        assert_eq!(limiter.peek("api", "u1").await.unwrap(), None);
        limiter.check_limit("api", "u1").await.unwrap();

        let info = limiter.peek("api", "u1").await.unwrap().unwrap();
        assert_eq!(info.total_hits, 1);
        let info = limiter.peek("api", "u1").await.unwrap().unwrap();
        assert_eq!(info.total_hits, 1);
        assert_eq!(info.remaining, 4);
    }

    #[tokio::test]
    async fn test_denial_publishes_event() {
        let (limiter, _, _) = limiter_with(vec![
            LimitConfig::new("auth", 1, Duration::from_secs(60)).with_message("Slow down"),
        ]);
        let mut rx = limiter.subscribe();

        limiter.check_limit("auth", "ip:1.2.3.4").await.unwrap();
        assert!(rx.try_recv().is_err());

        limiter.check_limit("auth", "ip:1.2.3.4").await.unwrap();
        let event = rx.try_recv().unwrap();
        assert_eq!(event.limit, "auth");
        assert_eq!(event.identifier, "ip:1.2.3.4");
        assert_eq!(event.key, "auth:ip:1.2.3.4");
        assert_eq!(event.message, "Slow down");
        assert_eq!(event.info.remaining, 0);
    }

    #[tokio::test]
    async fn test_silent_limit_publishes_nothing() {
        let (limiter, _, _) = limiter_with(vec![
            LimitConfig::new("auth", 1, Duration::from_secs(60)).report_limit_reached(false),
        ]);
        let mut rx = limiter.subscribe();

        limiter.check_limit("auth", "u1").await.unwrap();
        assert!(!limiter.check_limit("auth", "u1").await.unwrap().allowed);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_store_outage_fails_open_by_default() {
        let limiter = limiter_over(Arc::new(DownStore), FailPolicy::Open);

        let decision = limiter.check_limit("api", "u1").await.unwrap();
        assert!(decision.allowed);
        assert!(decision.degraded);
        assert_eq!(decision.info.remaining, 10);
    }

    #[tokio::test]
    async fn test_store_outage_fail_closed() {
        let limiter = limiter_over(Arc::new(DownStore), FailPolicy::Closed);

        let decision = limiter.check_limit("api", "u1").await.unwrap();
        assert!(!decision.allowed);
        assert!(decision.degraded);
        assert_eq!(decision.retry_after(), Some(Duration::from_secs(60)));
    }

    #[tokio::test]
    async fn test_store_outage_propagated() {
        let limiter = limiter_over(Arc::new(DownStore), FailPolicy::Propagate);

        let err = limiter.check_limit("api", "u1").await.unwrap_err();
        assert!(matches!(err, RateKeeperError::StoreUnavailable(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_goes_through_fail_policy() {
        let open = limiter_over(Arc::new(HangingStore), FailPolicy::Open);
        let decision = open
            .check_limit_with_timeout("api", "u1", Duration::from_millis(10))
            .await
            .unwrap();
        assert!(decision.allowed && decision.degraded);

        let propagate = limiter_over(Arc::new(HangingStore), FailPolicy::Propagate);
        let err = propagate.check_limit("api", "u1").await.unwrap_err();
        assert!(matches!(err, RateKeeperError::StoreUnavailable(_)));
    }

    #[test]
    fn test_builder_rejects_duplicates() {
        let store = Arc::new(LocalStore::new(10).unwrap());
        let result = RateLimiter::builder(store)
            .limit(LimitConfig::new("api", 1, Duration::from_secs(1)))
            .limit(LimitConfig::new("api", 2, Duration::from_secs(1)))
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_limit_names_sorted() {
        let (limiter, _, _) = limiter_with(vec![
            LimitConfig::new("upload", 1, Duration::from_secs(1)),
            LimitConfig::new("auth", 1, Duration::from_secs(1)),
        ]);
        assert_eq!(limiter.limit_names(), vec!["auth", "upload"]);
        assert_eq!(limiter.limit("auth").unwrap().max_requests, 1);
    }
}
