//! The assembled rate limiting service.
//!
//! [`RateKeeper`] is constructed explicitly from configuration and handed to
//! whatever needs it; there is no process-wide limiter instance.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::clock::{Clock, SystemClock};
use crate::config::{RateKeeperConfig, StoreBackend};
use crate::error::{RateKeeperError, Result};
use crate::ratelimit::{AdaptiveLimiter, LoadSource, RateLimitDecision, RateLimiter};
use crate::store::{CounterStore, DistributedStore, LocalStore, RedisCache};
use crate::sweeper::{self, BackgroundTask};

/// A configured limiter together with the store and background tasks it relies on.
#[derive(Debug)]
pub struct RateKeeper {
    limiter: Arc<RateLimiter>,
    backend: StoreBackend,
    local_store: Option<Arc<LocalStore>>,
    _sweeper: Option<BackgroundTask>,
    sample_interval: Duration,
    adaptive: Option<Arc<AdaptiveLimiter>>,
    _sampler: Option<BackgroundTask>,
}

impl RateKeeper {
    /// Build the service described by `config`.
    ///
    /// Must be called from within a tokio runtime; the local backend spawns
    /// its sweep task and the redis backend connects eagerly.
    pub async fn from_config(config: &RateKeeperConfig) -> Result<Self> {
        Self::from_config_with_clock(config, Arc::new(SystemClock)).await
    }

    pub async fn from_config_with_clock(config: &RateKeeperConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        let limits = config.limit_configs()?;

        let (store, local_store, sweeper) = match config.store.backend {
            StoreBackend::Local => {
                let store = Arc::new(LocalStore::with_clock(config.store.local_capacity, clock.clone())?);
                let sweeper = sweeper::spawn(Arc::downgrade(&store), config.store.sweep_interval());
                info!(
                    capacity = config.store.local_capacity,
                    sweep_interval_secs = config.store.sweep_interval_secs,
                    "Using local counter store"
                );
                let shared: Arc<dyn CounterStore> = store.clone();
                (shared, Some(store), Some(sweeper))
            }
            StoreBackend::Redis => {
                let url = config.store.redis_url.as_deref().ok_or_else(|| {
                    RateKeeperError::Config("store.redis_url is required for the redis backend".into())
                })?;
                let cache = RedisCache::connect(url, config.store.key_prefix.clone())
                    .await
                    .map_err(|e| RateKeeperError::StoreUnavailable(e.to_string()))?;
                let store = DistributedStore::new(Arc::new(cache))
                    .with_clock(clock.clone())
                    .with_operation_timeout(config.store.timeout());
                info!(key_prefix = %config.store.key_prefix, "Using distributed counter store");
                let shared: Arc<dyn CounterStore> = Arc::new(store);
                (shared, None, None)
            }
        };

        let limiter = RateLimiter::builder(store)
            .limits(limits)
            .clock(clock)
            .store_timeout(config.store.timeout())
            .build()?;

        info!(limits = ?limiter.limit_names(), "Rate limiter initialized");

        Ok(Self {
            limiter: Arc::new(limiter),
            backend: config.store.backend,
            local_store,
            _sweeper: sweeper,
            sample_interval: config.adaptive.sample_interval(),
            adaptive: None,
            _sampler: None,
        })
    }

    /// Start load-adaptive limits fed by `source`.
    ///
    /// Every configured limit is tracked under its name with its
    /// `max_requests` as base. `source` is sampled immediately and then every
    /// `adaptive.sample_interval_secs`. Calling again keeps the limiter and
    /// replaces the source.
    pub fn enable_adaptive(&mut self, source: Arc<dyn LoadSource>) -> Arc<AdaptiveLimiter> {
        let adaptive = match self.adaptive.clone() {
            Some(adaptive) => adaptive,
            None => {
                let adaptive = Arc::new(AdaptiveLimiter::new());
                for name in self.limiter.limit_names() {
                    if let Some(limit) = self.limiter.limit(name) {
                        adaptive.set_base_limit(name, limit.max_requests);
                    }
                }
                self.adaptive = Some(adaptive.clone());
                adaptive
            }
        };

        self._sampler = Some(adaptive.spawn_sampler(source, self.sample_interval));
        info!(
            sample_interval_secs = self.sample_interval.as_secs(),
            "Adaptive limits enabled"
        );
        adaptive
    }

    /// The adaptive limiter, once [`enable_adaptive`](Self::enable_adaptive) has run.
    pub fn adaptive(&self) -> Option<&Arc<AdaptiveLimiter>> {
        self.adaptive.as_ref()
    }

    /// The limiter, for sharing with request handlers.
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn backend(&self) -> StoreBackend {
        self.backend
    }

    /// The local store, when that backend is in use.
    pub fn local_store(&self) -> Option<&Arc<LocalStore>> {
        self.local_store.as_ref()
    }

    pub async fn check_limit(&self, limit_name: &str, identifier: &str) -> Result<RateLimitDecision> {
        self.limiter.check_limit(limit_name, identifier).await
    }

    pub async fn reset(&self, limit_name: &str, identifier: &str) -> Result<()> {
        self.limiter.reset(limit_name, identifier).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::{AtomicU64, Ordering};

    const CONFIG: &str = r#"
store:
  local_capacity: 100
  sweep_interval_secs: 60
limits:
  - name: auth
    max_requests: 2
    unit: minute
"#;

    #[tokio::test(start_paused = true)]
    async fn test_local_service_checks_and_sweeps() {
        let config = RateKeeperConfig::from_yaml(CONFIG).unwrap();
        let clock = Arc::new(ManualClock::starting_now());
        let service = RateKeeper::from_config_with_clock(&config, clock.clone())
            .await
            .unwrap();

        assert_eq!(service.backend(), StoreBackend::Local);
        assert!(service.check_limit("auth", "u1").await.unwrap().allowed);
        assert!(service.check_limit("auth", "u1").await.unwrap().allowed);
        assert!(!service.check_limit("auth", "u1").await.unwrap().allowed);

        let store = service.local_store().unwrap().clone();
        assert_eq!(store.len(), 1);

        // Expire the window, then let the sweeper run
        clock.advance(Duration::from_secs(61));
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(store.len(), 0);
    }

    #[tokio::test]
    async fn test_reset_through_service() {
        let config = RateKeeperConfig::from_yaml(CONFIG).unwrap();
        let service = RateKeeper::from_config(&config).await.unwrap();

        service.check_limit("auth", "u1").await.unwrap();
        service.check_limit("auth", "u1").await.unwrap();
        service.reset("auth", "u1").await.unwrap();

        let decision = service.check_limit("auth", "u1").await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.info.total_hits, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_adaptive_sampling_follows_configured_interval() {
        let yaml = r#"
adaptive:
  sample_interval_secs: 10
limits:
  - name: api
    max_requests: 100
    unit: minute
"#;
        let config = RateKeeperConfig::from_yaml(yaml).unwrap();
        let mut service = RateKeeper::from_config(&config).await.unwrap();
        assert!(service.adaptive().is_none());

        let load = Arc::new(AtomicU64::new(0.9f64.to_bits()));
        let reading = load.clone();
        let adaptive =
            service.enable_adaptive(Arc::new(move || f64::from_bits(reading.load(Ordering::SeqCst))));

        // First sample is taken right away
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(adaptive.base_limit("api"), Some(100));
        assert_eq!(adaptive.current_limit("api"), Some(40));

        load.store(0.1f64.to_bits(), Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(adaptive.current_limit("api"), Some(40));

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(adaptive.current_limit("api"), Some(120));
        assert!(Arc::ptr_eq(service.adaptive().unwrap(), &adaptive));
    }

    #[tokio::test]
    async fn test_unknown_limit() {
        let service = RateKeeper::from_config(&RateKeeperConfig::default()).await.unwrap();
        let err = service.check_limit("auth", "u1").await.unwrap_err();
        assert!(err.is_configuration_error());
    }
}
