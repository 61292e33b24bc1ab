//! Configuration management for Ratekeeper.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RateKeeperError, Result};
use crate::ratelimit::{LimitConfig, LimitDefinition, LimitRules};

/// Environment variable prefix for overrides, e.g. `RATEKEEPER__STORE__BACKEND=redis`.
pub const ENV_PREFIX: &str = "RATEKEEPER";

/// Main configuration for the Ratekeeper engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateKeeperConfig {
    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Named limits
    #[serde(default)]
    pub limits: Vec<LimitDefinition>,

    /// Optional rules file whose limits are added to `limits`
    #[serde(default)]
    pub limits_file: Option<PathBuf>,

    /// Adaptive limiter configuration
    #[serde(default)]
    pub adaptive: AdaptiveConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Which counter store backs the fixed-window limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Local,
    Redis,
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Maximum keys held by the local store
    #[serde(default = "default_local_capacity")]
    pub local_capacity: usize,

    /// Interval between background sweeps of the local store, in seconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Redis connection URL, required for the redis backend
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Prefix for keys written to the shared cache
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Bound on a single store round trip, in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            local_capacity: default_local_capacity(),
            sweep_interval_secs: default_sweep_interval(),
            redis_url: None,
            key_prefix: default_key_prefix(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl StoreConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_local_capacity() -> usize {
    10000
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_key_prefix() -> String {
    crate::store::DEFAULT_KEY_PREFIX.to_string()
}

fn default_timeout_ms() -> u64 {
    250
}

/// Adaptive limiter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptiveConfig {
    /// Interval between load samples, in seconds
    #[serde(default = "default_sample_interval")]
    pub sample_interval_secs: u64,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            sample_interval_secs: default_sample_interval(),
        }
    }
}

impl AdaptiveConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_secs(self.sample_interval_secs)
    }
}

fn default_sample_interval() -> u64 {
    5
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default log level or filter directive
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON formatted logs
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl RateKeeperConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: RateKeeperConfig = serde_yaml::from_str(yaml)
            .map_err(|e| RateKeeperError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from an optional file layered under environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let config: RateKeeperConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| RateKeeperError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.store.local_capacity == 0 {
            return Err(RateKeeperError::Config("store.local_capacity must be positive".into()));
        }
        if self.store.sweep_interval_secs == 0 {
            return Err(RateKeeperError::Config("store.sweep_interval_secs must be positive".into()));
        }
        if self.store.timeout_ms == 0 {
            return Err(RateKeeperError::Config("store.timeout_ms must be positive".into()));
        }
        if self.store.backend == StoreBackend::Redis && self.store.redis_url.is_none() {
            return Err(RateKeeperError::Config(
                "store.redis_url is required for the redis backend".into(),
            ));
        }
        if self.adaptive.sample_interval_secs == 0 {
            return Err(RateKeeperError::Config(
                "adaptive.sample_interval_secs must be positive".into(),
            ));
        }
        self.limit_configs().map(|_| ())
    }

    /// Runtime limits described by this configuration.
    ///
    /// Limits from `limits_file` follow the inline ones; a name defined in
    /// both places is rejected as a duplicate.
    pub fn limit_configs(&self) -> Result<Vec<LimitConfig>> {
        let mut rules = LimitRules {
            limits: self.limits.clone(),
        };
        if let Some(path) = &self.limits_file {
            rules.limits.extend(LimitRules::from_file(path)?.limits);
        }
        rules.to_configs()
    }
}
