//! Named limit definitions.
//!
//! This module handles describing limits, both programmatically through
//! [`LimitConfig`] and declaratively through YAML [`LimitDefinition`]s.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use super::key::{KeyStrategy, StorageKey};
use crate::error::{RateKeeperError, Result};

/// Message used when a limit does not configure its own.
pub const DEFAULT_MESSAGE: &str = "Too many requests, please try again later.";

/// Time unit for window lengths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Second,
    Minute,
    Hour,
    Day,
}

impl TimeUnit {
    /// Get the duration of one unit.
    pub fn duration(&self) -> Duration {
        match self {
            TimeUnit::Second => Duration::from_secs(1),
            TimeUnit::Minute => Duration::from_secs(60),
            TimeUnit::Hour => Duration::from_secs(3600),
            TimeUnit::Day => Duration::from_secs(86400),
        }
    }
}

/// What a check does when the counter store cannot be consulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailPolicy {
    /// Allow the request and log a warning
    #[default]
    Open,
    /// Deny the request
    Closed,
    /// Return the store error to the caller
    Propagate,
}

/// Immutable description of one named limit.
///
/// Built once at configuration time and shared by every concurrent check.
#[derive(Debug, Clone)]
pub struct LimitConfig {
    /// Name checks refer to
    pub name: String,
    /// Length of one window
    pub window: Duration,
    /// Requests allowed per window
    pub max_requests: u64,
    /// Identifier to storage key mapping
    pub key: KeyStrategy,
    /// Human readable message for denied callers
    pub message: String,
    /// Behaviour on store outage
    pub fail_policy: FailPolicy,
    /// Whether denials publish a limit event
    pub report_limit_reached: bool,
}

impl LimitConfig {
    /// Create a limit with default key derivation, message and fail policy.
    pub fn new(name: impl Into<String>, max_requests: u64, window: Duration) -> Self {
        Self {
            name: name.into(),
            window,
            max_requests,
            key: KeyStrategy::default(),
            message: DEFAULT_MESSAGE.to_string(),
            fail_policy: FailPolicy::default(),
            report_limit_reached: true,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key = KeyStrategy::Prefix(prefix.into());
        self
    }

    pub fn with_key_fn<F>(mut self, key_fn: F) -> Self
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        self.key = KeyStrategy::Custom(Arc::new(key_fn));
        self
    }

    pub fn with_fail_policy(mut self, policy: FailPolicy) -> Self {
        self.fail_policy = policy;
        self
    }

    pub fn report_limit_reached(mut self, report: bool) -> Self {
        self.report_limit_reached = report;
        self
    }

    /// Storage key for a caller identity.
    pub fn storage_key(&self, identifier: &str) -> Result<StorageKey> {
        self.key.derive(&self.name, identifier)
    }

    /// Check the limit is usable.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(RateKeeperError::Config("limit name must not be empty".into()));
        }
        if self.max_requests == 0 {
            return Err(RateKeeperError::Config(format!(
                "limit '{}': max_requests must be positive",
                self.name
            )));
        }
        if self.window.is_zero() {
            return Err(RateKeeperError::Config(format!(
                "limit '{}': window must be positive",
                self.name
            )));
        }
        Ok(())
    }
}

/// A limit as written in configuration files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitDefinition {
    /// The limit name
    pub name: String,
    /// Requests allowed per window
    pub max_requests: u64,
    /// Unit the window is measured in
    pub unit: TimeUnit,
    /// Number of units per window
    #[serde(default = "default_units")]
    pub units: u32,
    /// Optional message for denied callers
    #[serde(default)]
    pub message: Option<String>,
    /// Optional key prefix replacing the limit name
    #[serde(default)]
    pub key_prefix: Option<String>,
    /// Behaviour on store outage
    #[serde(default)]
    pub on_store_unavailable: FailPolicy,
    /// Whether denials publish a limit event
    #[serde(default = "default_report")]
    pub report_limit_reached: bool,
}

fn default_units() -> u32 {
    1
}

fn default_report() -> bool {
    true
}

impl LimitDefinition {
    /// Window length described by `unit` and `units`.
    pub fn window(&self) -> Duration {
        self.unit.duration() * self.units
    }

    /// Turn the definition into a runtime limit.
    pub fn to_config(&self) -> Result<LimitConfig> {
        if self.units == 0 {
            return Err(RateKeeperError::Config(format!(
                "limit '{}': units must be positive",
                self.name
            )));
        }

        let mut config = LimitConfig::new(&self.name, self.max_requests, self.window())
            .with_fail_policy(self.on_store_unavailable)
            .report_limit_reached(self.report_limit_reached);
        if let Some(ref message) = self.message {
            config = config.with_message(message);
        }
        if let Some(ref prefix) = self.key_prefix {
            config = config.with_key_prefix(prefix);
        }
        config.validate()?;
        Ok(config)
    }
}

/// A set of limit definitions as loaded from a rules file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LimitRules {
    #[serde(default)]
    pub limits: Vec<LimitDefinition>,
}

impl LimitRules {
    /// Load rules from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load rules from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        // A bare list of definitions is accepted as shorthand
        if let Ok(limits) = serde_yaml::from_str::<Vec<LimitDefinition>>(yaml) {
            return Ok(Self { limits });
        }

        serde_yaml::from_str(yaml)
            .map_err(|e| RateKeeperError::Config(format!("Failed to parse rate limit rules: {}", e)))
    }

    /// Convert every definition, rejecting duplicates.
    pub fn to_configs(&self) -> Result<Vec<LimitConfig>> {
        let mut seen = HashSet::new();
        self.limits
            .iter()
            .map(|definition| {
                if !seen.insert(definition.name.as_str()) {
                    return Err(RateKeeperError::Config(format!(
                        "duplicate limit name '{}'",
                        definition.name
                    )));
                }
                definition.to_config()
            })
            .collect()
    }
}
