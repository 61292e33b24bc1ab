//! Storage key derivation and validation.

use std::fmt;
use std::sync::Arc;

use crate::error::{RateKeeperError, Result};

/// Longest storage key the stores accept, in bytes.
pub const MAX_KEY_LEN: usize = 512;

/// Custom mapping from a caller identifier to a storage key.
pub type KeyFn = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// How a limit turns caller identifiers into storage keys.
///
/// Limits sharing a store must never share keys, which is why the default
/// strategy prefixes the identifier with the limit name.
#[derive(Clone, Default)]
pub enum KeyStrategy {
    /// `{limit_name}:{identifier}`
    #[default]
    LimitName,
    /// `{prefix}:{identifier}`
    Prefix(String),
    /// Arbitrary user-supplied function
    Custom(KeyFn),
}

impl KeyStrategy {
    /// Derive and validate the storage key for `identifier` under `limit_name`.
    pub fn derive(&self, limit_name: &str, identifier: &str) -> Result<StorageKey> {
        let raw = match self {
            KeyStrategy::LimitName => format!("{}:{}", limit_name, identifier),
            KeyStrategy::Prefix(prefix) => format!("{}:{}", prefix, identifier),
            KeyStrategy::Custom(key_fn) => key_fn(identifier),
        };
        StorageKey::new(raw)
    }
}

impl fmt::Debug for KeyStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyStrategy::LimitName => f.write_str("LimitName"),
            KeyStrategy::Prefix(prefix) => f.debug_tuple("Prefix").field(prefix).finish(),
            KeyStrategy::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// A validated key identifying one counter in a store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StorageKey(String);

impl StorageKey {
    /// Validate a raw key.
    pub fn new(raw: impl Into<String>) -> Result<Self> {
        let raw = raw.into();
        if let Some(reason) = malformed(&raw) {
            return Err(RateKeeperError::InvalidKey { key: raw, reason });
        }
        Ok(Self(raw))
    }

    /// The key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for StorageKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn malformed(key: &str) -> Option<&'static str> {
    if key.is_empty() {
        Some("key is empty")
    } else if key.len() > MAX_KEY_LEN {
        Some("key exceeds maximum length")
    } else if key.chars().any(|c| c.is_whitespace() || c.is_control()) {
        Some("key contains whitespace or control characters")
    } else {
        None
    }
}
