//! Error types for the Ratekeeper engine.

use thiserror::Error;

/// Main error type for Ratekeeper operations.
#[derive(Error, Debug)]
pub enum RateKeeperError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A check referenced a limit name that was never configured
    #[error("Unknown rate limit: {0}")]
    UnknownLimit(String),

    /// The key function produced a key the stores refuse to hold
    #[error("Invalid storage key {key:?}: {reason}")]
    InvalidKey { key: String, reason: &'static str },

    /// The counter store could not be reached or timed out
    #[error("Counter store unavailable: {0}")]
    StoreUnavailable(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RateKeeperError {
    /// Whether this error stems from configuration rather than runtime conditions.
    ///
    /// Configuration errors are fatal to the calling request and must not be retried.
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            RateKeeperError::Config(_)
                | RateKeeperError::UnknownLimit(_)
                | RateKeeperError::InvalidKey { .. }
        )
    }
}

/// Result type alias for Ratekeeper operations.
pub type Result<T> = std::result::Result<T, RateKeeperError>;
