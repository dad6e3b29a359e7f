use std::time::Duration;

use thiserror::Error;

/// Errors from carrier operations.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The carrier rejected the message. The carrier's error text is
    /// preserved verbatim for the message audit row.
    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    /// The carrier did not respond within the allowed duration.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// A network or transport-level error occurred.
    #[error("connection error: {0}")]
    Connection(String),

    /// The adapter was given invalid configuration.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// The carrier rejected the request due to rate limiting.
    #[error("rate limited")]
    RateLimited,

    /// A serialization or deserialization error occurred.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl ProviderError {
    /// Returns `true` if the error is transient and the send may succeed on
    /// retry.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::Connection(_) | Self::RateLimited
        )
    }
}
