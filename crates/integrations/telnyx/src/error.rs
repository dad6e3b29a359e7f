use std::time::Duration;

use thiserror::Error;

use leafline_provider::ProviderError;

/// Errors from the Telnyx adapter.
#[derive(Debug, Error)]
pub enum TelnyxError {
    /// The adapter was asked to send without a usable sender identity.
    #[error("invalid send request: {0}")]
    InvalidRequest(String),

    /// The API rejected the request; the carrier's error text is preserved.
    #[error("Telnyx API error: {0}")]
    Api(String),

    /// The API returned 429.
    #[error("rate limited")]
    RateLimited,

    /// The request timed out.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// Transport-level failure.
    #[error("request error: {0}")]
    Transport(String),
}

impl From<TelnyxError> for ProviderError {
    fn from(e: TelnyxError) -> Self {
        match e {
            TelnyxError::InvalidRequest(m) => Self::Configuration(m),
            TelnyxError::Api(m) => Self::ExecutionFailed(m),
            TelnyxError::RateLimited => Self::RateLimited,
            TelnyxError::Timeout(d) => Self::Timeout(d),
            TelnyxError::Transport(m) => Self::Connection(m),
        }
    }
}
