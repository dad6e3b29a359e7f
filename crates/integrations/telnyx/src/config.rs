use std::time::Duration;

/// Configuration for the Telnyx carrier adapter.
#[derive(Clone)]
pub struct TelnyxConfig {
    /// API key used as the bearer token on every request.
    pub api_key: String,

    /// Base64-encoded Ed25519 public key used to verify webhook signatures.
    pub public_key: Option<String>,

    /// Default messaging-profile id used when a location has no dedicated
    /// sending number.
    pub messaging_profile_id: Option<String>,

    /// Base URL for the Telnyx REST API. Override this for testing against
    /// a mock server.
    pub api_base_url: String,

    /// Per-request timeout. Timeouts surface as retryable errors.
    pub request_timeout: Duration,
}

impl std::fmt::Debug for TelnyxConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelnyxConfig")
            .field("api_key", &"[REDACTED]")
            .field("public_key", &self.public_key)
            .field("messaging_profile_id", &self.messaging_profile_id)
            .field("api_base_url", &self.api_base_url)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

impl TelnyxConfig {
    /// Create a new configuration with the given API key.
    ///
    /// Uses the default Telnyx API base URL (`https://api.telnyx.com`) and a
    /// 10-second request timeout.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            public_key: None,
            messaging_profile_id: None,
            api_base_url: "https://api.telnyx.com".to_owned(),
            request_timeout: Duration::from_secs(10),
        }
    }

    /// Set the webhook verification public key.
    #[must_use]
    pub fn with_public_key(mut self, key: impl Into<String>) -> Self {
        self.public_key = Some(key.into());
        self
    }

    /// Set the default messaging-profile id.
    #[must_use]
    pub fn with_messaging_profile_id(mut self, id: impl Into<String>) -> Self {
        self.messaging_profile_id = Some(id.into());
        self
    }

    /// Override the API base URL (useful for testing).
    #[must_use]
    pub fn with_api_base_url(mut self, url: impl Into<String>) -> Self {
        self.api_base_url = url.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_api_base_url_and_timeout() {
        let config = TelnyxConfig::new("KEY123");
        assert_eq!(config.api_base_url, "https://api.telnyx.com");
        assert_eq!(config.request_timeout, Duration::from_secs(10));
        assert!(config.messaging_profile_id.is_none());
    }

    #[test]
    fn debug_redacts_api_key() {
        let config = TelnyxConfig::new("test-placeholder-value");
        let debug = format!("{config:?}");
        assert!(debug.contains("[REDACTED]"), "api_key must be redacted");
        assert!(
            !debug.contains("test-placeholder-value"),
            "api_key must not appear in debug output"
        );
    }
}
