use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, instrument, warn};

use leafline_provider::{ProviderError, SendReceipt, SmsFrom, SmsProvider};

use crate::config::TelnyxConfig;
use crate::error::TelnyxError;
use crate::types::{CreateMessageRequest, CreateMessageResponse, ErrorResponse};

/// Telnyx carrier adapter. Sends SMS via `POST /v2/messages` with bearer
/// authentication.
pub struct TelnyxProvider {
    config: TelnyxConfig,
    client: Client,
}

impl TelnyxProvider {
    /// Create a new adapter with its own HTTP client, using the configured
    /// request timeout.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Configuration`] if the HTTP client cannot be
    /// built.
    pub fn new(config: TelnyxConfig) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ProviderError::Configuration(e.to_string()))?;
        Ok(Self { config, client })
    }

    /// Create a new adapter with a custom HTTP client. Useful for sharing a
    /// connection pool, or for tests.
    #[must_use]
    pub fn with_client(config: TelnyxConfig, client: Client) -> Self {
        Self { config, client }
    }

    fn messages_url(&self) -> String {
        format!("{}/v2/messages", self.config.api_base_url)
    }

    fn profiles_url(&self) -> String {
        format!("{}/v2/messaging_profiles?page[size]=1", self.config.api_base_url)
    }

    fn build_request(&self, to: &str, from: &SmsFrom, content: &str) -> CreateMessageRequest {
        let (from_number, profile) = match from {
            SmsFrom::Number(number) => (Some(number.clone()), None),
            SmsFrom::MessagingProfile(id) => (None, Some(id.clone())),
        };
        CreateMessageRequest {
            to: to.to_owned(),
            text: content.to_owned(),
            from: from_number,
            messaging_profile_id: profile,
        }
    }

    async fn create_message(
        &self,
        request: &CreateMessageRequest,
    ) -> Result<CreateMessageResponse, TelnyxError> {
        debug!(to = %request.to, "sending SMS via Telnyx");

        let response = self
            .client
            .post(self.messages_url())
            .bearer_auth(&self.config.api_key)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TelnyxError::Timeout(self.config.request_timeout)
                } else {
                    TelnyxError::Transport(e.to_string())
                }
            })?;

        let status = response.status();

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            warn!("Telnyx API rate limit hit");
            return Err(TelnyxError::RateLimited);
        }

        if status.is_server_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(TelnyxError::Transport(format!("HTTP {status}: {body}")));
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let parsed: ErrorResponse = serde_json::from_str(&body).unwrap_or_default();
            return Err(TelnyxError::Api(format!(
                "HTTP {status}: {}",
                parsed.message()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| TelnyxError::Transport(format!("malformed response: {e}")))
    }
}

#[async_trait]
impl SmsProvider for TelnyxProvider {
    fn name(&self) -> &str {
        "telnyx"
    }

    #[instrument(skip(self, to, from, content), fields(provider = "telnyx", to = %to))]
    async fn send(
        &self,
        to: &str,
        from: &SmsFrom,
        content: &str,
    ) -> Result<SendReceipt, ProviderError> {
        let request = self.build_request(to, from, content);
        let response = self.create_message(&request).await?;

        debug!(provider_id = %response.data.id, "Telnyx accepted message");
        Ok(SendReceipt {
            provider_id: response.data.id,
            segments: response.data.parts.unwrap_or(1),
        })
    }

    #[instrument(skip(self), fields(provider = "telnyx"))]
    async fn health_check(&self) -> Result<(), ProviderError> {
        let response = self
            .client
            .get(self.profiles_url())
            .bearer_auth(&self.config.api_key)
            .send()
            .await
            .map_err(|e| ProviderError::Connection(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(ProviderError::RateLimited);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Connection(format!("HTTP {status}: {body}")));
        }
        Ok(())
    }
}
