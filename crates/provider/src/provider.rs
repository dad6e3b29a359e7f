use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;

/// The sender identity for an outbound SMS: a dedicated long-code number,
/// or a carrier messaging-profile id when the location has none assigned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SmsFrom {
    /// A sending phone number in E.164 form.
    Number(String),
    /// A carrier messaging-profile id.
    MessagingProfile(String),
}

/// What the carrier acknowledged for a dispatched message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendReceipt {
    /// Carrier-assigned message id, globally unique. Webhook callbacks are
    /// matched back to the audit row by this id.
    pub provider_id: String,

    /// Billable segment count.
    pub segments: u32,
}

/// A carrier adapter.
///
/// Stateless and safe to invoke concurrently up to the worker pool size;
/// throughput limiting is the queue limiter's job, not the adapter's.
/// Errors preserve the carrier's own text so the audit row records exactly
/// what the upstream said.
#[async_trait]
pub trait SmsProvider: Send + Sync {
    /// Returns the unique name of this provider.
    fn name(&self) -> &str;

    /// Dispatch a single outbound message.
    async fn send(
        &self,
        to: &str,
        from: &SmsFrom,
        content: &str,
    ) -> Result<SendReceipt, ProviderError>;

    /// Verify the carrier is reachable and the credentials work.
    async fn health_check(&self) -> Result<(), ProviderError>;
}
