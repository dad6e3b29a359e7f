//! Webhook signature verification.
//!
//! Telnyx signs every webhook with Ed25519 over `{timestamp}|{raw_body}`,
//! sending the base64 signature in `telnyx-signature-ed25519` and the epoch
//! seconds in `telnyx-timestamp`. Verification covers both the signature
//! and timestamp freshness, so a captured payload cannot be replayed later.

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use thiserror::Error;

/// Maximum accepted age (or future skew) of a webhook timestamp.
pub const DEFAULT_TOLERANCE: Duration = Duration::from_secs(300);

/// Errors from webhook verification. All of them should surface to the
/// carrier as HTTP 400; none of them should reach the reconciler.
#[derive(Debug, Error)]
pub enum WebhookVerifyError {
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("invalid signature encoding: {0}")]
    InvalidSignature(String),

    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("timestamp outside tolerance: {age_seconds}s")]
    StaleTimestamp { age_seconds: i64 },

    #[error("signature does not match payload")]
    SignatureMismatch,
}

/// Verifier bound to a carrier public key.
#[derive(Clone)]
pub struct WebhookVerifier {
    key: VerifyingKey,
    tolerance: Duration,
}

impl WebhookVerifier {
    /// Build a verifier from the carrier's base64-encoded Ed25519 public
    /// key.
    pub fn new(public_key_b64: &str) -> Result<Self, WebhookVerifyError> {
        let bytes = BASE64
            .decode(public_key_b64.trim())
            .map_err(|e| WebhookVerifyError::InvalidPublicKey(e.to_string()))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| WebhookVerifyError::InvalidPublicKey("key must be 32 bytes".into()))?;
        let key = VerifyingKey::from_bytes(&bytes)
            .map_err(|e| WebhookVerifyError::InvalidPublicKey(e.to_string()))?;
        Ok(Self {
            key,
            tolerance: DEFAULT_TOLERANCE,
        })
    }

    /// Override the timestamp tolerance.
    #[must_use]
    pub fn with_tolerance(mut self, tolerance: Duration) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// Verify a webhook delivery: timestamp freshness first, then the
    /// Ed25519 signature over `{timestamp}|{raw_body}`.
    pub fn verify(
        &self,
        signature_b64: &str,
        timestamp: &str,
        raw_body: &[u8],
        now: DateTime<Utc>,
    ) -> Result<(), WebhookVerifyError> {
        let ts: i64 = timestamp
            .trim()
            .parse()
            .map_err(|_| WebhookVerifyError::InvalidTimestamp(timestamp.to_owned()))?;
        let age_seconds = (now.timestamp() - ts).abs();
        let tolerance_seconds = i64::try_from(self.tolerance.as_secs()).unwrap_or(i64::MAX);
        if age_seconds > tolerance_seconds {
            return Err(WebhookVerifyError::StaleTimestamp { age_seconds });
        }

        let signature_bytes = BASE64
            .decode(signature_b64.trim())
            .map_err(|e| WebhookVerifyError::InvalidSignature(e.to_string()))?;
        let signature = Signature::from_slice(&signature_bytes)
            .map_err(|e| WebhookVerifyError::InvalidSignature(e.to_string()))?;

        let mut message = Vec::with_capacity(timestamp.len() + 1 + raw_body.len());
        message.extend_from_slice(timestamp.trim().as_bytes());
        message.push(b'|');
        message.extend_from_slice(raw_body);

        self.key
            .verify(&message, &signature)
            .map_err(|_| WebhookVerifyError::SignatureMismatch)
    }
}
