//! Scriptable provider double for pipeline and server tests.

use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::ProviderError;
use crate::provider::{SendReceipt, SmsFrom, SmsProvider};

/// A recorded outbound send.
#[derive(Debug, Clone)]
pub struct SentMessage {
    /// Destination address.
    pub to: String,
    /// Sender identity.
    pub from: SmsFrom,
    /// Message body.
    pub content: String,
}

/// Provider double that plays back a script of responses and records every
/// send it receives.
///
/// With an empty script every send succeeds with a sequentially numbered
/// provider id (`test-pm-1`, `test-pm-2`, ...). Pushing
/// [`ProviderError`] values onto the script makes the next sends fail in
/// order — the shape used to exercise retry paths.
#[derive(Default)]
pub struct ScriptedProvider {
    script: Mutex<Vec<Result<SendReceipt, ProviderError>>>,
    sent: Mutex<Vec<SentMessage>>,
    counter: Mutex<u64>,
}

impl ScriptedProvider {
    /// A provider that succeeds on every send.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A provider that fails the first `n` sends with connection errors,
    /// then succeeds.
    #[must_use]
    pub fn failing_first(n: usize) -> Self {
        let provider = Self::new();
        {
            let mut script = provider.script.lock().expect("script lock poisoned");
            for _ in 0..n {
                script.push(Err(ProviderError::Connection("simulated outage".into())));
            }
        }
        provider
    }

    /// Push the next scripted result.
    pub fn push_result(&self, result: Result<SendReceipt, ProviderError>) {
        self.script.lock().expect("script lock poisoned").push(result);
    }

    /// Every send recorded so far, oldest first.
    #[must_use]
    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().expect("sent lock poisoned").clone()
    }

    /// Number of send attempts, including failed ones.
    #[must_use]
    pub fn send_attempts(&self) -> u64 {
        *self.counter.lock().expect("counter lock poisoned")
    }
}

#[async_trait]
impl SmsProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn send(
        &self,
        to: &str,
        from: &SmsFrom,
        content: &str,
    ) -> Result<SendReceipt, ProviderError> {
        let attempt = {
            let mut counter = self.counter.lock().expect("counter lock poisoned");
            *counter += 1;
            *counter
        };

        let scripted = {
            let mut script = self.script.lock().expect("script lock poisoned");
            if script.is_empty() {
                None
            } else {
                Some(script.remove(0))
            }
        };

        match scripted {
            Some(Err(e)) => Err(e),
            Some(Ok(receipt)) => {
                self.record(to, from, content);
                Ok(receipt)
            }
            None => {
                self.record(to, from, content);
                Ok(SendReceipt {
                    provider_id: format!("test-pm-{attempt}"),
                    segments: 1,
                })
            }
        }
    }

    async fn health_check(&self) -> Result<(), ProviderError> {
        Ok(())
    }
}

impl ScriptedProvider {
    fn record(&self, to: &str, from: &SmsFrom, content: &str) {
        self.sent.lock().expect("sent lock poisoned").push(SentMessage {
            to: to.to_owned(),
            from: from.clone(),
            content: content.to_owned(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn defaults_to_success_with_sequential_ids() {
        let provider = ScriptedProvider::new();
        let from = SmsFrom::Number("+14155550100".into());
        let first = provider.send("+14155551212", &from, "hi").await.unwrap();
        let second = provider.send("+14155551212", &from, "again").await.unwrap();
        assert_eq!(first.provider_id, "test-pm-1");
        assert_eq!(second.provider_id, "test-pm-2");
        assert_eq!(provider.sent().len(), 2);
    }

    #[tokio::test]
    async fn failing_first_recovers() {
        let provider = ScriptedProvider::failing_first(2);
        let from = SmsFrom::Number("+14155550100".into());
        assert!(provider.send("+1", &from, "x").await.is_err());
        assert!(provider.send("+1", &from, "x").await.is_err());
        assert!(provider.send("+1", &from, "x").await.is_ok());
        assert_eq!(provider.send_attempts(), 3);
        // Only the successful send is recorded as delivered to the carrier.
        assert_eq!(provider.sent().len(), 1);
    }
}
