use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use leafline_core::JobId;

/// The kinds of work the delivery queue carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Deliver a single SMS to one recipient.
    SmsSend,
    /// Expand a campaign into per-recipient SMS jobs.
    CampaignSend,
}

impl JobKind {
    /// Return a string representation of the kind.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SmsSend => "sms_send",
            Self::CampaignSend => "campaign_send",
        }
    }

    /// All kinds, for worker-pool iteration.
    #[must_use]
    pub fn all() -> [Self; 2] {
        [Self::SmsSend, Self::CampaignSend]
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-job queue options.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct JobOptions {
    /// Delay before the job becomes visible to workers.
    pub delay: Duration,

    /// Total dispatch attempts before the job is recorded failed.
    pub attempts_max: u32,

    /// Base of the exponential retry backoff: attempt `n` waits
    /// `backoff_base * 2^n`, jitter-free.
    pub backoff_base: Duration,

    /// How many completed jobs the backend keeps for inspection.
    pub keep_completed: usize,

    /// How many failed jobs the backend keeps for inspection.
    pub keep_failed: usize,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            delay: Duration::ZERO,
            attempts_max: 3,
            backoff_base: Duration::from_millis(5_000),
            keep_completed: 100,
            keep_failed: 500,
        }
    }
}

impl JobOptions {
    /// Set the initial visibility delay.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Set the total attempt budget.
    #[must_use]
    pub fn with_attempts_max(mut self, attempts_max: u32) -> Self {
        self.attempts_max = attempts_max;
        self
    }
}

/// Compute the retry delay for a zero-based attempt number:
/// `base * 2^attempt`, saturating rather than overflowing.
#[must_use]
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt))
}

/// A unit of work in the delivery queue.
///
/// The payload is opaque JSON; handlers deserialize what they need. The
/// `attempt` counter is zero-based and advances only on retry after a
/// thrown error — a compliance re-schedule resets it, because a deferral is
/// not a failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Queue-assigned identifier. Stable across retries and re-schedules,
    /// which is what downstream idempotency keys off.
    pub id: JobId,

    /// What kind of work this is.
    pub kind: JobKind,

    /// Handler-specific payload.
    pub payload: serde_json::Value,

    /// Zero-based dispatch attempt number.
    pub attempt: u32,

    /// Queue options the job was enqueued with.
    pub opts: JobOptions,

    /// When the job was first enqueued.
    pub enqueued_at: DateTime<Utc>,
}

impl Job {
    /// Create a new job with a random id on attempt 0.
    #[must_use]
    pub fn new(kind: JobKind, payload: serde_json::Value, opts: JobOptions) -> Self {
        Self {
            id: JobId::random(),
            kind,
            payload,
            attempt: 0,
            opts,
            enqueued_at: Utc::now(),
        }
    }
}
