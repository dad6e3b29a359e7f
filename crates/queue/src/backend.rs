use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::QueueError;
use crate::job::{Job, JobKind};

/// Storage contract for the delivery queue.
///
/// A backend holds three pools of jobs: a ready list per kind that workers
/// pop from, a delayed set scored by the instant each job becomes visible,
/// and capped completed/failed archives. Delivery is at-least-once: a job
/// popped by a crashing worker is lost from the ready list, and the retry
/// policy plus idempotent dispatch downstream absorb redelivery.
///
/// Implementations must be `Send + Sync` and safe for concurrent access.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Append a job to the ready list for its kind.
    async fn push_ready(&self, job: &Job) -> Result<(), QueueError>;

    /// Park a job until `ready_at`. Not visible to [`pop_ready`] until a
    /// [`promote_due`] call at or after that instant moves it over.
    ///
    /// [`pop_ready`]: Self::pop_ready
    /// [`promote_due`]: Self::promote_due
    async fn push_delayed(&self, job: &Job, ready_at: DateTime<Utc>) -> Result<(), QueueError>;

    /// Pop the oldest ready job of `kind`, or `None` when the list is
    /// empty.
    async fn pop_ready(&self, kind: JobKind) -> Result<Option<Job>, QueueError>;

    /// Move every delayed job whose `ready_at <= now` to its ready list.
    /// Returns how many jobs were promoted. The scheduler task calls this
    /// on an interval, which is what guarantees delayed jobs eventually
    /// become visible even across worker restarts.
    async fn promote_due(&self, now: DateTime<Utc>) -> Result<u64, QueueError>;

    /// Archive a finished job, trimming to `opts.keep_completed`.
    async fn record_completed(&self, job: &Job) -> Result<(), QueueError>;

    /// Archive a failed job with its final error, trimming to
    /// `opts.keep_failed`.
    async fn record_failed(&self, job: &Job, error: &str) -> Result<(), QueueError>;

    /// Number of ready jobs of `kind`.
    async fn ready_len(&self, kind: JobKind) -> Result<u64, QueueError>;

    /// Number of delayed jobs across all kinds.
    async fn delayed_len(&self) -> Result<u64, QueueError>;
}
