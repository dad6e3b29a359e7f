use std::sync::Arc;

use tracing::debug;

use leafline_core::JobId;

use crate::backend::QueueBackend;
use crate::error::QueueError;
use crate::job::{Job, JobKind, JobOptions};

/// Producer handle for enqueueing jobs. Cheap to clone; the server's API
/// handlers and the campaign expander each hold one.
#[derive(Clone)]
pub struct Queue {
    backend: Arc<dyn QueueBackend>,
}

impl Queue {
    /// Create a producer over the given backend.
    #[must_use]
    pub fn new(backend: Arc<dyn QueueBackend>) -> Self {
        Self { backend }
    }

    /// Enqueue a job. With a zero delay it is immediately visible to
    /// workers; otherwise it is parked until the delay elapses. Returns the
    /// queue-assigned job id.
    pub async fn enqueue(
        &self,
        kind: JobKind,
        payload: serde_json::Value,
        opts: JobOptions,
    ) -> Result<JobId, QueueError> {
        let job = Job::new(kind, payload, opts);
        if opts.delay.is_zero() {
            self.backend.push_ready(&job).await?;
        } else {
            let ready_at = job.enqueued_at
                + chrono::Duration::from_std(opts.delay)
                    .map_err(|e| QueueError::Backend(e.to_string()))?;
            self.backend.push_delayed(&job, ready_at).await?;
        }
        debug!(job_id = %job.id, kind = %kind, delay_ms = opts.delay.as_millis() as u64, "job enqueued");
        Ok(job.id)
    }

    /// The underlying backend, shared with the worker pool.
    #[must_use]
    pub fn backend(&self) -> Arc<dyn QueueBackend> {
        Arc::clone(&self.backend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryQueueBackend;
    use std::time::Duration;

    #[tokio::test]
    async fn zero_delay_is_immediately_ready() {
        let backend = Arc::new(MemoryQueueBackend::new());
        let queue = Queue::new(backend.clone());
        let id = queue
            .enqueue(JobKind::SmsSend, serde_json::json!({}), JobOptions::default())
            .await
            .unwrap();
        let popped = backend.pop_ready(JobKind::SmsSend).await.unwrap().unwrap();
        assert_eq!(popped.id, id);
    }

    #[tokio::test]
    async fn delayed_enqueue_parks_the_job() {
        let backend = Arc::new(MemoryQueueBackend::new());
        let queue = Queue::new(backend.clone());
        queue
            .enqueue(
                JobKind::SmsSend,
                serde_json::json!({}),
                JobOptions::default().with_delay(Duration::from_secs(600)),
            )
            .await
            .unwrap();
        assert!(backend.pop_ready(JobKind::SmsSend).await.unwrap().is_none());
        assert_eq!(backend.delayed_len().await.unwrap(), 1);
    }
}
