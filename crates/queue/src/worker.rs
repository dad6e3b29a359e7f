//! Worker pool and retry policy.
//!
//! Each job kind gets a fixed number of worker tasks; a shared token bucket
//! caps dispatch across all of them. A handler communicates a business
//! outcome by returning [`JobOutcome`] — including a structured block,
//! which finalizes the job successfully and is never retried — and a
//! transport failure by returning an error, which is retried with
//! exponential backoff up to the job's attempt budget.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::QueueBackend;
use crate::error::QueueError;
use crate::job::{Job, JobKind, backoff_delay};
use crate::limiter::TokenBucket;

/// What a handler decided about a job.
#[derive(Debug, Clone)]
pub enum JobOutcome {
    /// The work is done.
    Completed,
    /// Compliance blocked the send at dispatch time. A terminal business
    /// outcome, not a transport error: the job finalizes successfully and
    /// is never retried.
    Blocked {
        /// The failing reasons, for the archive.
        reasons: Vec<String>,
    },
    /// The send is allowed but not yet (e.g. the clock crossed into quiet
    /// hours between enqueue and dispatch). The job is re-parked with this
    /// delay and its attempt counter reset — a deferral is not a failure.
    Rescheduled {
        /// How long to park the job.
        delay: Duration,
    },
}

/// A handler failure. `retryable` distinguishes transport errors (retried
/// with backoff) from permanent ones (failed immediately).
#[derive(Debug, Error)]
#[error("{message}")]
pub struct HandlerError {
    /// Human-readable failure description.
    pub message: String,
    /// Whether the queue should retry.
    pub retryable: bool,
}

impl HandlerError {
    /// A transient failure worth retrying.
    #[must_use]
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// A permanent failure; the job is recorded failed without retries.
    #[must_use]
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

/// Work executed by the pool for one job kind.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// The kind this handler consumes.
    fn kind(&self) -> JobKind;

    /// Execute one job.
    async fn run(&self, job: &Job) -> Result<JobOutcome, HandlerError>;
}

/// What the pool did with a processed job. Returned by
/// [`WorkerPool::run_one`] so tests can drive the queue deterministically.
#[derive(Debug, Clone)]
pub enum JobResult {
    /// Handler completed; job archived as completed.
    Completed,
    /// Handler reported a compliance block; job archived as completed.
    Blocked {
        /// The failing reasons.
        reasons: Vec<String>,
    },
    /// Handler deferred; job re-parked with the given delay.
    Rescheduled {
        /// The park duration.
        delay: Duration,
    },
    /// Handler failed retryably; job re-parked with backoff.
    Retried {
        /// The backoff delay applied.
        delay: Duration,
    },
    /// Handler failed permanently or exhausted its attempts; job archived
    /// as failed.
    Failed {
        /// The final error text.
        error: String,
    },
}

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Concurrent workers for SMS delivery jobs.
    pub sms_concurrency: usize,

    /// Concurrent workers for campaign expansion jobs.
    pub campaign_concurrency: usize,

    /// How long an idle worker sleeps before polling again.
    pub poll_interval: Duration,

    /// How often the scheduler promotes due delayed jobs.
    pub promote_interval: Duration,

    /// Token-bucket capacity per interval, tuned to the upstream carrier
    /// limit.
    pub rate_max: u32,

    /// Token-bucket refill interval.
    pub rate_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            sms_concurrency: 10,
            campaign_concurrency: 2,
            poll_interval: Duration::from_millis(250),
            promote_interval: Duration::from_millis(500),
            rate_max: 100,
            rate_interval: Duration::from_secs(1),
        }
    }
}

impl WorkerConfig {
    fn concurrency_for(&self, kind: JobKind) -> usize {
        match kind {
            JobKind::SmsSend => self.sms_concurrency,
            JobKind::CampaignSend => self.campaign_concurrency,
        }
    }
}

/// Bounded worker pool over a [`QueueBackend`].
pub struct WorkerPool {
    backend: Arc<dyn QueueBackend>,
    handlers: HashMap<JobKind, Arc<dyn JobHandler>>,
    limiter: Arc<TokenBucket>,
    config: WorkerConfig,
}

impl WorkerPool {
    /// Create a pool over the given backend.
    #[must_use]
    pub fn new(backend: Arc<dyn QueueBackend>, config: WorkerConfig) -> Self {
        let limiter = Arc::new(TokenBucket::new(config.rate_max, config.rate_interval));
        Self {
            backend,
            handlers: HashMap::new(),
            limiter,
            config,
        }
    }

    /// Register the handler for its job kind.
    #[must_use]
    pub fn register(mut self, handler: Arc<dyn JobHandler>) -> Self {
        self.handlers.insert(handler.kind(), handler);
        self
    }

    /// Spawn the scheduler task plus the configured number of worker tasks
    /// per registered kind. Tasks run until `shutdown` is cancelled.
    pub fn spawn(self: &Arc<Self>, shutdown: &CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        // Scheduler: promotes due delayed jobs so they become visible even
        // across worker restarts.
        {
            let pool = Arc::clone(self);
            let token = shutdown.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        () = token.cancelled() => break,
                        () = tokio::time::sleep(pool.config.promote_interval) => {
                            match pool.backend.promote_due(Utc::now()).await {
                                Ok(promoted) if promoted > 0 => {
                                    debug!(promoted, "promoted delayed jobs");
                                }
                                Ok(_) => {}
                                Err(e) => warn!(error = %e, "delayed-job promotion failed"),
                            }
                        }
                    }
                }
            }));
        }

        for (kind, handler) in &self.handlers {
            for worker_index in 0..self.config.concurrency_for(*kind) {
                let pool = Arc::clone(self);
                let handler = Arc::clone(handler);
                let token = shutdown.clone();
                let kind = *kind;
                handles.push(tokio::spawn(async move {
                    debug!(%kind, worker_index, "worker started");
                    pool.worker_loop(kind, handler, token).await;
                    debug!(%kind, worker_index, "worker stopped");
                }));
            }
        }

        info!(
            kinds = self.handlers.len(),
            "worker pool started"
        );
        handles
    }

    async fn worker_loop(
        &self,
        kind: JobKind,
        handler: Arc<dyn JobHandler>,
        shutdown: CancellationToken,
    ) {
        loop {
            if shutdown.is_cancelled() {
                break;
            }
            match self.backend.pop_ready(kind).await {
                Ok(Some(job)) => {
                    self.limiter.acquire().await;
                    if let Err(e) = self.process(job, handler.as_ref()).await {
                        error!(error = %e, %kind, "job processing hit a queue error");
                    }
                }
                Ok(None) => {
                    tokio::select! {
                        () = shutdown.cancelled() => break,
                        () = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
                Err(e) => {
                    warn!(error = %e, %kind, "queue poll failed");
                    tokio::select! {
                        () = shutdown.cancelled() => break,
                        () = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
            }
        }
    }

    /// Pop and process one ready job of `kind`. Returns `None` when the
    /// ready list is empty. Lets tests drive the queue one job at a time.
    pub async fn run_one(&self, kind: JobKind) -> Result<Option<JobResult>, QueueError> {
        let Some(job) = self.backend.pop_ready(kind).await? else {
            return Ok(None);
        };
        self.limiter.acquire().await;
        let handler = self
            .handlers
            .get(&kind)
            .ok_or_else(|| QueueError::Backend(format!("no handler registered for {kind}")))?;
        let handler = Arc::clone(handler);
        self.process(job, handler.as_ref()).await.map(Some)
    }

    /// Apply the retry policy to one handler invocation.
    async fn process(&self, mut job: Job, handler: &dyn JobHandler) -> Result<JobResult, QueueError> {
        let job_id = job.id.clone();
        match handler.run(&job).await {
            Ok(JobOutcome::Completed) => {
                debug!(%job_id, kind = %job.kind, "job completed");
                self.backend.record_completed(&job).await?;
                Ok(JobResult::Completed)
            }
            Ok(JobOutcome::Blocked { reasons }) => {
                // Terminal business outcome: success from the queue's view.
                info!(%job_id, kind = %job.kind, ?reasons, "job blocked by compliance");
                self.backend.record_completed(&job).await?;
                Ok(JobResult::Blocked { reasons })
            }
            Ok(JobOutcome::Rescheduled { delay }) => {
                job.attempt = 0;
                let ready_at = Utc::now()
                    + chrono::Duration::from_std(delay)
                        .map_err(|e| QueueError::Backend(e.to_string()))?;
                debug!(%job_id, kind = %job.kind, delay_ms = delay.as_millis() as u64, "job rescheduled");
                self.backend.push_delayed(&job, ready_at).await?;
                Ok(JobResult::Rescheduled { delay })
            }
            Err(e) if e.retryable && job.attempt + 1 < job.opts.attempts_max => {
                let delay = backoff_delay(job.opts.backoff_base, job.attempt);
                job.attempt += 1;
                let ready_at = Utc::now()
                    + chrono::Duration::from_std(delay)
                        .map_err(|err| QueueError::Backend(err.to_string()))?;
                warn!(
                    %job_id,
                    kind = %job.kind,
                    attempt = job.attempt,
                    attempts_max = job.opts.attempts_max,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "job failed, will retry"
                );
                self.backend.push_delayed(&job, ready_at).await?;
                Ok(JobResult::Retried { delay })
            }
            Err(e) => {
                warn!(
                    %job_id,
                    kind = %job.kind,
                    attempt = job.attempt,
                    retryable = e.retryable,
                    error = %e,
                    "job failed permanently"
                );
                self.backend.record_failed(&job, &e.message).await?;
                Ok(JobResult::Failed { error: e.message })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobOptions;
    use crate::memory::MemoryQueueBackend;
    use crate::producer::Queue;
    use std::sync::Mutex;

    /// Handler that plays back a script of results.
    struct ScriptedHandler {
        kind: JobKind,
        script: Mutex<Vec<Result<JobOutcome, HandlerError>>>,
        calls: Mutex<u32>,
    }

    impl ScriptedHandler {
        fn new(kind: JobKind, script: Vec<Result<JobOutcome, HandlerError>>) -> Self {
            Self {
                kind,
                script: Mutex::new(script),
                calls: Mutex::new(0),
            }
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl JobHandler for ScriptedHandler {
        fn kind(&self) -> JobKind {
            self.kind
        }

        async fn run(&self, _job: &Job) -> Result<JobOutcome, HandlerError> {
            *self.calls.lock().unwrap() += 1;
            self.script.lock().unwrap().remove(0)
        }
    }

    fn pool_with(
        backend: Arc<MemoryQueueBackend>,
        script: Vec<Result<JobOutcome, HandlerError>>,
    ) -> (Arc<WorkerPool>, Arc<ScriptedHandler>) {
        let handler = Arc::new(ScriptedHandler::new(JobKind::SmsSend, script));
        let pool = Arc::new(
            WorkerPool::new(backend, WorkerConfig::default()).register(handler.clone()),
        );
        (pool, handler)
    }

    async fn enqueue_one(backend: &Arc<MemoryQueueBackend>) {
        Queue::new(backend.clone() as Arc<dyn QueueBackend>)
            .enqueue(JobKind::SmsSend, serde_json::json!({}), JobOptions::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn completed_job_is_archived() {
        let backend = Arc::new(MemoryQueueBackend::new());
        let (pool, handler) = pool_with(backend.clone(), vec![Ok(JobOutcome::Completed)]);
        enqueue_one(&backend).await;

        let result = pool.run_one(JobKind::SmsSend).await.unwrap().unwrap();
        assert!(matches!(result, JobResult::Completed));
        assert_eq!(handler.calls(), 1);
        assert_eq!(backend.completed().len(), 1);
        assert!(backend.failed().is_empty());
    }

    #[tokio::test]
    async fn blocked_job_is_not_retried() {
        let backend = Arc::new(MemoryQueueBackend::new());
        let (pool, handler) = pool_with(
            backend.clone(),
            vec![Ok(JobOutcome::Blocked {
                reasons: vec!["No SMS consent on file".into()],
            })],
        );
        enqueue_one(&backend).await;

        let result = pool.run_one(JobKind::SmsSend).await.unwrap().unwrap();
        assert!(matches!(result, JobResult::Blocked { .. }));
        // Finalized successful: nothing ready, nothing delayed, no failure.
        assert_eq!(backend.ready_len(JobKind::SmsSend).await.unwrap(), 0);
        assert_eq!(backend.delayed_len().await.unwrap(), 0);
        assert!(backend.failed().is_empty());
        assert_eq!(backend.completed().len(), 1);
        assert_eq!(handler.calls(), 1);
    }

    #[tokio::test]
    async fn rescheduled_job_is_parked_with_attempt_reset() {
        let backend = Arc::new(MemoryQueueBackend::new());
        let (pool, _) = pool_with(
            backend.clone(),
            vec![Ok(JobOutcome::Rescheduled {
                delay: Duration::from_secs(3600),
            })],
        );
        enqueue_one(&backend).await;

        let result = pool.run_one(JobKind::SmsSend).await.unwrap().unwrap();
        assert!(matches!(result, JobResult::Rescheduled { .. }));
        assert_eq!(backend.delayed_len().await.unwrap(), 1);
        assert!(backend.failed().is_empty());

        // The parked job keeps its identity and a fresh attempt budget.
        let now = Utc::now();
        backend.promote_due(now + chrono::Duration::hours(2)).await.unwrap();
        let parked = backend.pop_ready(JobKind::SmsSend).await.unwrap().unwrap();
        assert_eq!(parked.attempt, 0);
    }

    #[tokio::test]
    async fn retryable_error_backs_off_exponentially() {
        let backend = Arc::new(MemoryQueueBackend::new());
        let (pool, _) = pool_with(
            backend.clone(),
            vec![
                Err(HandlerError::retryable("upstream 500")),
                Err(HandlerError::retryable("upstream 500")),
                Ok(JobOutcome::Completed),
            ],
        );
        enqueue_one(&backend).await;

        // Attempt 0 fails: retry parked 5s out.
        let result = pool.run_one(JobKind::SmsSend).await.unwrap().unwrap();
        match result {
            JobResult::Retried { delay } => assert_eq!(delay, Duration::from_secs(5)),
            other => panic!("expected Retried, got {other:?}"),
        }
        backend.promote_due(Utc::now() + chrono::Duration::seconds(6)).await.unwrap();

        // Attempt 1 fails: retry parked 10s out.
        let result = pool.run_one(JobKind::SmsSend).await.unwrap().unwrap();
        match result {
            JobResult::Retried { delay } => assert_eq!(delay, Duration::from_secs(10)),
            other => panic!("expected Retried, got {other:?}"),
        }
        backend.promote_due(Utc::now() + chrono::Duration::seconds(11)).await.unwrap();

        // Attempt 2 succeeds.
        let result = pool.run_one(JobKind::SmsSend).await.unwrap().unwrap();
        assert!(matches!(result, JobResult::Completed));
        assert!(backend.failed().is_empty());
    }

    #[tokio::test]
    async fn attempts_exhaust_into_failure() {
        let backend = Arc::new(MemoryQueueBackend::new());
        let (pool, handler) = pool_with(
            backend.clone(),
            vec![
                Err(HandlerError::retryable("boom")),
                Err(HandlerError::retryable("boom")),
                Err(HandlerError::retryable("boom")),
            ],
        );
        enqueue_one(&backend).await;

        for _ in 0..2 {
            let result = pool.run_one(JobKind::SmsSend).await.unwrap().unwrap();
            assert!(matches!(result, JobResult::Retried { .. }));
            backend.promote_due(Utc::now() + chrono::Duration::hours(1)).await.unwrap();
        }
        // Third attempt exhausts the budget of 3.
        let result = pool.run_one(JobKind::SmsSend).await.unwrap().unwrap();
        assert!(matches!(result, JobResult::Failed { .. }));
        assert_eq!(handler.calls(), 3);
        assert_eq!(backend.failed().len(), 1);
    }

    #[tokio::test]
    async fn fatal_error_fails_immediately() {
        let backend = Arc::new(MemoryQueueBackend::new());
        let (pool, handler) = pool_with(
            backend.clone(),
            vec![Err(HandlerError::fatal("campaign not found"))],
        );
        enqueue_one(&backend).await;

        let result = pool.run_one(JobKind::SmsSend).await.unwrap().unwrap();
        match result {
            JobResult::Failed { error } => assert_eq!(error, "campaign not found"),
            other => panic!("expected Failed, got {other:?}"),
        }
        assert_eq!(handler.calls(), 1);
        assert_eq!(backend.delayed_len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn run_one_on_empty_queue_returns_none() {
        let backend = Arc::new(MemoryQueueBackend::new());
        let (pool, _) = pool_with(backend, vec![]);
        assert!(pool.run_one(JobKind::SmsSend).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn spawned_pool_drains_the_queue() {
        let backend = Arc::new(MemoryQueueBackend::new());
        let (pool, handler) = pool_with(backend.clone(), vec![Ok(JobOutcome::Completed)]);
        enqueue_one(&backend).await;

        let shutdown = CancellationToken::new();
        let handles = pool.spawn(&shutdown);

        // Wait for the job to drain.
        for _ in 0..100 {
            if backend.completed().len() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(handler.calls(), 1);

        shutdown.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
