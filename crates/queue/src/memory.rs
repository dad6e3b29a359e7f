//! In-memory [`QueueBackend`] for tests and local development.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::backend::QueueBackend;
use crate::error::QueueError;
use crate::job::{Job, JobKind};

#[derive(Default)]
struct Inner {
    ready: HashMap<JobKind, VecDeque<Job>>,
    delayed: Vec<(DateTime<Utc>, Job)>,
    completed: Vec<Job>,
    failed: Vec<(Job, String)>,
}

/// In-memory queue backend. Promotion is explicit via
/// [`QueueBackend::promote_due`], which makes delayed-dispatch tests
/// deterministic without clock mocking.
#[derive(Default)]
pub struct MemoryQueueBackend {
    inner: Mutex<Inner>,
}

impl MemoryQueueBackend {
    /// Create a new, empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Completed-job archive, newest last.
    #[must_use]
    pub fn completed(&self) -> Vec<Job> {
        self.inner.lock().expect("queue lock poisoned").completed.clone()
    }

    /// Failed-job archive with final errors, newest last.
    #[must_use]
    pub fn failed(&self) -> Vec<(Job, String)> {
        self.inner.lock().expect("queue lock poisoned").failed.clone()
    }

    /// The `ready_at` instants of currently delayed jobs.
    #[must_use]
    pub fn delayed_ready_times(&self) -> Vec<DateTime<Utc>> {
        self.inner
            .lock()
            .expect("queue lock poisoned")
            .delayed
            .iter()
            .map(|(at, _)| *at)
            .collect()
    }
}

#[async_trait]
impl QueueBackend for MemoryQueueBackend {
    async fn push_ready(&self, job: &Job) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        inner.ready.entry(job.kind).or_default().push_back(job.clone());
        Ok(())
    }

    async fn push_delayed(&self, job: &Job, ready_at: DateTime<Utc>) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        inner.delayed.push((ready_at, job.clone()));
        Ok(())
    }

    async fn pop_ready(&self, kind: JobKind) -> Result<Option<Job>, QueueError> {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        Ok(inner.ready.entry(kind).or_default().pop_front())
    }

    async fn promote_due(&self, now: DateTime<Utc>) -> Result<u64, QueueError> {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        let mut promoted = 0;
        let mut remaining = Vec::with_capacity(inner.delayed.len());
        for (ready_at, job) in inner.delayed.drain(..).collect::<Vec<_>>() {
            if ready_at <= now {
                inner.ready.entry(job.kind).or_default().push_back(job);
                promoted += 1;
            } else {
                remaining.push((ready_at, job));
            }
        }
        inner.delayed = remaining;
        Ok(promoted)
    }

    async fn record_completed(&self, job: &Job) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        inner.completed.push(job.clone());
        let keep = job.opts.keep_completed;
        let len = inner.completed.len();
        if len > keep {
            inner.completed.drain(..len - keep);
        }
        Ok(())
    }

    async fn record_failed(&self, job: &Job, error: &str) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        inner.failed.push((job.clone(), error.to_owned()));
        let keep = job.opts.keep_failed;
        let len = inner.failed.len();
        if len > keep {
            inner.failed.drain(..len - keep);
        }
        Ok(())
    }

    async fn ready_len(&self, kind: JobKind) -> Result<u64, QueueError> {
        let inner = self.inner.lock().expect("queue lock poisoned");
        Ok(inner.ready.get(&kind).map_or(0, VecDeque::len) as u64)
    }

    async fn delayed_len(&self) -> Result<u64, QueueError> {
        let inner = self.inner.lock().expect("queue lock poisoned");
        Ok(inner.delayed.len() as u64)
    }
}
