//! Redis-backed [`QueueBackend`].
//!
//! Layout, all under a configurable prefix:
//!
//! - `{prefix}:jobs:{kind}` — ready list per kind (`RPUSH` / `LPOP`)
//! - `{prefix}:scheduled` — sorted set of delayed jobs, scored by their
//!   ready-at instant in epoch milliseconds, with the full job JSON as the
//!   member
//! - `{prefix}:completed:{kind}` / `{prefix}:failed:{kind}` — capped
//!   archives (`LPUSH` + `LTRIM`)
//!
//! Promotion moves due members from the sorted set to their ready lists in
//! one Lua script, so a job can never be observed in both places and a
//! crash between the two steps cannot drop it.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_redis::{Config, Pool, Runtime};
use redis::{AsyncCommands, Script};

use crate::backend::QueueBackend;
use crate::error::QueueError;
use crate::job::{Job, JobKind};

/// Atomically move due jobs from the scheduled set to their ready lists.
///
/// KEYS[1] = scheduled zset; ARGV[1] = now (epoch ms); ARGV[2] = batch cap;
/// ARGV[3] = key prefix. Members are job JSON; the kind is read out of the
/// JSON to pick the destination list.
const PROMOTE_DUE: &str = r"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, tonumber(ARGV[2]))
for _, member in ipairs(due) do
    local job = cjson.decode(member)
    redis.call('RPUSH', ARGV[3] .. ':jobs:' .. job['kind'], member)
    redis.call('ZREM', KEYS[1], member)
end
return #due
";

/// How many delayed jobs a single promotion pass moves at most.
const PROMOTE_BATCH: usize = 128;

/// Configuration for the Redis queue backend.
#[derive(Debug, Clone)]
pub struct RedisQueueConfig {
    /// Redis connection URL (e.g. `redis://127.0.0.1:6379`).
    pub url: String,

    /// Key prefix applied to every queue key.
    pub prefix: String,

    /// Number of connections in the `deadpool-redis` pool.
    pub pool_size: usize,

    /// Timeout for acquiring a pooled connection.
    pub connection_timeout: Duration,
}

impl Default for RedisQueueConfig {
    fn default() -> Self {
        Self {
            url: String::from("redis://127.0.0.1:6379"),
            prefix: String::from("leafline:queue"),
            pool_size: 10,
            connection_timeout: Duration::from_secs(5),
        }
    }
}

impl RedisQueueConfig {
    /// Create a configuration for the given URL with default settings.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }
}

/// Redis-backed implementation of [`QueueBackend`].
pub struct RedisQueueBackend {
    pool: Pool,
    prefix: String,
}

impl RedisQueueBackend {
    /// Create a new backend from the provided configuration.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Connection`] if the pool cannot be created.
    pub fn new(config: &RedisQueueConfig) -> Result<Self, QueueError> {
        let cfg = Config::from_url(&config.url);
        let pool = cfg
            .builder()
            .map(|b| {
                b.max_size(config.pool_size)
                    .wait_timeout(Some(config.connection_timeout))
                    .runtime(Runtime::Tokio1)
                    .build()
            })
            .map_err(|e| QueueError::Connection(e.to_string()))?
            .map_err(|e| QueueError::Connection(e.to_string()))?;

        Ok(Self {
            pool,
            prefix: config.prefix.clone(),
        })
    }

    fn ready_key(&self, kind: JobKind) -> String {
        format!("{}:jobs:{kind}", self.prefix)
    }

    fn scheduled_key(&self) -> String {
        format!("{}:scheduled", self.prefix)
    }

    fn completed_key(&self, kind: JobKind) -> String {
        format!("{}:completed:{kind}", self.prefix)
    }

    fn failed_key(&self, kind: JobKind) -> String {
        format!("{}:failed:{kind}", self.prefix)
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection, QueueError> {
        self.pool
            .get()
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))
    }
}

fn encode(job: &Job) -> Result<String, QueueError> {
    serde_json::to_string(job).map_err(|e| QueueError::Serialization(e.to_string()))
}

fn decode(raw: &str) -> Result<Job, QueueError> {
    serde_json::from_str(raw).map_err(|e| QueueError::Serialization(e.to_string()))
}

#[async_trait]
impl QueueBackend for RedisQueueBackend {
    async fn push_ready(&self, job: &Job) -> Result<(), QueueError> {
        let mut conn = self.conn().await?;
        let () = conn
            .rpush(self.ready_key(job.kind), encode(job)?)
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn push_delayed(&self, job: &Job, ready_at: DateTime<Utc>) -> Result<(), QueueError> {
        let mut conn = self.conn().await?;
        let () = conn
            .zadd(self.scheduled_key(), encode(job)?, ready_at.timestamp_millis())
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn pop_ready(&self, kind: JobKind) -> Result<Option<Job>, QueueError> {
        let mut conn = self.conn().await?;
        let raw: Option<String> = conn
            .lpop(self.ready_key(kind), None)
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;
        raw.as_deref().map(decode).transpose()
    }

    async fn promote_due(&self, now: DateTime<Utc>) -> Result<u64, QueueError> {
        let mut conn = self.conn().await?;
        let script = Script::new(PROMOTE_DUE);
        let promoted: u64 = script
            .key(self.scheduled_key())
            .arg(now.timestamp_millis())
            .arg(PROMOTE_BATCH)
            .arg(&self.prefix)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;
        Ok(promoted)
    }

    async fn record_completed(&self, job: &Job) -> Result<(), QueueError> {
        let key = self.completed_key(job.kind);
        let mut conn = self.conn().await?;
        let () = conn
            .lpush(&key, encode(job)?)
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;
        let keep = isize::try_from(job.opts.keep_completed).unwrap_or(isize::MAX);
        let () = conn
            .ltrim(&key, 0, keep - 1)
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn record_failed(&self, job: &Job, error: &str) -> Result<(), QueueError> {
        let key = self.failed_key(job.kind);
        let entry = serde_json::json!({ "job": job, "error": error });
        let mut conn = self.conn().await?;
        let () = conn
            .lpush(&key, entry.to_string())
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;
        let keep = isize::try_from(job.opts.keep_failed).unwrap_or(isize::MAX);
        let () = conn
            .ltrim(&key, 0, keep - 1)
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn ready_len(&self, kind: JobKind) -> Result<u64, QueueError> {
        let mut conn = self.conn().await?;
        conn.llen(self.ready_key(kind))
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))
    }

    async fn delayed_len(&self) -> Result<u64, QueueError> {
        let mut conn = self.conn().await?;
        conn.zcard(self.scheduled_key())
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))
    }
}
