pub mod backend;
pub mod error;
pub mod job;
pub mod limiter;
pub mod memory;
pub mod producer;
pub mod redis;
pub mod worker;

pub use backend::QueueBackend;
pub use error::QueueError;
pub use job::{Job, JobKind, JobOptions, backoff_delay};
pub use limiter::TokenBucket;
pub use memory::MemoryQueueBackend;
pub use producer::Queue;
pub use redis::{RedisQueueBackend, RedisQueueConfig};
pub use worker::{HandlerError, JobHandler, JobOutcome, JobResult, WorkerConfig, WorkerPool};
