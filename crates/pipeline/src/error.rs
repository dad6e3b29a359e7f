use thiserror::Error;

use leafline_provider::ProviderError;
use leafline_queue::QueueError;
use leafline_store::StoreError;

/// Errors from pipeline operations.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("serialization error: {0}")]
    Serialization(String),
}
