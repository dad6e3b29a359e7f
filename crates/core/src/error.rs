use thiserror::Error;

/// Top-level error type for the Leafline platform.
#[derive(Debug, Error)]
pub enum LeaflineError {
    #[error("store error: {0}")]
    Store(String),

    #[error("queue error: {0}")]
    Queue(String),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("compliance error: {0}")]
    Compliance(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("{0}")]
    Other(String),
}
