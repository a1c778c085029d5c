//! Error types for the object pools

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PoolError {
    /// A blocking call was aborted because the calling thread was
    /// interrupted. Always recoverable; the interrupt flag has been
    /// consumed when this is returned.
    #[error("blocking pool operation was interrupted")]
    Interrupted,

    /// The mutex guarding the resource has been permanently cancelled.
    #[error("mutex received cancellation signal")]
    Cancelled,

    /// The pool has been closed; no further objects can be borrowed.
    #[error("pool is closed")]
    Closed,

    /// The pool was constructed with an invalid configuration.
    #[error("invalid pool configuration: {0}")]
    Configuration(&'static str),

    /// An opaque error raised by the object factory while creating or
    /// destroying a resource.
    #[error("object factory error: {0}")]
    Factory(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),
}

impl PoolError {
    /// Wrap an arbitrary factory failure.
    pub fn factory(error: impl Into<Box<dyn std::error::Error + Send + Sync + 'static>>) -> Self {
        Self::Factory(error.into())
    }
}

pub type PoolResult<T> = Result<T, PoolError>;
