//! Error types for jitter buffer operations.

use std::io;
use thiserror::Error;

/// Errors surfaced by buffer construction and the queue operations.
///
/// Everything else the buffer encounters at runtime (a full ring, a record
/// that expired, a late update losing its race with the reader) is a normal
/// condition: it is logged, counted in [`crate::Metrics`], and reflected in
/// the short element count the operation returns.
#[derive(Debug, Error)]
pub enum JitterError {
    /// A parameter or destination buffer did not meet the documented
    /// contract. The call had no effect.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The doubly-mapped virtual memory region backing the ring could not
    /// be created. Partial mapping state has been unwound.
    #[error("virtual memory allocation failed")]
    ResourceExhaustion(#[source] io::Error),
}

impl JitterError {
    pub(crate) fn invalid_argument(message: impl Into<String>) -> Self {
        JitterError::InvalidArgument(message.into())
    }
}
