//! Pool error types.

use std::io;

use connpool_core::ContextError;

/// Errors surfaced by pool operations.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// The dialer failed to establish a connection. Never retried.
    #[error("dial failed")]
    Dial(#[source] io::Error),

    /// The caller's context was cancelled before a connection was available.
    #[error("acquire canceled")]
    Canceled,

    /// The caller's deadline elapsed before a connection was available.
    #[error("acquire deadline exceeded")]
    DeadlineExceeded,

    /// The transport failed to shut down while a connection was discarded.
    /// The connection has already left the pool when this is reported.
    #[error("close failed")]
    Close(#[source] io::Error),

    /// A released connection found no admission token to give back.
    #[error("open-connection accounting violated: no token to release")]
    AccountingInvariantViolation,
}

impl PoolError {
    /// Whether this error comes from the caller's context firing.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, PoolError::Canceled | PoolError::DeadlineExceeded)
    }
}

impl From<ContextError> for PoolError {
    fn from(reason: ContextError) -> Self {
        match reason {
            ContextError::Canceled => PoolError::Canceled,
            ContextError::DeadlineExceeded => PoolError::DeadlineExceeded,
        }
    }
}
