//! Error handling utils.
//!
//! Retryable readiness errors (`EAGAIN`/`EWOULDBLOCK`/connect's `EINPROGRESS`)
//! never reach this type: the reactor intercepts them and converts them into
//! a readiness wait. Anything that does surface here is either a genuine
//! syscall failure, a cancellation delivered across a suspension point, or a
//! caller mistake (invalid argument).

use std::io;

/// A specialized [`Result`] type for the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Represents all error cases produced by the reactor and its I/O operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Delivered when the fiber performing the operation was resumed with
    /// the cancellation sentinel instead of a normal value. Per the
    /// suspend/resume contract, any watcher the operation had armed is
    /// guaranteed to already be stopped by the time this is returned.
    #[error("fiber was cancelled while suspended")]
    Cancelled,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl Error {
    pub(crate) fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }
}
