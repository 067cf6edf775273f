//! Error taxonomy for the context tracking core.
//!
//! Capacity exhaustion on the hot path is not an error. A full allocator,
//! a full expiration bucket or a reached storage limit surfaces as `None`,
//! `false` or an [`AddResult`].
//!
//! [`AddResult`]: crate::context::sequence::AddResult

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// A protocol violation, such as using an encoder after it was finished.
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// The encoder was asked to start more threads than it was sized for.
    #[error("thread limit reached ({limit} threads)")]
    ThreadLimitReached { limit: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Input that cannot be decoded as a persisted context blob.
    #[error("malformed context data: {0}")]
    Malformed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn illegal_state(msg: impl Into<String>) -> Self {
        Error::IllegalState(msg.into())
    }

    pub(crate) fn malformed(msg: impl Into<String>) -> Self {
        Error::Malformed(msg.into())
    }

    pub(crate) fn invalid_config(msg: impl Into<String>) -> Self {
        Error::InvalidConfig(msg.into())
    }
}
