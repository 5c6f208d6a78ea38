//! Bus error types.

use thiserror::Error;

/// Transport failures. None of these are retried: the operation is lost and
/// the caller must re-invoke it.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("publish to {subject} failed: {message}")]
    Publish { subject: String, message: String },

    #[error("subscribe to {subject} failed: {message}")]
    Subscribe { subject: String, message: String },

    #[error("bus closed")]
    Closed,
}
