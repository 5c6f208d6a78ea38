//! Error types for payload encoding and decoding.

use thiserror::Error;

/// Errors that can occur when handling wire payloads.
#[derive(Debug, Error)]
pub enum MessageError {
    /// The payload could not be decoded.
    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The payload was empty where a body is required.
    #[error("empty payload")]
    Empty,
}
