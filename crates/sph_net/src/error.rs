//! Network-layer error types.

use crate::framing::FrameError;

/// Errors that can occur while exchanging control-plane messages.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    /// Failed to encode a message to MessagePack.
    #[error("failed to encode message: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// Failed to decode a message from MessagePack.
    #[error("failed to decode message: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// Failed to encode or decode a JSON line.
    #[error("malformed JSON line: {0}")]
    Json(#[from] serde_json::Error),

    /// A length-prefixed frame could not be read or written.
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// Socket I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer closed the connection before replying.
    #[error("connection closed by peer")]
    Closed,

    /// The pool endpoint refused the session.
    #[error("session rejected: {0}")]
    Rejected(String),

    /// The peer sent a well-formed message that is not valid at this point
    /// of the session.
    #[error("protocol violation: {0}")]
    Protocol(String),
}
