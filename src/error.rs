//! Error types for dubbo-client.

use thiserror::Error;

/// Main error type for all client operations.
#[derive(Debug, Error)]
pub enum DubboError {
    /// I/O error during socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Payload serialization error.
    #[error("encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// Payload deserialization error.
    #[error("decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// Protocol error (bad magic, malformed frame, span overflow, etc.).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Response arena capacity exceeded. The affected request is rejected;
    /// the connection stays alive.
    #[error("response buffer exhausted: need {needed} bytes, {available} available")]
    BufferExhausted { needed: usize, available: usize },

    /// Socket-level failure. Affects only the in-flight requests of the
    /// connection that errored.
    #[error("transport error: {0}")]
    Transport(String),

    /// The provider answered with a non-OK status or a remote exception.
    #[error("remote error: {0}")]
    Remote(String),

    /// No matching provider, or the provider does not advertise the method.
    #[error("not found: {0}")]
    NotFound(String),

    /// The response did not arrive within the configured call timeout.
    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Connection closed or evicted while the request was queued.
    #[error("connection closed")]
    ConnectionClosed,
}

/// Result type alias using DubboError.
pub type Result<T> = std::result::Result<T, DubboError>;
