//! Error kinds surfaced by the capture buffer.
//! Variants carry owned strings so a single result can be shared by every
//! caller awaiting the same drain.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, BufferError>;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum BufferError {
    /// Payload width does not match the configured `recordDataSize`.
    #[error("record-size mismatch: expected {expected} values, got {actual}")]
    RecordSizeMismatch { expected: usize, actual: usize },

    #[error("frame {frame} out of range (length {length})")]
    FrameOutOfRange { frame: i64, length: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("codec error: {0}")]
    Codec(String),

    /// A chunk submission was rejected; the chunk stays queued.
    #[error("delivery of chunk {chunk} failed: {message}")]
    Delivery {
        chunk: usize,
        status: Option<u16>,
        message: String,
    },

    /// Advisory only: the outbound queue is longer than the threshold.
    #[error("outbound queue depth {depth} exceeds {threshold}, data may be lost")]
    Backpressure { depth: usize, threshold: usize },

    #[error("server too slow: drain did not finish within {timeout_ms}ms")]
    DrainTimeout { timeout_ms: u64 },

    #[error("load failed: {0}")]
    Load(String),

    #[error("buffer is disabled")]
    Disabled,

    #[error("transport error: {0}")]
    Transport(String),
}

impl From<serde_json::Error> for BufferError {
    fn from(e: serde_json::Error) -> Self {
        BufferError::Codec(e.to_string())
    }
}

impl From<reqwest::Error> for BufferError {
    fn from(e: reqwest::Error) -> Self {
        BufferError::Transport(e.to_string())
    }
}
