//! Error types for stream construction and control
//!
//! Real-time callbacks never return these. They raise [`Faults`](crate::audio::Faults)
//! bits instead, which the control thread turns into a `StreamError` when it
//! reaps the stream.

use thiserror::Error;

/// Errors surfaced to the control thread
#[derive(Error, Debug)]
pub enum StreamError {
    /// Device missing or busy at open time
    #[error("Audio device unavailable: {0}")]
    DeviceUnavailable(String),

    /// File cannot be created, written or read
    #[error("Storage error: {0}")]
    Storage(String),

    /// Incompatible sample rate or channel count
    #[error("Format mismatch: {0}")]
    FormatMismatch(String),

    /// Invalid pairing of devices or settings
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// Device lost mid-stream; whatever was captured has been finalized
    #[error("Stream aborted: {0}")]
    StreamAborted(String),
}

impl From<std::io::Error> for StreamError {
    fn from(e: std::io::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<hound::Error> for StreamError {
    fn from(e: hound::Error) -> Self {
        match e {
            hound::Error::IoError(e) => Self::Storage(e.to_string()),
            hound::Error::FormatError(msg) => Self::FormatMismatch(msg.to_string()),
            other => Self::FormatMismatch(other.to_string()),
        }
    }
}

/// Result type for stream operations
pub type StreamResult<T> = Result<T, StreamError>;
