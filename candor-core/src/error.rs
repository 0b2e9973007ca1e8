//! Error types for candor-core

use thiserror::Error;

/// Main error type for the candor-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Consent denied for the event's modality; the event was not queued
    #[error("consent denied for modality: {0}")]
    ConsentDenied(String),

    /// Queue is at capacity; the caller should back off and retry
    #[error("event queue is full ({0} events)")]
    QueueFull(usize),

    /// Batch body could not be encoded for the wire
    #[error("serialization failure: {0}")]
    Serialization(String),

    /// Batch delivery failed
    #[error("upload error ({kind:?}): {message}")]
    Upload {
        kind: UploadErrorKind,
        message: String,
    },

    /// Queued event not found
    #[error("queued event not found: {0}")]
    EventNotFound(i64),
}

/// Classification of a failed delivery attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadErrorKind {
    /// Transport-level failure or retryable status (429, 5xx); safe to retry
    Transient,
    /// Non-retryable server response; the batch is abandoned for this attempt
    Permanent,
}

impl Error {
    /// Build a transient upload error
    pub fn transient_upload(message: impl Into<String>) -> Self {
        Error::Upload {
            kind: UploadErrorKind::Transient,
            message: message.into(),
        }
    }

    /// Build a permanent upload error
    pub fn permanent_upload(message: impl Into<String>) -> Self {
        Error::Upload {
            kind: UploadErrorKind::Permanent,
            message: message.into(),
        }
    }

    /// True if this error may succeed on a later attempt
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Upload {
                kind: UploadErrorKind::Transient,
                ..
            }
        )
    }
}

/// Result type alias for candor-core
pub type Result<T> = std::result::Result<T, Error>;
