//! Error types for tally.

use thiserror::Error;
use uuid::Uuid;

/// Result type alias using tally's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for tally operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation failed (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Transaction not found or not visible to the caller
    #[error("Transaction not found: {0}")]
    TransactionNotFound(Uuid),

    /// Job not found
    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    /// The caller's lease on a job is no longer current; another worker owns it
    #[error("Lease lost on job {job_id}")]
    LeaseLost { job_id: Uuid },

    /// Classification call failed
    #[error("Classification error: {0}")]
    Classification(String),

    /// Classification call timed out; the true outcome is unknown, so the
    /// caller must treat this as retryable rather than a fallback result
    #[error("Classification timed out: {0}")]
    ClassificationTimeout(String),

    /// Job queue error
    #[error("Job error: {0}")]
    Job(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// HTTP/network request failed
    #[error("Request error: {0}")]
    Request(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// File I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::ClassificationTimeout(e.to_string())
        } else {
            Error::Request(e.to_string())
        }
    }
}
