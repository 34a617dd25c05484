//! Crate-wide error taxonomy.
//!
//! Library code returns [`CoreError`] (or a narrower per-module enum that
//! converts into it); `anyhow` is reserved for the CLI boundary.

use thiserror::Error;

/// The error taxonomy from the processing core's retry/failure model.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Transient failure; the caller may retry with backoff.
    #[error("retryable error: {0}")]
    Retryable(String),

    /// Non-retryable failure: invalid input, validation failure, path-safety
    /// violation. Short-circuits the Runner's retry loop.
    #[error("fatal error: {0}")]
    Fatal(String),

    /// A referenced entity (task, stage, artifact) does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A repository method was called outside a transaction, or a
    /// transaction was entered re-entrantly.
    #[error("transaction misuse: {0}")]
    TransactionMisuse(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
}

impl CoreError {
    /// Whether the Pipeline Runner should retry the stage that produced this
    /// error. `Fatal` and `TransactionMisuse` never retry; everything else
    /// is treated as retryable per spec §7's propagation policy ("unexpected
    /// exceptions are treated as retryable").
    pub fn is_retryable(&self) -> bool {
        !matches!(self, CoreError::Fatal(_) | CoreError::TransactionMisuse(_))
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        CoreError::Fatal(msg.into())
    }

    pub fn retryable(msg: impl Into<String>) -> Self {
        CoreError::Retryable(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        CoreError::NotFound(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
