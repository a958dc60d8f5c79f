//! Batching-layer error types.

use thiserror::Error;

/// Errors raised by a batch sink while delivering a combined batch.
#[derive(Debug, Clone, Error)]
pub enum SinkError {
    /// The downstream consumer refused the batch.
    #[error("sink rejected batch: {0}")]
    Rejected(String),

    /// GPU submission failed (buffer upload, draw).
    #[error("graphics submission failed: {0}")]
    Graphics(String),

    /// The downstream consumer is temporarily unavailable.
    #[error("sink unavailable: {0}")]
    Unavailable(String),
}

impl SinkError {
    /// Returns `true` if delivering the same batch again may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Errors surfaced by batch coordinators and their adapters.
#[derive(Debug, Error)]
pub enum BatchError {
    /// Input rejected at a construction boundary (e.g. empty vertex array).
    #[error("invalid request: {0}")]
    Validation(String),

    /// The sink failed; the drained requests were re-queued.
    #[error("flush failed: {0}")]
    Sink(#[from] SinkError),

    /// Graphics resource allocation failed.
    #[error("graphics resource error: {0}")]
    Graphics(String),

    /// The coordinator was disposed and accepts no further requests.
    #[error("batch coordinator disposed")]
    Disposed,
}

impl BatchError {
    /// Returns `true` if this error is transient.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Sink(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Returns `true` if the caller supplied invalid input.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}
