//! Offload and kernel error types.

use thiserror::Error;

use crate::offload::OffloadState;

/// Errors raised by the neural kernel and the network registry.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum NetworkError {
    #[error("duplicate node id: {0}")]
    DuplicateNode(String),

    /// An edge endpoint names a node that does not exist.
    #[error("unknown node id: {0}")]
    UnknownNode(String),

    #[error("unknown network: {0}")]
    UnknownNetwork(String),
}

/// Errors returned by [`AsyncComputeOffload::send`](crate::AsyncComputeOffload::send).
#[derive(Debug, Clone, PartialEq, Error)]
pub enum OffloadError {
    /// No worker is accepting requests in the current state.
    #[error("worker unavailable (state: {state})")]
    Unavailable { state: OffloadState },

    /// No response arrived before the request's deadline.
    #[error("worker request timed out after {ms}ms")]
    Timeout { ms: u64 },

    /// The worker raised a fault while this request was in flight.
    #[error("worker fault: {0}")]
    WorkerFault(String),

    /// The request could not be handed to the worker.
    #[error("delivery to worker failed: {0}")]
    Delivery(String),

    /// The worker processed the request and answered with an error.
    #[error("worker error: {0}")]
    Remote(String),

    #[error("offload terminated")]
    Terminated,

    /// The worker could not be started.
    #[error("worker spawn failed: {0}")]
    Spawn(String),

    /// The worker answered with a payload of the wrong kind.
    #[error("unexpected worker response, expected {0}")]
    UnexpectedResponse(&'static str),
}

impl OffloadError {
    /// Returns `true` if the same request may succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Returns `true` if the worker itself is gone or broken.
    pub fn is_worker_failure(&self) -> bool {
        matches!(
            self,
            Self::WorkerFault(_) | Self::Delivery(_) | Self::Spawn(_) | Self::Unavailable { .. }
        )
    }
}
