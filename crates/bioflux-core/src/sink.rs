//! The seams every batching pipeline plugs into: a combiner and a sink.

use async_trait::async_trait;
use tokio::time::Instant;

use crate::error::SinkError;
use crate::request::BatchRequest;

/// Reduces a drained batch into the value handed to the sink.
///
/// Implementations must be pure: the coordinator may call `combine` while
/// new requests are being queued on other tasks.
pub trait Combiner<T>: Send + Sync + 'static {
    /// The combined batch delivered to the sink.
    type Output: Send + 'static;

    /// Correct a value into its valid domain before it is queued.
    fn normalize(&self, value: T) -> T {
        value
    }

    /// Contribution of one request towards the coordinator's `max_weight`.
    fn weight(&self, _value: &T) -> usize {
        1
    }

    /// Combine a non-empty batch. `now` is the flush time.
    fn combine(&self, batch: &[BatchRequest<T>], now: Instant) -> Self::Output;
}

/// Downstream consumer of combined batches (state update, GPU submission).
///
/// Returning an error makes the coordinator re-queue the drained requests.
#[async_trait]
pub trait BatchSink<R: Send + 'static>: Send + Sync + 'static {
    async fn deliver(&self, batch: R) -> Result<(), SinkError>;
}
