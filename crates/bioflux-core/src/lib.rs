//! bioflux-core: foundation traits and types for BioFlux.
//!
//! # Overview
//!
//! BioFlux coalesces high-frequency organism updates (mutation-rate changes,
//! GPU draw submissions) into bounded batches and offloads neural computation
//! to a background worker. The core crate defines:
//!
//! - [`BatchRequest`] / [`BatchedResult`] / [`Priority`]: batching data model
//! - [`CombinationStrategy`] / [`ScalarCombiner`]: numeric batch reducers
//! - [`Combiner`] / [`BatchSink`]: the seams every batching pipeline plugs into
//! - [`BatchError`] / [`SinkError`]: structured error types
//! - [`report`] module: injected error reporter and `safe_execute` helpers
//! - [`policy`] module: retry with caller-controlled backoff

pub mod combine;
pub mod error;
pub mod policy;
pub mod report;
pub mod request;
pub mod sink;

pub use combine::{CombinationStrategy, ScalarCombiner, ValueDomain};
pub use error::{BatchError, SinkError};
pub use report::{ErrorContext, ErrorReport, ErrorReporter, RecordingReporter, Severity, TracingReporter};
pub use request::{BatchRequest, BatchToken, BatchedResult, Priority};
pub use sink::{BatchSink, Combiner};
