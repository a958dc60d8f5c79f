//! Reliability policy applied around sinks and worker calls.
//!
//! ```text
//! op → [RetryPolicy: backoff, should_retry(err, attempt)] → fallback value
//! ```

pub mod retry;

pub use retry::{with_retry, with_retry_or, Backoff, RetryConfig, RetryPolicy};
