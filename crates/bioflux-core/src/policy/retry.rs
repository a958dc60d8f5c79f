//! Retry policy with caller-controlled backoff.
//!
//! Linear backoff (`initial_backoff * attempt`) is the default; exponential
//! growth is available for callers that want it. Both are capped at
//! `max_backoff`.

use std::future::Future;
use std::time::Duration;

use tokio_retry::RetryIf;

use crate::report::{ErrorContext, ErrorReporter, Severity};

/// How the delay grows between attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    /// `initial_backoff * attempt`.
    Linear,
    /// `initial_backoff * multiplier^(attempt - 1)`.
    Exponential { multiplier: f64 },
}

/// Configuration for the retry policy.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (not counting the first try).
    pub max_retries: u32,
    /// Base backoff delay.
    pub initial_backoff: Duration,
    /// Maximum backoff delay.
    pub max_backoff: Duration,
    pub backoff: Backoff,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            backoff: Backoff::Linear,
        }
    }
}

/// Stateless retry policy: computes the next delay given the attempt number.
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    pub config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Returns the delay before the `attempt`-th retry (1-based).
    /// Returns `None` if `attempt` exceeds `max_retries`.
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.config.max_retries {
            return None;
        }
        let base_ms = self.config.initial_backoff.as_millis() as f64;
        let raw_ms = match self.config.backoff {
            Backoff::Linear => base_ms * attempt as f64,
            Backoff::Exponential { multiplier } => base_ms * multiplier.powi((attempt - 1) as i32),
        };
        let cap_ms = self.config.max_backoff.as_millis() as f64;
        Some(Duration::from_millis(raw_ms.min(cap_ms) as u64))
    }

    /// Returns `true` if any retries remain after `attempt` failures.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt <= self.config.max_retries
    }

    /// The full delay schedule, one entry per permitted retry.
    pub fn delays(&self) -> Vec<Duration> {
        (1..=self.config.max_retries)
            .filter_map(|attempt| self.next_delay(attempt))
            .collect()
    }
}

/// Run `op` until it succeeds, `should_retry` declines, or retries run out.
///
/// Every failure is reported: as a warning while another attempt follows,
/// as an error for the failure that is returned.
pub async fn with_retry<T, E, Op, Fut, P>(
    policy: &RetryPolicy,
    reporter: &dyn ErrorReporter,
    context: ErrorContext,
    mut should_retry: P,
    op: Op,
) -> Result<T, E>
where
    Op: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: FnMut(&E, u32) -> bool,
{
    let mut attempt = 0u32;
    let condition = |err: &E| {
        attempt += 1;
        let retry = policy.should_retry(attempt) && should_retry(err, attempt);
        let severity = if retry {
            Severity::Warning
        } else {
            Severity::Error
        };
        reporter.report(context.report(severity, err.to_string()).with_attempt(attempt));
        retry
    };
    RetryIf::spawn(policy.delays(), op, condition).await
}

/// Like [`with_retry`] but returns `fallback` once retries are exhausted.
pub async fn with_retry_or<T, E, Op, Fut, P>(
    policy: &RetryPolicy,
    reporter: &dyn ErrorReporter,
    context: ErrorContext,
    should_retry: P,
    fallback: T,
    op: Op,
) -> T
where
    Op: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: FnMut(&E, u32) -> bool,
{
    with_retry(policy, reporter, context, should_retry, op)
        .await
        .unwrap_or(fallback)
}
