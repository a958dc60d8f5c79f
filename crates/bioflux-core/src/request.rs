//! Batching data model: priorities, tokens, queued requests and batch results.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Request priority. `High` forces an immediate flush.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl Priority {
    /// Weight used by the `weighted` combination strategy.
    pub fn weight(self) -> f64 {
        match self {
            Self::Low => 1.0,
            Self::Normal => 2.0,
            Self::High => 3.0,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Normal => write!(f, "normal"),
            Self::High => write!(f, "high"),
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            other => Err(format!("unknown priority: {other}")),
        }
    }
}

/// Opaque handle returned by `add()`, used to cancel a still-pending request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BatchToken(pub u64);

impl std::fmt::Display for BatchToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "batch#{}", self.0)
    }
}

/// A queued request. Owned by a coordinator's pending collection until drained.
#[derive(Debug, Clone)]
pub struct BatchRequest<T> {
    pub token: BatchToken,
    pub value: T,
    pub timestamp: Instant,
    pub priority: Priority,
}

impl<T> BatchRequest<T> {
    /// Create a request stamped with the current (monotonic) time.
    pub fn new(token: BatchToken, value: T, priority: Priority) -> Self {
        Self::with_timestamp(token, value, priority, Instant::now())
    }

    pub fn with_timestamp(
        token: BatchToken,
        value: T,
        priority: Priority,
        timestamp: Instant,
    ) -> Self {
        Self {
            token,
            value,
            timestamp,
            priority,
        }
    }

    /// Time this request has been waiting as of `now`.
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.timestamp)
    }
}

/// The outcome of combining a scalar batch.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchedResult {
    pub combined_value: f64,
    pub request_count: usize,
    /// `max(timestamp) - min(timestamp)` over the batch members.
    pub timespan: Duration,
    /// Highest priority present in the batch.
    pub priority: Priority,
}

/// Highest priority among `batch` (`Low` for an empty batch).
pub fn batch_priority<T>(batch: &[BatchRequest<T>]) -> Priority {
    batch
        .iter()
        .map(|r| r.priority)
        .max()
        .unwrap_or(Priority::Low)
}

/// `max(timestamp) - min(timestamp)` over exactly the requests in `batch`.
pub fn batch_timespan<T>(batch: &[BatchRequest<T>]) -> Duration {
    let mut iter = batch.iter().map(|r| r.timestamp);
    let Some(first) = iter.next() else {
        return Duration::ZERO;
    };
    let (min, max) = iter.fold((first, first), |(lo, hi), t| (lo.min(t), hi.max(t)));
    max.saturating_duration_since(min)
}
