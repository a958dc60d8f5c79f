//! Combination strategies reducing a scalar batch to one value.

use std::time::Duration;

use tokio::time::Instant;

use crate::request::{batch_priority, batch_timespan, BatchRequest, BatchedResult};
use crate::sink::Combiner;

/// Recency decay constant for the `weighted` strategy.
pub const RECENCY_SCALE: Duration = Duration::from_millis(1000);

/// Closed numeric range a combined value is clamped into.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValueDomain {
    pub min: f64,
    pub max: f64,
}

impl ValueDomain {
    /// The `[0, 1]` domain used for rates.
    pub const UNIT: Self = Self { min: 0.0, max: 1.0 };

    pub fn new(min: f64, max: f64) -> Self {
        if min <= max {
            Self { min, max }
        } else {
            Self { min: max, max: min }
        }
    }

    /// Clamp `value` into the domain. NaN maps to `min`.
    pub fn clamp(&self, value: f64) -> f64 {
        if value.is_nan() {
            self.min
        } else {
            value.clamp(self.min, self.max)
        }
    }
}

impl Default for ValueDomain {
    fn default() -> Self {
        Self::UNIT
    }
}

/// How a batch of scalar requests is reduced to one value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CombinationStrategy {
    /// Arithmetic mean.
    Average,
    /// Largest value.
    Max,
    /// Sum, clamped at the domain ceiling.
    Sum,
    /// Mean weighted by priority and recency.
    #[default]
    Weighted,
}

impl CombinationStrategy {
    /// Combine `batch` and clamp the result into `domain`.
    ///
    /// An empty batch yields `domain.min`.
    pub fn combine(&self, batch: &[BatchRequest<f64>], now: Instant, domain: ValueDomain) -> f64 {
        if batch.is_empty() {
            return domain.min;
        }
        let raw = match self {
            Self::Average => batch.iter().map(|r| r.value).sum::<f64>() / batch.len() as f64,
            Self::Max => batch.iter().map(|r| r.value).fold(f64::NEG_INFINITY, f64::max),
            Self::Sum => batch.iter().map(|r| r.value).sum(),
            Self::Weighted => weighted(batch, now),
        };
        domain.clamp(raw)
    }
}

impl std::fmt::Display for CombinationStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Average => write!(f, "average"),
            Self::Max => write!(f, "max"),
            Self::Sum => write!(f, "sum"),
            Self::Weighted => write!(f, "weighted"),
        }
    }
}

impl std::str::FromStr for CombinationStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "average" => Ok(Self::Average),
            "max" => Ok(Self::Max),
            "sum" => Ok(Self::Sum),
            "weighted" => Ok(Self::Weighted),
            other => Err(format!("unknown combination strategy: {other}")),
        }
    }
}

/// `Σ(v·p·r) / Σ(p·r)` with `r = exp(-age / 1s)`.
///
/// When every weight underflows to zero the result is `0.0`.
fn weighted(batch: &[BatchRequest<f64>], now: Instant) -> f64 {
    let scale = RECENCY_SCALE.as_secs_f64();
    let (numerator, denominator) = batch.iter().fold((0.0, 0.0), |(num, den), r| {
        let recency = (-r.age(now).as_secs_f64() / scale).exp();
        let w = r.priority.weight() * recency;
        (num + r.value * w, den + w)
    });
    if denominator > 0.0 && denominator.is_finite() {
        numerator / denominator
    } else {
        0.0
    }
}

/// Combiner for scalar (rate-like) requests.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScalarCombiner {
    pub strategy: CombinationStrategy,
    pub domain: ValueDomain,
}

impl ScalarCombiner {
    pub fn new(strategy: CombinationStrategy, domain: ValueDomain) -> Self {
        Self { strategy, domain }
    }
}

impl Combiner<f64> for ScalarCombiner {
    type Output = BatchedResult;

    fn normalize(&self, value: f64) -> f64 {
        self.domain.clamp(value)
    }

    fn combine(&self, batch: &[BatchRequest<f64>], now: Instant) -> BatchedResult {
        BatchedResult {
            combined_value: self.strategy.combine(batch, now, self.domain),
            request_count: batch.len(),
            timespan: batch_timespan(batch),
            priority: batch_priority(batch),
        }
    }
}
