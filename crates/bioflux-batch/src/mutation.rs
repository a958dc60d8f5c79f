//! Mutation-rate batching.
//!
//! Bursts of mutation-rate changes coming from the UI are combined (weighted
//! by priority and recency by default) and applied to the organism once per
//! batch. Application goes through the retry policy so a transiently
//! unavailable state store does not immediately re-queue the batch.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use bioflux_core::combine::{CombinationStrategy, ScalarCombiner, ValueDomain};
use bioflux_core::error::{BatchError, SinkError};
use bioflux_core::policy::{with_retry, Backoff, RetryConfig, RetryPolicy};
use bioflux_core::report::{ErrorContext, ErrorReporter};
use bioflux_core::request::{BatchToken, BatchedResult, Priority};
use bioflux_core::sink::BatchSink;

use crate::coordinator::{BatchConfig, BatchCoordinator, BatchStatistics};
use crate::schedule::FlushTrigger;

const COMPONENT: &str = "mutation-batch";

/// Organism state that receives combined mutation rates.
#[async_trait]
pub trait MutationTarget: Send + Sync + 'static {
    async fn apply_mutation_rate(&self, batch: &BatchedResult) -> Result<(), SinkError>;
}

/// Point-in-time view of [`OrganismState`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OrganismSnapshot {
    pub mutation_rate: f64,
    pub applied_batches: u64,
    pub last_priority: Option<Priority>,
}

/// In-memory organism state. Cloning shares the same state.
#[derive(Debug, Clone, Default)]
pub struct OrganismState {
    inner: Arc<Mutex<OrganismSnapshot>>,
}

impl OrganismState {
    pub fn new(mutation_rate: f64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(OrganismSnapshot {
                mutation_rate,
                ..Default::default()
            })),
        }
    }

    pub fn snapshot(&self) -> OrganismSnapshot {
        self.inner.lock().unwrap().clone()
    }
}

#[async_trait]
impl MutationTarget for OrganismState {
    async fn apply_mutation_rate(&self, batch: &BatchedResult) -> Result<(), SinkError> {
        let mut state = self.inner.lock().unwrap();
        state.mutation_rate = batch.combined_value;
        state.applied_batches += 1;
        state.last_priority = Some(batch.priority);
        Ok(())
    }
}

/// Configuration for [`MutationBatchAdapter`].
#[derive(Debug, Clone)]
pub struct MutationBatchConfig {
    pub batch: BatchConfig,
    pub debounce: Duration,
    pub strategy: CombinationStrategy,
    pub domain: ValueDomain,
    /// Retries applied inside a single flush before the batch is re-queued.
    pub retry: RetryConfig,
}

impl Default for MutationBatchConfig {
    fn default() -> Self {
        Self {
            batch: BatchConfig::default(),
            debounce: Duration::from_millis(100),
            strategy: CombinationStrategy::Weighted,
            domain: ValueDomain::UNIT,
            retry: RetryConfig {
                max_retries: 2,
                initial_backoff: Duration::from_millis(50),
                max_backoff: Duration::from_millis(500),
                backoff: Backoff::Linear,
            },
        }
    }
}

struct MutationSink {
    target: Arc<dyn MutationTarget>,
    retry: RetryPolicy,
    reporter: Arc<dyn ErrorReporter>,
}

#[async_trait]
impl BatchSink<BatchedResult> for MutationSink {
    async fn deliver(&self, batch: BatchedResult) -> Result<(), SinkError> {
        let target = &self.target;
        let batch = &batch;
        with_retry(
            &self.retry,
            self.reporter.as_ref(),
            ErrorContext::new(COMPONENT, "apply"),
            |e: &SinkError, _| e.is_retryable(),
            || target.apply_mutation_rate(batch),
        )
        .await?;
        tracing::debug!(
            rate = batch.combined_value,
            requests = batch.request_count,
            timespan_ms = batch.timespan.as_millis() as u64,
            priority = %batch.priority,
            "mutation rate applied"
        );
        Ok(())
    }
}

/// Batches mutation-rate requests and applies the combined rate.
pub struct MutationBatchAdapter {
    coordinator: BatchCoordinator<f64, ScalarCombiner>,
}

impl MutationBatchAdapter {
    pub fn new(
        config: MutationBatchConfig,
        target: Arc<dyn MutationTarget>,
        reporter: Arc<dyn ErrorReporter>,
    ) -> Self {
        let sink = Arc::new(MutationSink {
            target,
            retry: RetryPolicy::new(config.retry.clone()),
            reporter: reporter.clone(),
        });
        let coordinator = BatchCoordinator::new(
            COMPONENT,
            config.batch,
            FlushTrigger::Debounce(config.debounce),
            ScalarCombiner::new(config.strategy, config.domain),
            sink,
            reporter,
        );
        Self { coordinator }
    }

    /// Queue a mutation rate; out-of-range values are clamped.
    pub async fn add_mutation(&self, rate: f64, priority: Priority) -> Result<BatchToken, BatchError> {
        self.coordinator.add(rate, priority).await
    }

    pub fn cancel_mutation(&self, token: BatchToken) -> bool {
        self.coordinator.cancel(token)
    }

    pub async fn flush_batch(&self) -> Result<usize, BatchError> {
        self.coordinator.flush().await
    }

    pub fn statistics(&self) -> BatchStatistics {
        self.coordinator.statistics()
    }

    pub fn pending_count(&self) -> usize {
        self.coordinator.pending_count()
    }

    pub fn dispose(&self) {
        self.coordinator.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bioflux_core::report::RecordingReporter;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time;

    fn adapter(target: Arc<dyn MutationTarget>) -> (MutationBatchAdapter, RecordingReporter) {
        let reporter = RecordingReporter::new();
        let config = MutationBatchConfig {
            batch: BatchConfig {
                max_batch_size: 5,
                max_wait: Duration::from_secs(5),
                max_weight: None,
            },
            ..Default::default()
        };
        (
            MutationBatchAdapter::new(config, target, Arc::new(reporter.clone())),
            reporter,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn debounced_batch_updates_organism() {
        let organism = OrganismState::new(0.05);
        let (adapter, _) = adapter(Arc::new(organism.clone()));
        adapter.add_mutation(0.2, Priority::Normal).await.unwrap();
        adapter.add_mutation(0.4, Priority::Normal).await.unwrap();
        assert_eq!(organism.snapshot().applied_batches, 0);

        time::sleep(Duration::from_millis(150)).await;
        let snap = organism.snapshot();
        assert_eq!(snap.applied_batches, 1);
        assert!(snap.mutation_rate > 0.2 && snap.mutation_rate < 0.4);
        assert_eq!(adapter.statistics().total_batches, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn high_priority_mutation_applies_immediately() {
        let organism = OrganismState::new(0.0);
        let (adapter, _) = adapter(Arc::new(organism.clone()));
        adapter.add_mutation(1.5, Priority::High).await.unwrap();
        let snap = organism.snapshot();
        assert_eq!(snap.mutation_rate, 1.0);
        assert_eq!(snap.last_priority, Some(Priority::High));
    }

    struct Flaky {
        failures_left: AtomicU32,
        applied: OrganismState,
    }

    #[async_trait]
    impl MutationTarget for Flaky {
        async fn apply_mutation_rate(&self, batch: &BatchedResult) -> Result<(), SinkError> {
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(SinkError::Unavailable("store busy".into()));
            }
            self.applied.apply_mutation_rate(batch).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_within_flush() {
        let applied = OrganismState::new(0.0);
        let target = Arc::new(Flaky {
            failures_left: AtomicU32::new(2),
            applied: applied.clone(),
        });
        let (adapter, reporter) = adapter(target);
        adapter.add_mutation(0.3, Priority::Normal).await.unwrap();
        assert_eq!(adapter.flush_batch().await.unwrap(), 1);
        assert_eq!(applied.snapshot().applied_batches, 1);
        assert_eq!(reporter.len(), 2);
        assert_eq!(adapter.statistics().failed_flushes, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_requeue_mutations() {
        let applied = OrganismState::new(0.0);
        let target = Arc::new(Flaky {
            failures_left: AtomicU32::new(10),
            applied: applied.clone(),
        });
        let (adapter, _) = adapter(target);
        adapter.add_mutation(0.3, Priority::Normal).await.unwrap();
        assert!(adapter.flush_batch().await.is_err());
        assert_eq!(adapter.pending_count(), 1);
        assert_eq!(applied.snapshot().applied_batches, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_and_dispose() {
        let organism = OrganismState::new(0.1);
        let (adapter, _) = adapter(Arc::new(organism.clone()));
        let token = adapter.add_mutation(0.9, Priority::Low).await.unwrap();
        assert!(adapter.cancel_mutation(token));
        adapter.add_mutation(0.7, Priority::Low).await.unwrap();
        adapter.dispose();
        time::sleep(Duration::from_secs(1)).await;
        assert_eq!(organism.snapshot().applied_batches, 0);
        assert_eq!(organism.snapshot().mutation_rate, 0.1);
    }
}
