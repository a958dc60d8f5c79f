//! Generic batch coordinator.
//!
//! Accepts timestamped, prioritised requests and decides when to flush:
//!
//! ```text
//! add ─┬─ size cap | high priority | max-wait | weight cap ──▶ flush now
//!      └─ otherwise ──▶ arm trigger (debounce timer / next frame)
//!
//! flush: [gate] drain pending ─▶ combiner ─▶ sink
//!                                       └─ error ─▶ re-queue drained requests, re-arm
//! ```
//!
//! After consecutive sink failures a debounce trigger backs off, doubling its
//! delay per failure up to `max_wait`.
//!
//! State lives behind a `std::sync::Mutex` that is never held across an
//! `.await`; flushes are serialised by an async gate so a sink is never
//! re-entered while a previous submission is outstanding.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

use bioflux_core::error::BatchError;
use bioflux_core::report::{ErrorContext, ErrorReporter, Severity};
use bioflux_core::request::{BatchRequest, BatchToken, Priority};
use bioflux_core::sink::{BatchSink, Combiner};

use crate::schedule::{FlushTrigger, FrameId};

/// Smoothing factor of the moving-average batch size.
pub const BATCH_SIZE_SMOOTHING: f64 = 0.1;

/// Immediate-flush thresholds.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Flush as soon as this many requests are pending.
    pub max_batch_size: usize,
    /// Flush as soon as the oldest pending request is older than this.
    pub max_wait: Duration,
    /// Flush as soon as the summed `Combiner::weight` reaches this value.
    pub max_weight: Option<usize>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 10,
            max_wait: Duration::from_millis(1000),
            max_weight: None,
        }
    }
}

/// Running counters for one coordinator.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchStatistics {
    pub total_requests: u64,
    pub total_batches: u64,
    pub failed_flushes: u64,
    /// Exponential moving average of delivered batch sizes.
    pub average_batch_size: f64,
    pub last_batch_at: Option<Instant>,
    pub pending_count: usize,
}

impl BatchStatistics {
    /// `total_requests / total_batches`; `0.0` until a batch has been delivered.
    pub fn compression_ratio(&self) -> f64 {
        if self.total_batches == 0 {
            0.0
        } else {
            self.total_requests as f64 / self.total_batches as f64
        }
    }
}

enum ArmedHandle {
    Timer(JoinHandle<()>),
    Frame(FrameId),
}

/// The currently scheduled flush. The task/callback that owns `generation`
/// clears this slot before flushing, so disarming never interrupts a flush.
struct Armed {
    generation: u64,
    handle: ArmedHandle,
}

struct CoordinatorState<T> {
    pending: Vec<BatchRequest<T>>,
    next_token: u64,
    generation: u64,
    armed: Option<Armed>,
    stats: BatchStatistics,
    consecutive_failures: u32,
    disposed: bool,
}

struct Shared<T, C: Combiner<T>> {
    name: &'static str,
    config: BatchConfig,
    trigger: FlushTrigger,
    combiner: C,
    sink: Arc<dyn BatchSink<C::Output>>,
    reporter: Arc<dyn ErrorReporter>,
    state: Mutex<CoordinatorState<T>>,
    flush_gate: tokio::sync::Mutex<()>,
}

/// Debounced, priority-aware batch coordinator.
///
/// Cloning yields another handle to the same queue.
pub struct BatchCoordinator<T, C: Combiner<T>> {
    shared: Arc<Shared<T, C>>,
}

impl<T, C: Combiner<T>> Clone for BatchCoordinator<T, C> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T, C> BatchCoordinator<T, C>
where
    T: Send + 'static,
    C: Combiner<T>,
{
    /// Create a coordinator. `name` tags logs and error reports.
    ///
    /// Timer triggers spawn Tokio tasks, so `add` must run inside a runtime.
    pub fn new(
        name: &'static str,
        config: BatchConfig,
        trigger: FlushTrigger,
        combiner: C,
        sink: Arc<dyn BatchSink<C::Output>>,
        reporter: Arc<dyn ErrorReporter>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                name,
                config,
                trigger,
                combiner,
                sink,
                reporter,
                state: Mutex::new(CoordinatorState {
                    pending: Vec::new(),
                    next_token: 1,
                    generation: 0,
                    armed: None,
                    stats: BatchStatistics::default(),
                    consecutive_failures: 0,
                    disposed: false,
                }),
                flush_gate: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Queue `value`. Flushes before returning if an immediate-flush
    /// condition is met, otherwise arms the trigger.
    ///
    /// A failed immediate flush is reported and its requests stay queued;
    /// the token is still returned. Fails only after [`dispose`](Self::dispose).
    pub async fn add(&self, value: T, priority: Priority) -> Result<BatchToken, BatchError> {
        let shared = &self.shared;
        let (token, flush_now) = {
            let mut state = shared.state.lock().unwrap();
            if state.disposed {
                return Err(BatchError::Disposed);
            }
            let token = BatchToken(state.next_token);
            state.next_token += 1;
            let value = shared.combiner.normalize(value);
            state.pending.push(BatchRequest::new(token, value, priority));
            state.stats.total_requests += 1;

            let flush_now = shared.should_flush_now(&state.pending, Instant::now());
            if !flush_now {
                shared.arm(&mut state);
            }
            (token, flush_now)
        };

        if flush_now {
            tracing::debug!(coordinator = shared.name, %token, %priority, "immediate flush");
            // Failure is already reported; the batch was re-queued.
            let _ = shared.flush().await;
        }
        Ok(token)
    }

    /// Remove a still-pending request. Returns `false` if it was already
    /// drained into a flush (or never existed).
    pub fn cancel(&self, token: BatchToken) -> bool {
        let mut state = self.shared.state.lock().unwrap();
        let Some(pos) = state.pending.iter().position(|r| r.token == token) else {
            return false;
        };
        state.pending.remove(pos);
        if state.pending.is_empty() {
            self.shared.disarm(&mut state);
        }
        true
    }

    /// Drain and deliver everything pending. Returns the number of requests
    /// delivered (`0` for an empty queue, which does not touch the sink).
    pub async fn flush(&self) -> Result<usize, BatchError> {
        self.shared.flush().await
    }

    pub fn statistics(&self) -> BatchStatistics {
        let state = self.shared.state.lock().unwrap();
        BatchStatistics {
            pending_count: state.pending.len(),
            ..state.stats.clone()
        }
    }

    pub fn pending_count(&self) -> usize {
        self.shared.state.lock().unwrap().pending.len()
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.state.lock().unwrap().disposed
    }

    /// Cancel the armed trigger and drop pending requests without flushing.
    pub fn dispose(&self) {
        let mut state = self.shared.state.lock().unwrap();
        if state.disposed {
            return;
        }
        state.disposed = true;
        self.shared.disarm(&mut state);
        let dropped = state.pending.len();
        state.pending.clear();
        tracing::debug!(coordinator = self.shared.name, dropped, "coordinator disposed");
    }
}

impl<T, C> Shared<T, C>
where
    T: Send + 'static,
    C: Combiner<T>,
{
    fn should_flush_now(&self, pending: &[BatchRequest<T>], now: Instant) -> bool {
        if pending.len() >= self.config.max_batch_size {
            return true;
        }
        if pending.iter().any(|r| r.priority == Priority::High) {
            return true;
        }
        let oldest = pending.iter().map(|r| r.timestamp).min();
        if oldest.is_some_and(|t| now.saturating_duration_since(t) > self.config.max_wait) {
            return true;
        }
        match self.config.max_weight {
            Some(limit) => {
                pending
                    .iter()
                    .map(|r| self.combiner.weight(&r.value))
                    .sum::<usize>()
                    >= limit
            }
            None => false,
        }
    }

    fn arm(self: &Arc<Self>, state: &mut CoordinatorState<T>) {
        match &self.trigger {
            FlushTrigger::Manual => {}
            FlushTrigger::Debounce(delay) => {
                self.disarm(state);
                state.generation += 1;
                let generation = state.generation;
                let delay = self.retry_delay(*delay, state.consecutive_failures);
                let weak = Arc::downgrade(self);
                let handle = tokio::spawn(async move {
                    time::sleep(delay).await;
                    fire(weak, generation).await;
                });
                state.armed = Some(Armed {
                    generation,
                    handle: ArmedHandle::Timer(handle),
                });
            }
            FlushTrigger::NextFrame(scheduler) => {
                if state.armed.is_some() {
                    return;
                }
                state.generation += 1;
                let generation = state.generation;
                let weak = Arc::downgrade(self);
                let id = scheduler.request_frame(Box::new(move || -> BoxFuture<'static, ()> {
                    Box::pin(fire(weak, generation))
                }));
                state.armed = Some(Armed {
                    generation,
                    handle: ArmedHandle::Frame(id),
                });
            }
        }
    }

    /// `debounce` while the sink is healthy, doubled per consecutive failure
    /// and capped at `max_wait` otherwise.
    fn retry_delay(&self, debounce: Duration, failures: u32) -> Duration {
        if failures == 0 {
            return debounce;
        }
        let factor = 1u32 << (failures - 1).min(16);
        debounce
            .saturating_mul(factor)
            .min(self.config.max_wait.max(debounce))
    }

    fn disarm(&self, state: &mut CoordinatorState<T>) {
        let Some(armed) = state.armed.take() else {
            return;
        };
        match armed.handle {
            ArmedHandle::Timer(handle) => handle.abort(),
            ArmedHandle::Frame(id) => {
                if let FlushTrigger::NextFrame(scheduler) = &self.trigger {
                    scheduler.cancel_frame(id);
                }
            }
        }
    }

    /// Claim the armed slot for `generation`. `false` if it was superseded.
    fn claim(&self, generation: u64) -> bool {
        let mut state = self.state.lock().unwrap();
        match &state.armed {
            Some(armed) if armed.generation == generation => {
                state.armed = None;
                true
            }
            _ => false,
        }
    }

    async fn flush(self: &Arc<Self>) -> Result<usize, BatchError> {
        let _gate = self.flush_gate.lock().await;

        let batch = {
            let mut state = self.state.lock().unwrap();
            if state.disposed {
                return Ok(0);
            }
            self.disarm(&mut state);
            std::mem::take(&mut state.pending)
        };
        if batch.is_empty() {
            return Ok(0);
        }

        let size = batch.len();
        let combined = self.combiner.combine(&batch, Instant::now());

        match self.sink.deliver(combined).await {
            Ok(()) => {
                let mut state = self.state.lock().unwrap();
                state.consecutive_failures = 0;
                let stats = &mut state.stats;
                stats.total_batches += 1;
                stats.average_batch_size = stats.average_batch_size * (1.0 - BATCH_SIZE_SMOOTHING)
                    + size as f64 * BATCH_SIZE_SMOOTHING;
                stats.last_batch_at = Some(Instant::now());
                tracing::debug!(
                    coordinator = self.name,
                    size,
                    total_batches = stats.total_batches,
                    "batch delivered"
                );
                Ok(size)
            }
            Err(e) => {
                {
                    let mut state = self.state.lock().unwrap();
                    state.stats.failed_flushes += 1;
                    if !state.disposed {
                        let newer = std::mem::replace(&mut state.pending, batch);
                        state.pending.extend(newer);
                        state.consecutive_failures += 1;
                        self.arm(&mut state);
                    }
                }
                self.reporter.report(
                    ErrorContext::new(self.name, "flush")
                        .report(Severity::Error, format!("sink failed, {size} requests re-queued: {e}")),
                );
                Err(BatchError::Sink(e))
            }
        }
    }
}

/// Body of an armed timer or frame callback.
async fn fire<T, C>(weak: Weak<Shared<T, C>>, generation: u64)
where
    T: Send + 'static,
    C: Combiner<T>,
{
    let Some(shared) = weak.upgrade() else {
        return;
    };
    if !shared.claim(generation) {
        return;
    }
    // Failure is already reported; the batch was re-queued.
    let _ = shared.flush().await;
}
