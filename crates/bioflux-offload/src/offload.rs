//! Request/response correlation with per-request timeouts over a worker.
//!
//! ```text
//! send ─▶ [table: id → PendingOperation] ─▶ bounded channel ─▶ worker thread
//!   ▲          │ timeout task                                      │
//!   │          ▼                                                   ▼
//!   └── oneshot ◀── settle (remove under lock) ◀── dispatcher ◀── events
//! ```
//!
//! Every settlement path (response, timeout, fault, delivery failure,
//! terminate) first removes the entry from the table under its lock; only the
//! path that finds the entry completes the caller's future.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

use bioflux_core::report::{ErrorContext, ErrorReporter, Severity};

use crate::error::OffloadError;
use crate::protocol::{ComputeRequest, ComputeResponse, WorkerMessage, WorkerReply, WorkerResponse};
use crate::worker::{WorkerChannels, WorkerEvent, WorkerSpawner};

const COMPONENT: &str = "compute-offload";

/// Smoothing factor of the moving-average processing time.
pub const PROCESSING_TIME_SMOOTHING: f64 = 0.1;

/// Lifecycle of the offloaded worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OffloadState {
    Uninitialized,
    Initializing,
    Ready,
    /// Ready with at least one request in flight.
    Busy,
    /// The worker could not be started or has failed; requests are refused.
    Degraded,
    Terminated,
}

impl OffloadState {
    /// Whether `send` hands requests to the worker in this state.
    pub fn accepts_requests(self) -> bool {
        matches!(self, Self::Ready | Self::Busy)
    }
}

impl std::fmt::Display for OffloadState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "uninitialized"),
            Self::Initializing => write!(f, "initializing"),
            Self::Ready => write!(f, "ready"),
            Self::Busy => write!(f, "busy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Terminated => write!(f, "terminated"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OffloadConfig {
    /// Bound of the request channel to the worker.
    pub channel_capacity: usize,
    /// Deadline used by [`AsyncComputeOffload::send_default`].
    pub default_timeout: Duration,
}

impl Default for OffloadConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 64,
            default_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OffloadStats {
    pub state: OffloadState,
    pub pending: usize,
    /// Responses correlated to a waiting caller (results and remote errors).
    pub completed: u64,
    pub timeouts: u64,
    pub faults: u64,
    /// Exponential moving average of worker-reported processing time.
    pub average_processing_ms: f64,
}

type Reply = oneshot::Sender<Result<ComputeResponse, OffloadError>>;

struct PendingOperation {
    reply: Reply,
    timeout: JoinHandle<()>,
    sent_at: Instant,
}

impl PendingOperation {
    fn settle(self, outcome: Result<ComputeResponse, OffloadError>) {
        self.timeout.abort();
        // The caller may have stopped waiting.
        let _ = self.reply.send(outcome);
    }
}

struct OffloadInner {
    /// Never `Busy`; that is derived from `pending`.
    phase: OffloadState,
    pending: HashMap<u64, PendingOperation>,
    requests: Option<mpsc::Sender<WorkerMessage>>,
    dispatcher: Option<JoinHandle<()>>,
    completed: u64,
    timeouts: u64,
    faults: u64,
    average_processing_ms: f64,
}

impl OffloadInner {
    fn state(&self) -> OffloadState {
        match self.phase {
            OffloadState::Ready if !self.pending.is_empty() => OffloadState::Busy,
            phase => phase,
        }
    }
}

struct Shared {
    config: OffloadConfig,
    reporter: Arc<dyn ErrorReporter>,
    next_id: AtomicU64,
    inner: Mutex<OffloadInner>,
}

/// Sends typed compute requests to a background worker and correlates the
/// replies.
///
/// Dropping the offload terminates it.
pub struct AsyncComputeOffload {
    spawner: Arc<dyn WorkerSpawner>,
    shared: Arc<Shared>,
}

impl AsyncComputeOffload {
    pub fn new(
        spawner: Arc<dyn WorkerSpawner>,
        config: OffloadConfig,
        reporter: Arc<dyn ErrorReporter>,
    ) -> Self {
        Self {
            spawner,
            shared: Arc::new(Shared {
                config,
                reporter,
                next_id: AtomicU64::new(1),
                inner: Mutex::new(OffloadInner {
                    phase: OffloadState::Uninitialized,
                    pending: HashMap::new(),
                    requests: None,
                    dispatcher: None,
                    completed: 0,
                    timeouts: 0,
                    faults: 0,
                    average_processing_ms: 0.0,
                }),
            }),
        }
    }

    /// Start the worker. Only the first call has an effect; spawn failure
    /// leaves the offload `Degraded`. Must run inside a Tokio runtime.
    pub fn start(&self) -> OffloadState {
        {
            let mut inner = self.shared.inner.lock().unwrap();
            if inner.phase != OffloadState::Uninitialized {
                return inner.state();
            }
            inner.phase = OffloadState::Initializing;
        }

        let spawned = self.spawner.spawn(self.shared.config.channel_capacity);
        let mut inner = self.shared.inner.lock().unwrap();
        match spawned {
            Ok(WorkerChannels { requests, events }) => {
                inner.requests = Some(requests);
                inner.dispatcher = Some(tokio::spawn(dispatch(Arc::downgrade(&self.shared), events)));
                inner.phase = OffloadState::Ready;
                tracing::info!("compute offload → ready");
            }
            Err(e) => {
                inner.phase = OffloadState::Degraded;
                tracing::warn!(error = %e, "compute offload → degraded");
                self.shared.reporter.report(
                    ErrorContext::new(COMPONENT, "start").report(Severity::Critical, e.to_string()),
                );
            }
        }
        inner.state()
    }

    /// Send `request` and wait for its reply or for `timeout`, whichever
    /// comes first. Fails immediately unless the worker is ready.
    ///
    /// The deadline also covers waiting for room on a full request channel.
    pub async fn send(
        &self,
        request: ComputeRequest,
        timeout: Duration,
    ) -> Result<ComputeResponse, OffloadError> {
        let kind = request.kind();
        let (reply, mut outcome) = oneshot::channel();
        let (id, requests) = {
            let mut inner = self.shared.inner.lock().unwrap();
            let state = inner.state();
            let Some(requests) = inner.requests.clone().filter(|_| state.accepts_requests()) else {
                return Err(OffloadError::Unavailable { state });
            };
            let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
            let weak = Arc::downgrade(&self.shared);
            // Spawned under the table lock so it cannot observe a missing entry
            // before the insert below.
            let timer = tokio::spawn(async move {
                time::sleep(timeout).await;
                if let Some(shared) = weak.upgrade() {
                    shared.expire(id, timeout);
                }
            });
            inner.pending.insert(
                id,
                PendingOperation {
                    reply,
                    timeout: timer,
                    sent_at: Instant::now(),
                },
            );
            (id, requests)
        };

        tracing::trace!(id, kind, "request sent to worker");
        tokio::select! {
            delivered = requests.send(WorkerMessage { id, request }) => {
                if let Err(e) = delivered {
                    return Err(self.shared.delivery_failed(id, e.to_string()));
                }
            }
            // Settled while waiting for channel capacity. Dropping the
            // unfinished send keeps the message off the channel.
            settled = &mut outcome => {
                tracing::debug!(id, kind, "request settled before reaching the worker");
                return settled.unwrap_or(Err(OffloadError::Terminated));
            }
        }
        drop(requests);

        outcome.await.unwrap_or(Err(OffloadError::Terminated))
    }

    /// [`send`](Self::send) with the configured default deadline.
    pub async fn send_default(&self, request: ComputeRequest) -> Result<ComputeResponse, OffloadError> {
        let timeout = self.shared.config.default_timeout;
        self.send(request, timeout).await
    }

    pub fn state(&self) -> OffloadState {
        self.shared.inner.lock().unwrap().state()
    }

    pub fn stats(&self) -> OffloadStats {
        let inner = self.shared.inner.lock().unwrap();
        OffloadStats {
            state: inner.state(),
            pending: inner.pending.len(),
            completed: inner.completed,
            timeouts: inner.timeouts,
            faults: inner.faults,
            average_processing_ms: inner.average_processing_ms,
        }
    }

    /// Reject everything in flight with `Terminated` and stop the worker.
    pub fn terminate(&self) {
        let drained = {
            let mut inner = self.shared.inner.lock().unwrap();
            if inner.phase == OffloadState::Terminated {
                return;
            }
            inner.phase = OffloadState::Terminated;
            // Dropping the last sender ends the worker's receive loop.
            inner.requests = None;
            if let Some(dispatcher) = inner.dispatcher.take() {
                dispatcher.abort();
            }
            std::mem::take(&mut inner.pending)
        };
        let rejected = drained.len();
        for (_, op) in drained {
            op.settle(Err(OffloadError::Terminated));
        }
        tracing::info!(rejected, "compute offload → terminated");
    }
}

impl Drop for AsyncComputeOffload {
    fn drop(&mut self) {
        self.terminate();
    }
}

impl Shared {
    fn take(&self, id: u64) -> Option<PendingOperation> {
        self.inner.lock().unwrap().pending.remove(&id)
    }

    fn settle(&self, response: WorkerResponse) {
        let WorkerResponse {
            id,
            reply,
            processing_time_ms,
        } = response;
        let op = {
            let mut inner = self.inner.lock().unwrap();
            let Some(op) = inner.pending.remove(&id) else {
                tracing::debug!(id, "late worker response discarded");
                return;
            };
            inner.completed += 1;
            inner.average_processing_ms = inner.average_processing_ms * (1.0 - PROCESSING_TIME_SMOOTHING)
                + processing_time_ms * PROCESSING_TIME_SMOOTHING;
            op
        };
        tracing::trace!(
            id,
            processing_ms = processing_time_ms,
            round_trip_ms = op.sent_at.elapsed().as_secs_f64() * 1000.0,
            "worker response correlated"
        );
        op.settle(match reply {
            WorkerReply::Result(response) => Ok(response),
            WorkerReply::Error(message) => Err(OffloadError::Remote(message)),
        });
    }

    fn expire(&self, id: u64, timeout: Duration) {
        let op = {
            let mut inner = self.inner.lock().unwrap();
            let Some(op) = inner.pending.remove(&id) else {
                return;
            };
            inner.timeouts += 1;
            op
        };
        let ms = timeout.as_millis() as u64;
        self.reporter.report(
            ErrorContext::new(COMPONENT, "send")
                .report(Severity::Warning, format!("request {id} timed out after {ms}ms")),
        );
        let _ = op.reply.send(Err(OffloadError::Timeout { ms }));
    }

    /// The worker stopped; reject everything in flight exactly once.
    fn fault(&self, message: String) {
        let drained = {
            let mut inner = self.inner.lock().unwrap();
            if inner.phase == OffloadState::Terminated {
                return;
            }
            inner.faults += 1;
            inner.phase = OffloadState::Degraded;
            inner.requests = None;
            std::mem::take(&mut inner.pending)
        };
        tracing::warn!(rejected = drained.len(), %message, "compute offload → degraded");
        self.reporter.report(
            ErrorContext::new(COMPONENT, "worker").report(Severity::Critical, message.clone()),
        );
        for (_, op) in drained {
            op.settle(Err(OffloadError::WorkerFault(message.clone())));
        }
    }

    fn delivery_failed(&self, id: u64, message: String) -> OffloadError {
        if let Some(op) = self.take(id) {
            op.timeout.abort();
        }
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.phase != OffloadState::Terminated {
                inner.phase = OffloadState::Degraded;
            }
        }
        self.reporter.report(
            ErrorContext::new(COMPONENT, "send").report(Severity::Error, message.clone()),
        );
        OffloadError::Delivery(message)
    }
}

/// Routes worker events to waiting callers until the worker goes away.
async fn dispatch(weak: Weak<Shared>, mut events: mpsc::UnboundedReceiver<WorkerEvent>) {
    while let Some(event) = events.recv().await {
        let Some(shared) = weak.upgrade() else {
            return;
        };
        match event {
            WorkerEvent::Response(response) => shared.settle(response),
            WorkerEvent::Fault(message) => {
                shared.fault(message);
                return;
            }
        }
    }
    if let Some(shared) = weak.upgrade() {
        shared.fault("worker event stream closed".into());
    }
}
