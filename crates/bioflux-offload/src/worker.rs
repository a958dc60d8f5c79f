//! The background execution context and how it is started.
//!
//! A worker is an actor: it receives [`WorkerMessage`]s over a bounded
//! channel and answers with [`WorkerEvent`]s. It shares no memory with the
//! caller.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread;

use tokio::sync::mpsc;

use crate::error::OffloadError;
use crate::protocol::{WorkerMessage, WorkerReply, WorkerResponse};
use crate::registry::NetworkRegistry;

/// Something the worker reports back.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    Response(WorkerResponse),
    /// The worker hit an unrecoverable error and stopped.
    Fault(String),
}

/// Both ends of a freshly started worker, as seen by the caller.
pub struct WorkerChannels {
    pub requests: mpsc::Sender<WorkerMessage>,
    pub events: mpsc::UnboundedReceiver<WorkerEvent>,
}

/// Starts workers. Resolved once when the offload is composed.
pub trait WorkerSpawner: Send + Sync + 'static {
    /// Start a worker whose request channel holds `capacity` messages.
    fn spawn(&self, capacity: usize) -> Result<WorkerChannels, OffloadError>;
}

/// Runs the neural kernel on a dedicated OS thread.
#[derive(Debug, Clone)]
pub struct ThreadWorkerSpawner {
    seed: u64,
    thread_name: String,
}

impl ThreadWorkerSpawner {
    /// `seed` must match the fallback registry's seed for the two paths to
    /// agree numerically.
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            thread_name: "bioflux-worker".into(),
        }
    }

    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }
}

impl WorkerSpawner for ThreadWorkerSpawner {
    fn spawn(&self, capacity: usize) -> Result<WorkerChannels, OffloadError> {
        let (request_tx, request_rx) = mpsc::channel(capacity.max(1));
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let seed = self.seed;
        thread::Builder::new()
            .name(self.thread_name.clone())
            .spawn(move || run_worker(NetworkRegistry::new(seed), request_rx, event_tx))
            .map_err(|e| OffloadError::Spawn(e.to_string()))?;
        Ok(WorkerChannels {
            requests: request_tx,
            events: event_rx,
        })
    }
}

/// Worker thread body. Exits when the request channel closes, when the
/// caller stops listening, or after reporting a fault.
fn run_worker(
    mut registry: NetworkRegistry,
    mut requests: mpsc::Receiver<WorkerMessage>,
    events: mpsc::UnboundedSender<WorkerEvent>,
) {
    tracing::debug!(seed = registry.seed(), "worker started");
    while let Some(WorkerMessage { id, request }) = requests.blocking_recv() {
        let started = std::time::Instant::now();
        let outcome = catch_unwind(AssertUnwindSafe(|| registry.handle(&request)));
        let reply = match outcome {
            Ok(Ok(response)) => WorkerReply::Result(response),
            Ok(Err(e)) => WorkerReply::Error(e.to_string()),
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::error!(id, kind = request.kind(), %message, "worker kernel panicked");
                let _ = events.send(WorkerEvent::Fault(message));
                return;
            }
        };
        let response = WorkerResponse {
            id,
            reply,
            processing_time_ms: started.elapsed().as_secs_f64() * 1000.0,
        };
        if events.send(WorkerEvent::Response(response)).is_err() {
            break;
        }
    }
    tracing::debug!("worker stopped");
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker panicked".to_string()
    }
}
