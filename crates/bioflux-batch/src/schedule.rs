//! Flush triggers: trailing debounce timer or the host's per-frame callback.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::task::JoinHandle;
use tokio::time;

/// Work to run on the next frame.
pub type FrameCallback = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Identifier of a requested frame callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameId(pub u64);

/// The host's frame loop (e.g. `requestAnimationFrame`).
pub trait FrameScheduler: Send + Sync + 'static {
    /// Run `callback` on the next frame.
    fn request_frame(&self, callback: FrameCallback) -> FrameId;

    /// Cancel a frame request that has not started running yet.
    fn cancel_frame(&self, id: FrameId);
}

/// When a coordinator flushes if no immediate-flush condition is met.
#[derive(Clone)]
pub enum FlushTrigger {
    /// Trailing debounce: each `add` restarts the window.
    Debounce(Duration),
    /// Flush on the next host frame; one outstanding request at a time.
    NextFrame(Arc<dyn FrameScheduler>),
    /// Only explicit `flush()` calls.
    Manual,
}

impl std::fmt::Debug for FlushTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Debounce(d) => f.debug_tuple("Debounce").field(d).finish(),
            Self::NextFrame(_) => f.write_str("NextFrame"),
            Self::Manual => f.write_str("Manual"),
        }
    }
}

impl Default for FlushTrigger {
    fn default() -> Self {
        Self::Debounce(Duration::from_millis(100))
    }
}

/// Fixed-interval frame loop on the Tokio timer (≈60 fps by default).
pub struct TokioFrameScheduler {
    interval: Duration,
    next_id: AtomicU64,
    frames: Arc<Mutex<HashMap<u64, JoinHandle<()>>>>,
}

impl TokioFrameScheduler {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_id: AtomicU64::new(1),
            frames: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Number of frame callbacks not yet started.
    pub fn outstanding(&self) -> usize {
        self.frames.lock().unwrap().len()
    }
}

impl Default for TokioFrameScheduler {
    fn default() -> Self {
        Self::new(Duration::from_micros(16_667))
    }
}

impl FrameScheduler for TokioFrameScheduler {
    fn request_frame(&self, callback: FrameCallback) -> FrameId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frames = self.frames.clone();
        let interval = self.interval;
        // Hold the map lock across spawn so the task cannot remove itself
        // before its handle is registered.
        let mut guard = self.frames.lock().unwrap();
        let handle = tokio::spawn(async move {
            time::sleep(interval).await;
            // Once removed the frame can no longer be cancelled mid-callback.
            if frames.lock().unwrap().remove(&id).is_none() {
                return;
            }
            callback().await;
        });
        guard.insert(id, handle);
        FrameId(id)
    }

    fn cancel_frame(&self, id: FrameId) {
        if let Some(handle) = self.frames.lock().unwrap().remove(&id.0) {
            handle.abort();
        }
    }
}

/// Frame scheduler driven explicitly by the host's render loop.
#[derive(Default)]
pub struct ManualFrameScheduler {
    next_id: AtomicU64,
    queued: Mutex<Vec<(FrameId, FrameCallback)>>,
}

impl ManualFrameScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of callbacks waiting for the next frame.
    pub fn pending_frames(&self) -> usize {
        self.queued.lock().unwrap().len()
    }

    /// Run every callback queued before this call. Returns how many ran.
    pub async fn run_frame(&self) -> usize {
        let callbacks = std::mem::take(&mut *self.queued.lock().unwrap());
        let count = callbacks.len();
        for (_, callback) in callbacks {
            callback().await;
        }
        count
    }
}

impl FrameScheduler for ManualFrameScheduler {
    fn request_frame(&self, callback: FrameCallback) -> FrameId {
        let id = FrameId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.queued.lock().unwrap().push((id, callback));
        id
    }

    fn cancel_frame(&self, id: FrameId) {
        self.queued.lock().unwrap().retain(|(queued, _)| *queued != id);
    }
}
