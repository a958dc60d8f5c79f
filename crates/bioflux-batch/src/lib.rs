//! bioflux-batch: adaptive batching for high-frequency organism updates.
//!
//! # Features
//! - Generic [`BatchCoordinator`]: trailing debounce, size cap, max-wait
//!   escape valve, priority override, weight cap
//! - Frame-driven flushing through a host [`FrameScheduler`]
//! - [`MutationBatchAdapter`]: scalar mutation-rate batching
//! - [`DrawCallBatchAdapter`]: per-primitive draw-call merging into two
//!   reusable GPU buffers

pub mod coordinator;
pub mod draw;
pub mod mutation;
pub mod schedule;

pub use coordinator::{BatchConfig, BatchCoordinator, BatchStatistics};
pub use draw::{
    DrawBatchConfig, DrawCall, DrawCallBatchAdapter, DrawStats, GraphicsContext, MergedDrawBatch,
    PrimitiveType, UniformValue,
};
pub use mutation::{MutationBatchAdapter, MutationBatchConfig, MutationTarget, OrganismState};
pub use schedule::{FlushTrigger, FrameId, FrameScheduler, ManualFrameScheduler, TokioFrameScheduler};
