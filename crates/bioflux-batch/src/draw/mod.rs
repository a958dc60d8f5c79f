//! Draw-call batching.
//!
//! Draw submissions are grouped by primitive type and merged once per frame
//! into one draw per primitive, uploaded through two GPU buffers the adapter
//! owns for its whole lifetime.

pub mod adapter;
pub mod graphics;
pub mod merge;

pub use adapter::{DrawBatchConfig, DrawCallBatchAdapter, DrawStats};
pub use graphics::{BufferId, BufferKind, DrawMode, GraphicsContext, GraphicsError};
pub use merge::{
    merge_draw_calls, DrawCall, DrawCallCombiner, FrameGroup, MergedDrawBatch, PrimitiveType, UniformValue,
};
