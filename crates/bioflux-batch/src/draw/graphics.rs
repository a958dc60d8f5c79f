//! The host graphics context the draw adapter submits to.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::draw::merge::{PrimitiveType, UniformValue};

/// Handle of a GPU buffer created through a [`GraphicsContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferKind {
    Vertex,
    Index,
}

/// How a draw reads the bound buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawMode {
    /// Non-indexed draw over the vertex buffer.
    Arrays { vertex_count: u32 },
    /// Indexed draw over the index buffer.
    Elements { index_count: u32 },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum GraphicsError {
    #[error("buffer allocation failed: {0}")]
    Allocation(String),

    #[error("unknown buffer {0:?}")]
    UnknownBuffer(BufferId),

    #[error("graphics context lost")]
    ContextLost,

    #[error("{0}")]
    Other(String),
}

/// Minimal GPU surface needed to submit merged draw batches.
///
/// All calls happen on the flushing task; implementations bridge to the
/// actual device (WebGL, wgpu, a recording double).
pub trait GraphicsContext: Send + Sync + 'static {
    fn create_buffer(&self, kind: BufferKind) -> Result<BufferId, GraphicsError>;

    /// Replace the contents of `id` with `data`.
    fn write_buffer(&self, id: BufferId, data: &[u8]) -> Result<(), GraphicsError>;

    fn destroy_buffer(&self, id: BufferId) -> Result<(), GraphicsError>;

    fn set_uniforms(&self, uniforms: &BTreeMap<String, UniformValue>) -> Result<(), GraphicsError>;

    fn draw(&self, primitive: PrimitiveType, mode: DrawMode) -> Result<(), GraphicsError>;
}
