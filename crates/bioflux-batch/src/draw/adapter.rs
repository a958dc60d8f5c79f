//! Frame-driven draw-call batching into two adapter-owned GPU buffers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use bioflux_core::error::{BatchError, SinkError};
use bioflux_core::report::{ErrorContext, ErrorReporter, Severity};
use bioflux_core::request::{BatchToken, Priority};
use bioflux_core::sink::BatchSink;

use crate::coordinator::{BatchConfig, BatchCoordinator};
use crate::draw::graphics::{BufferId, BufferKind, DrawMode, GraphicsContext, GraphicsError};
use crate::draw::merge::{DrawCall, DrawCallCombiner, FrameGroup, MergedDrawBatch};
use crate::schedule::{FlushTrigger, FrameScheduler};

const COMPONENT: &str = "draw-batch";

/// Configuration for [`DrawCallBatchAdapter`].
#[derive(Debug, Clone)]
pub struct DrawBatchConfig {
    pub max_batch_size: usize,
    pub max_wait: Duration,
    /// Flush immediately once this many vertices are pending.
    pub max_vertices: usize,
    /// Floats per vertex in `DrawCall::vertices`.
    pub components_per_vertex: usize,
}

impl Default for DrawBatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 100,
            max_wait: Duration::from_millis(50),
            max_vertices: 65_536,
            components_per_vertex: 2,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DrawStats {
    /// Draw calls accepted by `add_draw_call`.
    pub total_draw_calls: u64,
    /// GPU draws issued.
    pub total_batches: u64,
    /// `total_draw_calls / total_batches`, `0.0` before the first draw.
    pub compression_ratio: f64,
    pub pending_count: usize,
}

#[derive(Debug, Clone, Copy)]
struct OwnedBuffers {
    vertex: BufferId,
    index: BufferId,
}

struct GpuSubmitter {
    graphics: Arc<dyn GraphicsContext>,
    combiner: DrawCallCombiner,
    buffers: Mutex<Option<OwnedBuffers>>,
    issued_draws: AtomicU64,
    frames: AtomicU64,
}

impl GpuSubmitter {
    fn execute_draw_call(&self, buffers: OwnedBuffers, batch: &MergedDrawBatch) -> Result<(), GraphicsError> {
        self.graphics
            .write_buffer(buffers.vertex, bytemuck::cast_slice(&batch.vertices))?;
        let mode = match &batch.indices {
            Some(indices) => {
                self.graphics
                    .write_buffer(buffers.index, bytemuck::cast_slice(indices))?;
                DrawMode::Elements {
                    index_count: indices.len() as u32,
                }
            }
            None => DrawMode::Arrays {
                vertex_count: batch.vertex_count as u32,
            },
        };
        if !batch.uniforms.is_empty() {
            self.graphics.set_uniforms(&batch.uniforms)?;
        }
        self.graphics.draw(batch.primitive, mode)?;
        self.issued_draws.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn release(&self) {
        let Some(buffers) = self.buffers.lock().unwrap().take() else {
            return;
        };
        for id in [buffers.vertex, buffers.index] {
            if let Err(e) = self.graphics.destroy_buffer(id) {
                tracing::warn!(buffer = id.0, error = %e, "failed to destroy draw buffer");
            }
        }
    }
}

#[async_trait]
impl BatchSink<Vec<FrameGroup>> for GpuSubmitter {
    async fn deliver(&self, groups: Vec<FrameGroup>) -> Result<(), SinkError> {
        let buffers = (*self.buffers.lock().unwrap())
            .ok_or_else(|| SinkError::Rejected("draw buffers released".into()))?;
        let frame = self.frames.fetch_add(1, Ordering::Relaxed) + 1;
        for (drawn, group) in groups.iter().enumerate() {
            let batch = &group.batch;
            if let Err(e) = self.execute_draw_call(buffers, batch) {
                // The coordinator re-queues the whole frame; groups already
                // on the GPU must not be drawn again.
                self.combiner
                    .mark_drawn(groups[..drawn].iter().flat_map(|g| g.tokens.iter().copied()));
                return Err(SinkError::Graphics(format!("{} draw: {e}", batch.primitive)));
            }
            tracing::trace!(
                frame,
                primitive = %batch.primitive,
                draw_calls = batch.draw_call_count,
                vertices = batch.vertex_count,
                "merged draw issued"
            );
        }
        self.combiner.clear_drawn();
        Ok(())
    }
}

/// Collects draw calls and submits one merged draw per primitive type on the
/// next frame.
pub struct DrawCallBatchAdapter {
    coordinator: BatchCoordinator<DrawCall, DrawCallCombiner>,
    submitter: Arc<GpuSubmitter>,
    components_per_vertex: usize,
}

impl DrawCallBatchAdapter {
    /// Create the adapter and its vertex and index buffers.
    pub fn new(
        graphics: Arc<dyn GraphicsContext>,
        frames: Arc<dyn FrameScheduler>,
        config: DrawBatchConfig,
        reporter: Arc<dyn ErrorReporter>,
    ) -> Result<Self, BatchError> {
        let context = ErrorContext::new(COMPONENT, "create_buffers");
        let vertex = graphics.create_buffer(BufferKind::Vertex).map_err(|e| {
            reporter.report(context.report(Severity::Critical, e.to_string()));
            BatchError::Graphics(e.to_string())
        })?;
        let index = match graphics.create_buffer(BufferKind::Index) {
            Ok(id) => id,
            Err(e) => {
                reporter.report(context.report(Severity::Critical, e.to_string()));
                let _ = graphics.destroy_buffer(vertex);
                return Err(BatchError::Graphics(e.to_string()));
            }
        };

        let components_per_vertex = config.components_per_vertex.max(1);
        let combiner = DrawCallCombiner::new(components_per_vertex);
        let submitter = Arc::new(GpuSubmitter {
            graphics,
            combiner: combiner.clone(),
            buffers: Mutex::new(Some(OwnedBuffers { vertex, index })),
            issued_draws: AtomicU64::new(0),
            frames: AtomicU64::new(0),
        });
        let coordinator = BatchCoordinator::new(
            COMPONENT,
            BatchConfig {
                max_batch_size: config.max_batch_size,
                max_wait: config.max_wait,
                max_weight: Some(config.max_vertices),
            },
            FlushTrigger::NextFrame(frames),
            combiner,
            submitter.clone(),
            reporter,
        );
        tracing::debug!(vertex = vertex.0, index = index.0, "draw batch adapter ready");
        Ok(Self {
            coordinator,
            submitter,
            components_per_vertex,
        })
    }

    /// Validate and queue a draw call for the next frame.
    pub async fn add_draw_call(&self, call: DrawCall, priority: Priority) -> Result<BatchToken, BatchError> {
        call.validate(self.components_per_vertex)?;
        self.coordinator.add(call, priority).await
    }

    pub fn cancel_draw_call(&self, token: BatchToken) -> bool {
        self.coordinator.cancel(token)
    }

    /// Submit everything pending now instead of waiting for the frame.
    pub async fn flush(&self) -> Result<usize, BatchError> {
        self.coordinator.flush().await
    }

    pub fn stats(&self) -> DrawStats {
        let stats = self.coordinator.statistics();
        let total_batches = self.submitter.issued_draws.load(Ordering::Relaxed);
        DrawStats {
            total_draw_calls: stats.total_requests,
            total_batches,
            compression_ratio: if total_batches == 0 {
                0.0
            } else {
                stats.total_requests as f64 / total_batches as f64
            },
            pending_count: stats.pending_count,
        }
    }

    /// Drop pending draw calls and destroy both GPU buffers.
    pub fn dispose(&self) {
        self.coordinator.dispose();
        self.submitter.combiner.clear_drawn();
        self.submitter.release();
    }
}

impl Drop for DrawCallBatchAdapter {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::draw::merge::{PrimitiveType, UniformValue};
    use crate::schedule::ManualFrameScheduler;
    use bioflux_core::report::RecordingReporter;
    use std::collections::BTreeMap;

    #[derive(Debug, Clone, PartialEq)]
    enum Op {
        Create(BufferKind, BufferId),
        Write(BufferId, usize),
        Destroy(BufferId),
        Uniforms(usize),
        Draw(PrimitiveType, DrawMode),
    }

    #[derive(Default)]
    struct RecordingGraphics {
        ops: Mutex<Vec<Op>>,
        next: AtomicU64,
        fail_index_buffer: bool,
        fail_draws: std::sync::atomic::AtomicBool,
        fail_primitive: Mutex<Option<PrimitiveType>>,
    }

    impl RecordingGraphics {
        fn ops(&self) -> Vec<Op> {
            self.ops.lock().unwrap().clone()
        }

        fn draws(&self) -> Vec<(PrimitiveType, DrawMode)> {
            self.ops()
                .into_iter()
                .filter_map(|op| match op {
                    Op::Draw(p, m) => Some((p, m)),
                    _ => None,
                })
                .collect()
        }

        fn written_buffers(&self) -> Vec<BufferId> {
            let mut ids: Vec<_> = self
                .ops()
                .into_iter()
                .filter_map(|op| match op {
                    Op::Write(id, _) => Some(id),
                    _ => None,
                })
                .collect();
            ids.sort_by_key(|id| id.0);
            ids.dedup();
            ids
        }
    }

    impl GraphicsContext for RecordingGraphics {
        fn create_buffer(&self, kind: BufferKind) -> Result<BufferId, GraphicsError> {
            if kind == BufferKind::Index && self.fail_index_buffer {
                return Err(GraphicsError::Allocation("out of memory".into()));
            }
            let id = BufferId(self.next.fetch_add(1, Ordering::SeqCst) + 1);
            self.ops.lock().unwrap().push(Op::Create(kind, id));
            Ok(id)
        }

        fn write_buffer(&self, id: BufferId, data: &[u8]) -> Result<(), GraphicsError> {
            self.ops.lock().unwrap().push(Op::Write(id, data.len()));
            Ok(())
        }

        fn destroy_buffer(&self, id: BufferId) -> Result<(), GraphicsError> {
            self.ops.lock().unwrap().push(Op::Destroy(id));
            Ok(())
        }

        fn set_uniforms(&self, uniforms: &BTreeMap<String, UniformValue>) -> Result<(), GraphicsError> {
            self.ops.lock().unwrap().push(Op::Uniforms(uniforms.len()));
            Ok(())
        }

        fn draw(&self, primitive: PrimitiveType, mode: DrawMode) -> Result<(), GraphicsError> {
            if self.fail_draws.load(Ordering::SeqCst)
                || *self.fail_primitive.lock().unwrap() == Some(primitive)
            {
                return Err(GraphicsError::ContextLost);
            }
            self.ops.lock().unwrap().push(Op::Draw(primitive, mode));
            Ok(())
        }
    }

    fn setup(
        graphics: Arc<RecordingGraphics>,
    ) -> (DrawCallBatchAdapter, Arc<ManualFrameScheduler>, RecordingReporter) {
        let frames = Arc::new(ManualFrameScheduler::new());
        let reporter = RecordingReporter::new();
        let adapter = DrawCallBatchAdapter::new(
            graphics,
            frames.clone(),
            DrawBatchConfig {
                max_wait: Duration::from_secs(60),
                ..Default::default()
            },
            Arc::new(reporter.clone()),
        )
        .unwrap();
        (adapter, frames, reporter)
    }

    fn call(primitive: PrimitiveType) -> DrawCall {
        DrawCall::new(primitive, vec![0.0; 8])
    }

    #[tokio::test]
    async fn frame_flush_issues_one_draw_per_primitive() {
        let graphics = Arc::new(RecordingGraphics::default());
        let (adapter, frames, _) = setup(graphics.clone());

        adapter.add_draw_call(call(PrimitiveType::Triangles), Priority::Normal).await.unwrap();
        adapter.add_draw_call(call(PrimitiveType::Triangles), Priority::Normal).await.unwrap();
        adapter.add_draw_call(call(PrimitiveType::Lines), Priority::Normal).await.unwrap();
        assert!(graphics.draws().is_empty());
        assert_eq!(frames.pending_frames(), 1);

        assert_eq!(frames.run_frame().await, 1);
        assert_eq!(
            graphics.draws(),
            vec![
                (PrimitiveType::Triangles, DrawMode::Arrays { vertex_count: 8 }),
                (PrimitiveType::Lines, DrawMode::Arrays { vertex_count: 4 }),
            ]
        );
        let stats = adapter.stats();
        assert_eq!(stats.total_draw_calls, 3);
        assert_eq!(stats.total_batches, 2);
        assert_eq!(stats.compression_ratio, 1.5);
        assert_eq!(stats.pending_count, 0);
    }

    #[tokio::test]
    async fn uploads_reuse_the_two_owned_buffers() {
        let graphics = Arc::new(RecordingGraphics::default());
        let (adapter, frames, _) = setup(graphics.clone());
        for _ in 0..3 {
            let indexed = call(PrimitiveType::Triangles).with_indices(vec![0, 1, 2]);
            adapter.add_draw_call(indexed, Priority::Normal).await.unwrap();
            frames.run_frame().await;
        }
        let creates = graphics
            .ops()
            .iter()
            .filter(|op| matches!(op, Op::Create(..)))
            .count();
        assert_eq!(creates, 2);
        assert_eq!(graphics.written_buffers(), vec![BufferId(1), BufferId(2)]);
        assert!(graphics.ops().contains(&Op::Write(BufferId(1), 8 * 4)));
        assert!(graphics.ops().contains(&Op::Write(BufferId(2), 3 * 4)));
        assert_eq!(
            graphics.draws()[0],
            (PrimitiveType::Triangles, DrawMode::Elements { index_count: 3 })
        );
    }

    #[tokio::test]
    async fn invalid_calls_are_rejected_before_queueing() {
        let graphics = Arc::new(RecordingGraphics::default());
        let (adapter, frames, _) = setup(graphics);
        let empty = DrawCall::new(PrimitiveType::Points, vec![]);
        assert!(adapter.add_draw_call(empty, Priority::Normal).await.unwrap_err().is_validation());
        let bad_index = call(PrimitiveType::Points).with_indices(vec![9]);
        assert!(adapter.add_draw_call(bad_index, Priority::Normal).await.is_err());
        assert_eq!(adapter.stats().pending_count, 0);
        assert_eq!(frames.pending_frames(), 0);
    }

    #[tokio::test]
    async fn vertex_cap_forces_immediate_flush() {
        let graphics = Arc::new(RecordingGraphics::default());
        let frames = Arc::new(ManualFrameScheduler::new());
        let adapter = DrawCallBatchAdapter::new(
            graphics.clone(),
            frames.clone(),
            DrawBatchConfig {
                max_vertices: 6,
                max_wait: Duration::from_secs(60),
                ..Default::default()
            },
            Arc::new(RecordingReporter::new()),
        )
        .unwrap();
        adapter.add_draw_call(call(PrimitiveType::Points), Priority::Normal).await.unwrap();
        assert!(graphics.draws().is_empty());
        adapter.add_draw_call(call(PrimitiveType::Points), Priority::Normal).await.unwrap();
        assert_eq!(graphics.draws().len(), 1);
        assert_eq!(frames.run_frame().await, 0);
    }

    #[tokio::test]
    async fn failed_draw_requeues_and_reports() {
        let graphics = Arc::new(RecordingGraphics::default());
        let (adapter, frames, reporter) = setup(graphics.clone());
        graphics.fail_draws.store(true, Ordering::SeqCst);
        adapter.add_draw_call(call(PrimitiveType::Lines), Priority::Normal).await.unwrap();
        frames.run_frame().await;
        assert_eq!(adapter.stats().pending_count, 1);
        assert_eq!(adapter.stats().total_batches, 0);
        assert_eq!(reporter.for_component(COMPONENT).len(), 1);

        graphics.fail_draws.store(false, Ordering::SeqCst);
        assert_eq!(adapter.flush().await.unwrap(), 1);
        assert_eq!(graphics.draws().len(), 1);
    }

    #[tokio::test]
    async fn failed_frame_retries_only_undrawn_groups_on_next_frame() {
        let graphics = Arc::new(RecordingGraphics::default());
        let (adapter, frames, reporter) = setup(graphics.clone());
        *graphics.fail_primitive.lock().unwrap() = Some(PrimitiveType::Lines);
        adapter.add_draw_call(call(PrimitiveType::Triangles), Priority::Normal).await.unwrap();
        adapter.add_draw_call(call(PrimitiveType::Lines), Priority::Normal).await.unwrap();

        assert_eq!(frames.run_frame().await, 1);
        assert_eq!(graphics.draws().len(), 1);
        assert_eq!(adapter.stats().pending_count, 2);
        assert_eq!(reporter.for_component(COMPONENT).len(), 1);
        assert_eq!(frames.pending_frames(), 1, "failed frame must request another");

        *graphics.fail_primitive.lock().unwrap() = None;
        assert_eq!(frames.run_frame().await, 1);
        let draws: Vec<_> = graphics.draws().into_iter().map(|(p, _)| p).collect();
        assert_eq!(draws, vec![PrimitiveType::Triangles, PrimitiveType::Lines]);
        assert_eq!(adapter.stats().pending_count, 0);
        assert_eq!(adapter.stats().total_batches, 2);
        assert_eq!(adapter.submitter.combiner.drawn_count(), 0);
        assert_eq!(frames.pending_frames(), 0);
    }

    #[tokio::test]
    async fn dispose_destroys_buffers_and_drops_pending() {
        let graphics = Arc::new(RecordingGraphics::default());
        let (adapter, frames, _) = setup(graphics.clone());
        adapter.add_draw_call(call(PrimitiveType::Points), Priority::Normal).await.unwrap();
        adapter.dispose();
        adapter.dispose();

        assert_eq!(frames.pending_frames(), 0);
        assert!(graphics.draws().is_empty());
        let destroyed: Vec<_> = graphics
            .ops()
            .into_iter()
            .filter(|op| matches!(op, Op::Destroy(_)))
            .collect();
        assert_eq!(destroyed, vec![Op::Destroy(BufferId(1)), Op::Destroy(BufferId(2))]);
        assert!(matches!(
            adapter.add_draw_call(call(PrimitiveType::Points), Priority::Normal).await,
            Err(BatchError::Disposed)
        ));
    }

    #[tokio::test]
    async fn index_buffer_failure_releases_vertex_buffer() {
        let graphics = Arc::new(RecordingGraphics {
            fail_index_buffer: true,
            ..Default::default()
        });
        let reporter = RecordingReporter::new();
        let result = DrawCallBatchAdapter::new(
            graphics.clone(),
            Arc::new(ManualFrameScheduler::new()),
            DrawBatchConfig::default(),
            Arc::new(reporter.clone()),
        );
        assert!(matches!(result, Err(BatchError::Graphics(_))));
        assert_eq!(graphics.ops().last(), Some(&Op::Destroy(BufferId(1))));
        assert_eq!(reporter.reports()[0].severity, Severity::Critical);
    }
}
