//! End-to-end tests of the batching adapters through their public API.
//!
//! Mutation batching runs on the paused Tokio clock; draw batching is driven
//! by a manual frame loop and a recording graphics context.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bioflux_batch::draw::{BufferId, BufferKind, DrawMode, GraphicsError};
use bioflux_batch::{
    BatchConfig, DrawBatchConfig, DrawCall, DrawCallBatchAdapter, GraphicsContext,
    ManualFrameScheduler, MutationBatchAdapter, MutationBatchConfig, OrganismState, PrimitiveType,
    UniformValue,
};
use bioflux_core::{CombinationStrategy, Priority, RecordingReporter};

// ─── Mutation batching ────────────────────────────────────────────────────────

fn mutation_adapter(organism: &OrganismState, strategy: CombinationStrategy) -> MutationBatchAdapter {
    MutationBatchAdapter::new(
        MutationBatchConfig {
            batch: BatchConfig {
                max_batch_size: 10,
                max_wait: Duration::from_secs(1),
                max_weight: None,
            },
            strategy,
            ..Default::default()
        },
        Arc::new(organism.clone()),
        Arc::new(RecordingReporter::new()),
    )
}

#[tokio::test(start_paused = true)]
async fn slider_burst_collapses_into_one_update() {
    let organism = OrganismState::new(0.0);
    let adapter = mutation_adapter(&organism, CombinationStrategy::Average);

    for i in 1..=5 {
        adapter.add_mutation(i as f64 / 10.0, Priority::Normal).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(organism.snapshot().applied_batches, 0);

    tokio::time::sleep(Duration::from_millis(200)).await;
    let snap = organism.snapshot();
    assert_eq!(snap.applied_batches, 1);
    assert!((snap.mutation_rate - 0.3).abs() < 1e-9);

    let stats = adapter.statistics();
    assert_eq!(stats.total_requests, 5);
    assert_eq!(stats.total_batches, 1);
    assert_eq!(stats.compression_ratio(), 5.0);
}

#[tokio::test(start_paused = true)]
async fn size_cap_splits_long_bursts() {
    let organism = OrganismState::new(0.0);
    let adapter = mutation_adapter(&organism, CombinationStrategy::Max);

    for i in 0..25 {
        adapter.add_mutation(i as f64 / 100.0, Priority::Low).await.unwrap();
    }
    assert_eq!(organism.snapshot().applied_batches, 2);
    assert_eq!(adapter.pending_count(), 5);

    assert_eq!(adapter.flush_batch().await.unwrap(), 5);
    let snap = organism.snapshot();
    assert_eq!(snap.applied_batches, 3);
    assert!((snap.mutation_rate - 0.24).abs() < 1e-9);
}

#[tokio::test(start_paused = true)]
async fn continuous_input_still_flushes_after_max_wait() {
    let organism = OrganismState::new(0.0);
    let adapter = MutationBatchAdapter::new(
        MutationBatchConfig {
            batch: BatchConfig {
                max_batch_size: 100,
                max_wait: Duration::from_secs(1),
                max_weight: None,
            },
            ..Default::default()
        },
        Arc::new(organism.clone()),
        Arc::new(RecordingReporter::new()),
    );

    // Each add resets the 100ms debounce, so only the max-wait valve fires.
    for _ in 0..13 {
        adapter.add_mutation(0.5, Priority::Normal).await.unwrap();
        tokio::time::sleep(Duration::from_millis(90)).await;
    }
    assert_eq!(organism.snapshot().applied_batches, 1);
    assert_eq!(adapter.statistics().total_requests, 13);
    assert_eq!(adapter.pending_count(), 0);
}

// ─── Draw batching ────────────────────────────────────────────────────────────

#[derive(Default)]
struct Canvas {
    draws: Mutex<Vec<(PrimitiveType, DrawMode)>>,
    uniforms: Mutex<Vec<BTreeMap<String, UniformValue>>>,
    live_buffers: Mutex<Vec<BufferId>>,
}

impl GraphicsContext for Canvas {
    fn create_buffer(&self, _kind: BufferKind) -> Result<BufferId, GraphicsError> {
        let mut live = self.live_buffers.lock().unwrap();
        let id = BufferId(live.len() as u64 + 1);
        live.push(id);
        Ok(id)
    }

    fn write_buffer(&self, id: BufferId, _data: &[u8]) -> Result<(), GraphicsError> {
        if self.live_buffers.lock().unwrap().contains(&id) {
            Ok(())
        } else {
            Err(GraphicsError::UnknownBuffer(id))
        }
    }

    fn destroy_buffer(&self, id: BufferId) -> Result<(), GraphicsError> {
        self.live_buffers.lock().unwrap().retain(|b| *b != id);
        Ok(())
    }

    fn set_uniforms(&self, uniforms: &BTreeMap<String, UniformValue>) -> Result<(), GraphicsError> {
        self.uniforms.lock().unwrap().push(uniforms.clone());
        Ok(())
    }

    fn draw(&self, primitive: PrimitiveType, mode: DrawMode) -> Result<(), GraphicsError> {
        self.draws.lock().unwrap().push((primitive, mode));
        Ok(())
    }
}

#[tokio::test]
async fn frame_of_organism_parts_renders_in_three_draws() {
    let canvas = Arc::new(Canvas::default());
    let frames = Arc::new(ManualFrameScheduler::new());
    let adapter = DrawCallBatchAdapter::new(
        canvas.clone(),
        frames.clone(),
        DrawBatchConfig {
            max_wait: Duration::from_secs(10),
            ..Default::default()
        },
        Arc::new(RecordingReporter::new()),
    )
    .unwrap();

    for cell in 0..10 {
        let body = DrawCall::new(PrimitiveType::Triangles, vec![cell as f32; 6])
            .with_indices(vec![0, 1, 2])
            .with_uniform("u_energy", UniformValue::Number(cell as f64));
        adapter.add_draw_call(body, Priority::Normal).await.unwrap();
        let edge = DrawCall::new(PrimitiveType::Lines, vec![0.0, 0.0, 1.0, 1.0]);
        adapter.add_draw_call(edge, Priority::Low).await.unwrap();
    }
    let nucleus = DrawCall::new(PrimitiveType::Points, vec![0.5, 0.5]);
    adapter.add_draw_call(nucleus, Priority::Normal).await.unwrap();

    assert_eq!(frames.run_frame().await, 1);
    assert_eq!(
        *canvas.draws.lock().unwrap(),
        vec![
            (PrimitiveType::Triangles, DrawMode::Elements { index_count: 30 }),
            (PrimitiveType::Lines, DrawMode::Arrays { vertex_count: 20 }),
            (PrimitiveType::Points, DrawMode::Arrays { vertex_count: 1 }),
        ]
    );
    assert_eq!(
        canvas.uniforms.lock().unwrap()[0]["u_energy"],
        UniformValue::Number(4.5)
    );

    let stats = adapter.stats();
    assert_eq!(stats.total_draw_calls, 21);
    assert_eq!(stats.total_batches, 3);
    assert_eq!(stats.compression_ratio, 7.0);

    drop(adapter);
    assert!(canvas.live_buffers.lock().unwrap().is_empty());
}
