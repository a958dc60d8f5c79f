//! Draw-call model and the per-primitive merge.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};

use tokio::time::Instant;

use bioflux_core::error::BatchError;
use bioflux_core::request::{BatchRequest, BatchToken};
use bioflux_core::sink::Combiner;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PrimitiveType {
    Triangles,
    Lines,
    Points,
}

impl std::fmt::Display for PrimitiveType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Triangles => write!(f, "triangles"),
            Self::Lines => write!(f, "lines"),
            Self::Points => write!(f, "points"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum UniformValue {
    Number(f64),
    Vector(Vec<f32>),
    Flag(bool),
}

/// One draw submission from a rendering caller.
#[derive(Debug, Clone, PartialEq)]
pub struct DrawCall {
    pub primitive: PrimitiveType,
    /// Flat vertex attributes, `components_per_vertex` floats per vertex.
    pub vertices: Vec<f32>,
    pub indices: Option<Vec<u32>>,
    pub uniforms: BTreeMap<String, UniformValue>,
}

impl DrawCall {
    pub fn new(primitive: PrimitiveType, vertices: Vec<f32>) -> Self {
        Self {
            primitive,
            vertices,
            indices: None,
            uniforms: BTreeMap::new(),
        }
    }

    pub fn with_indices(mut self, indices: Vec<u32>) -> Self {
        self.indices = Some(indices);
        self
    }

    pub fn with_uniform(mut self, key: impl Into<String>, value: UniformValue) -> Self {
        self.uniforms.insert(key.into(), value);
        self
    }

    pub fn vertex_count(&self, components_per_vertex: usize) -> usize {
        self.vertices.len() / components_per_vertex.max(1)
    }

    /// Reject calls that cannot be merged into a valid buffer.
    pub fn validate(&self, components_per_vertex: usize) -> Result<(), BatchError> {
        let components = components_per_vertex.max(1);
        if self.vertices.is_empty() {
            return Err(BatchError::Validation("draw call has no vertices".into()));
        }
        if self.vertices.len() % components != 0 {
            return Err(BatchError::Validation(format!(
                "vertex array length {} is not a multiple of {components}",
                self.vertices.len()
            )));
        }
        let count = self.vertex_count(components);
        if let Some(bad) = self
            .indices
            .iter()
            .flatten()
            .find(|&&i| i as usize >= count)
        {
            return Err(BatchError::Validation(format!(
                "index {bad} out of range for {count} vertices"
            )));
        }
        Ok(())
    }
}

/// All draw calls of one primitive type merged into a single submission.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedDrawBatch {
    pub primitive: PrimitiveType,
    pub vertices: Vec<f32>,
    /// Present when at least one member was indexed.
    pub indices: Option<Vec<u32>>,
    pub uniforms: BTreeMap<String, UniformValue>,
    pub draw_call_count: usize,
    pub vertex_count: usize,
}

/// Merge `calls` into one batch per primitive type, in first-appearance order.
///
/// Members without vertices are skipped; an input with no valid members
/// yields an empty vector.
pub fn merge_draw_calls<'a, I>(calls: I, components_per_vertex: usize) -> Vec<MergedDrawBatch>
where
    I: IntoIterator<Item = &'a DrawCall>,
{
    group_by_primitive(calls.into_iter().filter(|c| !c.vertices.is_empty()), |c| c.primitive)
        .into_iter()
        .map(|(primitive, members)| merge_group(primitive, &members, components_per_vertex))
        .collect()
}

fn group_by_primitive<X>(
    items: impl Iterator<Item = X>,
    primitive: impl Fn(&X) -> PrimitiveType,
) -> Vec<(PrimitiveType, Vec<X>)> {
    let mut groups: Vec<(PrimitiveType, Vec<X>)> = Vec::new();
    for item in items {
        let key = primitive(&item);
        match groups.iter_mut().find(|(p, _)| *p == key) {
            Some((_, members)) => members.push(item),
            None => groups.push((key, vec![item])),
        }
    }
    groups
}

fn merge_group(primitive: PrimitiveType, members: &[&DrawCall], components: usize) -> MergedDrawBatch {
    let total_floats: usize = members.iter().map(|c| c.vertices.len()).sum();
    let indexed = members.iter().any(|c| c.indices.is_some());

    let mut vertices = vec![0.0f32; total_floats];
    let mut indices = indexed.then(Vec::new);
    let mut uniforms = UniformMerger::default();
    let mut float_offset = 0usize;
    let mut vertex_offset = 0u32;

    for call in members {
        let len = call.vertices.len();
        vertices[float_offset..float_offset + len].copy_from_slice(&call.vertices);
        let count = call.vertex_count(components) as u32;

        if let Some(out) = indices.as_mut() {
            match &call.indices {
                Some(src) => out.extend(src.iter().map(|i| i + vertex_offset)),
                None => out.extend(vertex_offset..vertex_offset + count),
            }
        }
        uniforms.absorb(&call.uniforms);

        float_offset += len;
        vertex_offset += count;
    }

    MergedDrawBatch {
        primitive,
        vertices,
        indices,
        uniforms: uniforms.finish(),
        draw_call_count: members.len(),
        vertex_count: vertex_offset as usize,
    }
}

enum UniformSlot {
    Numeric { sum: f64, count: u32 },
    Fixed(UniformValue),
}

/// Numeric uniforms are averaged across members; any other value keeps
/// whichever member wrote the key first.
#[derive(Default)]
struct UniformMerger {
    slots: BTreeMap<String, UniformSlot>,
}

impl UniformMerger {
    fn absorb(&mut self, uniforms: &BTreeMap<String, UniformValue>) {
        for (key, value) in uniforms {
            match (self.slots.get_mut(key), value) {
                (None, UniformValue::Number(n)) => {
                    self.slots
                        .insert(key.clone(), UniformSlot::Numeric { sum: *n, count: 1 });
                }
                (None, other) => {
                    self.slots.insert(key.clone(), UniformSlot::Fixed(other.clone()));
                }
                (Some(UniformSlot::Numeric { sum, count }), UniformValue::Number(n)) => {
                    *sum += n;
                    *count += 1;
                }
                (Some(_), _) => {}
            }
        }
    }

    fn finish(self) -> BTreeMap<String, UniformValue> {
        self.slots
            .into_iter()
            .map(|(key, slot)| {
                let value = match slot {
                    UniformSlot::Numeric { sum, count } => UniformValue::Number(sum / count as f64),
                    UniformSlot::Fixed(value) => value,
                };
                (key, value)
            })
            .collect()
    }
}

/// One merged draw of a frame together with the requests it was built from.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameGroup {
    pub batch: MergedDrawBatch,
    pub tokens: Vec<BatchToken>,
}

/// Combiner grouping a frame's draw calls by primitive type.
///
/// Requests recorded with [`mark_drawn`](Self::mark_drawn) are left out of
/// later frames: they already reached the GPU in a frame whose remaining
/// groups failed, and the coordinator re-queues the whole frame.
#[derive(Debug, Clone)]
pub struct DrawCallCombiner {
    pub components_per_vertex: usize,
    drawn: Arc<Mutex<HashSet<BatchToken>>>,
}

impl DrawCallCombiner {
    pub fn new(components_per_vertex: usize) -> Self {
        Self {
            components_per_vertex: components_per_vertex.max(1),
            drawn: Arc::default(),
        }
    }

    /// Record requests whose geometry was drawn in a frame that then failed.
    pub fn mark_drawn(&self, tokens: impl IntoIterator<Item = BatchToken>) {
        self.drawn.lock().unwrap().extend(tokens);
    }

    /// Forget recorded requests once a frame completes.
    pub fn clear_drawn(&self) {
        self.drawn.lock().unwrap().clear();
    }

    pub fn drawn_count(&self) -> usize {
        self.drawn.lock().unwrap().len()
    }
}

impl Combiner<DrawCall> for DrawCallCombiner {
    type Output = Vec<FrameGroup>;

    fn weight(&self, value: &DrawCall) -> usize {
        value.vertex_count(self.components_per_vertex)
    }

    fn combine(&self, batch: &[BatchRequest<DrawCall>], _now: Instant) -> Vec<FrameGroup> {
        let drawn = self.drawn.lock().unwrap();
        let live = batch
            .iter()
            .filter(|r| !r.value.vertices.is_empty() && !drawn.contains(&r.token));
        group_by_primitive(live, |r| r.value.primitive)
            .into_iter()
            .map(|(primitive, members)| {
                let calls: Vec<&DrawCall> = members.iter().map(|r| &r.value).collect();
                FrameGroup {
                    batch: merge_group(primitive, &calls, self.components_per_vertex),
                    tokens: members.iter().map(|r| r.token).collect(),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bioflux_core::request::Priority;

    fn quad(primitive: PrimitiveType, base: f32) -> DrawCall {
        DrawCall::new(primitive, (0..8).map(|i| base + i as f32).collect())
    }

    #[test]
    fn merges_two_triangle_calls() {
        let a = quad(PrimitiveType::Triangles, 0.0);
        let b = quad(PrimitiveType::Triangles, 100.0);
        let merged = merge_draw_calls([&a, &b], 2);
        assert_eq!(merged.len(), 1);
        let m = &merged[0];
        assert_eq!(m.vertices.len(), 16);
        assert_eq!(m.draw_call_count, 2);
        assert_eq!(m.vertex_count, 8);
        assert_eq!(&m.vertices[..8], a.vertices.as_slice());
        assert_eq!(&m.vertices[8..], b.vertices.as_slice());
        assert!(m.indices.is_none());
    }

    #[test]
    fn indices_are_offset_by_prior_vertex_count() {
        let a = quad(PrimitiveType::Triangles, 0.0).with_indices(vec![0, 1, 2, 2, 3, 0]);
        let b = quad(PrimitiveType::Triangles, 10.0).with_indices(vec![0, 1, 2, 2, 3, 0]);
        let merged = merge_draw_calls([&a, &b], 2);
        assert_eq!(
            merged[0].indices.as_deref(),
            Some(&[0, 1, 2, 2, 3, 0, 4, 5, 6, 6, 7, 4][..])
        );
    }

    #[test]
    fn non_indexed_members_get_sequential_indices_in_indexed_group() {
        let a = quad(PrimitiveType::Triangles, 0.0);
        let b = quad(PrimitiveType::Triangles, 10.0).with_indices(vec![3, 2, 1]);
        let merged = merge_draw_calls([&a, &b], 2);
        assert_eq!(
            merged[0].indices.as_deref(),
            Some(&[0, 1, 2, 3, 7, 6, 5][..])
        );
    }

    #[test]
    fn groups_by_primitive_in_first_appearance_order() {
        let calls = [
            quad(PrimitiveType::Lines, 0.0),
            quad(PrimitiveType::Points, 0.0),
            quad(PrimitiveType::Lines, 1.0),
        ];
        let merged = merge_draw_calls(&calls, 2);
        let order: Vec<_> = merged.iter().map(|m| (m.primitive, m.draw_call_count)).collect();
        assert_eq!(order, vec![(PrimitiveType::Lines, 2), (PrimitiveType::Points, 1)]);
    }

    #[test]
    fn empty_members_are_filtered() {
        let empty = DrawCall::new(PrimitiveType::Points, vec![]);
        assert!(merge_draw_calls([&empty], 2).is_empty());
        assert!(merge_draw_calls(std::iter::empty::<&DrawCall>(), 2).is_empty());

        let real = quad(PrimitiveType::Points, 0.0);
        let merged = merge_draw_calls([&empty, &real], 2);
        assert_eq!(merged[0].draw_call_count, 1);
    }

    #[test]
    fn uniforms_average_numbers_first_writer_wins_otherwise() {
        let a = quad(PrimitiveType::Triangles, 0.0)
            .with_uniform("u_time", UniformValue::Number(1.0))
            .with_uniform("u_color", UniformValue::Vector(vec![1.0, 0.0, 0.0]))
            .with_uniform("u_glow", UniformValue::Flag(true));
        let b = quad(PrimitiveType::Triangles, 0.0)
            .with_uniform("u_time", UniformValue::Number(2.0))
            .with_uniform("u_color", UniformValue::Vector(vec![0.0, 1.0, 0.0]));
        let c = quad(PrimitiveType::Triangles, 0.0)
            .with_uniform("u_time", UniformValue::Number(6.0))
            .with_uniform("u_glow", UniformValue::Flag(false));
        let merged = merge_draw_calls([&a, &b, &c], 2);
        let u = &merged[0].uniforms;
        assert_eq!(u["u_time"], UniformValue::Number(3.0));
        assert_eq!(u["u_color"], UniformValue::Vector(vec![1.0, 0.0, 0.0]));
        assert_eq!(u["u_glow"], UniformValue::Flag(true));
    }

    #[test]
    fn validation_rejects_malformed_calls() {
        assert!(DrawCall::new(PrimitiveType::Points, vec![]).validate(2).is_err());
        assert!(DrawCall::new(PrimitiveType::Points, vec![0.0; 3]).validate(2).is_err());
        let out_of_range = quad(PrimitiveType::Triangles, 0.0).with_indices(vec![0, 4]);
        assert!(out_of_range.validate(2).unwrap_err().is_validation());
        assert!(quad(PrimitiveType::Triangles, 0.0).with_indices(vec![0, 3]).validate(2).is_ok());
    }

    #[test]
    fn combiner_skips_requests_drawn_in_a_failed_frame() {
        let now = Instant::now();
        let batch = vec![
            BatchRequest::with_timestamp(BatchToken(1), quad(PrimitiveType::Lines, 0.0), Priority::Normal, now),
            BatchRequest::with_timestamp(BatchToken(2), quad(PrimitiveType::Points, 0.0), Priority::Normal, now),
            BatchRequest::with_timestamp(BatchToken(3), quad(PrimitiveType::Lines, 1.0), Priority::Normal, now),
        ];
        let combiner = DrawCallCombiner::new(2);
        let frame = combiner.combine(&batch, now);
        assert_eq!(frame.len(), 2);
        assert_eq!(frame[0].tokens, vec![BatchToken(1), BatchToken(3)]);

        combiner.clone().mark_drawn(frame[0].tokens.iter().copied());
        let retry = combiner.combine(&batch, now);
        assert_eq!(retry.len(), 1);
        assert_eq!(retry[0].batch.primitive, PrimitiveType::Points);
        assert_eq!(retry[0].tokens, vec![BatchToken(2)]);

        combiner.clear_drawn();
        assert_eq!(combiner.combine(&batch, now).len(), 2);
    }
}
