//! Arena-backed neural network kernel.
//!
//! The same code runs on the worker thread and on the local fallback path,
//! so both produce identical numbers for identical inputs and RNG state.

use std::collections::{BTreeMap, HashMap};
use std::ops::RangeInclusive;

use rand::Rng;

use crate::error::NetworkError;
use crate::protocol::{ActivityReport, EdgeSpec, NodeSpec};

pub const WEIGHT_RANGE: RangeInclusive<f64> = -1.0..=1.0;
pub const BIAS_RANGE: RangeInclusive<f64> = -0.5..=0.5;
/// Largest perturbation applied to one weight or bias by `mutate`.
pub const MUTATION_STEP: f64 = 0.1;

/// Dense index of a node in its network's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeIndex(pub u32);

impl NodeIndex {
    fn get(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone)]
struct Node {
    id: String,
    bias: f64,
    activation: f64,
}

#[derive(Debug, Clone)]
struct Edge {
    source: NodeIndex,
    target: NodeIndex,
    weight: f64,
}

#[derive(Debug, Clone)]
pub struct NeuralNetwork {
    nodes: Vec<Node>,
    edges: Vec<Edge>,
    index: HashMap<String, NodeIndex>,
}

fn clamp(value: f64, range: &RangeInclusive<f64>) -> f64 {
    if value.is_nan() {
        return 0.0;
    }
    value.clamp(*range.start(), *range.end())
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

impl NeuralNetwork {
    /// Build a network. Weights and biases are clamped into range; initial
    /// activations into `[0, 1]`.
    pub fn build(nodes: &[NodeSpec], edges: &[EdgeSpec]) -> Result<Self, NetworkError> {
        let mut index = HashMap::with_capacity(nodes.len());
        let mut arena = Vec::with_capacity(nodes.len());
        for (i, spec) in nodes.iter().enumerate() {
            if index.insert(spec.id.clone(), NodeIndex(i as u32)).is_some() {
                return Err(NetworkError::DuplicateNode(spec.id.clone()));
            }
            arena.push(Node {
                id: spec.id.clone(),
                bias: clamp(spec.bias, &BIAS_RANGE),
                activation: clamp(spec.activation, &(0.0..=1.0)),
            });
        }

        let resolve = |id: &str| {
            index
                .get(id)
                .copied()
                .ok_or_else(|| NetworkError::UnknownNode(id.to_string()))
        };
        let edges = edges
            .iter()
            .map(|spec| {
                Ok(Edge {
                    source: resolve(&spec.source)?,
                    target: resolve(&spec.target)?,
                    weight: clamp(spec.weight, &WEIGHT_RANGE),
                })
            })
            .collect::<Result<Vec<_>, NetworkError>>()?;

        Ok(Self {
            nodes: arena,
            edges,
            index,
        })
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn node_index(&self, id: &str) -> Option<NodeIndex> {
        self.index.get(id).copied()
    }

    pub fn activation(&self, id: &str) -> Option<f64> {
        self.node_index(id).map(|i| self.nodes[i.get()].activation)
    }

    /// One synchronous propagation step.
    ///
    /// Nodes named in `inputs` take the (clamped) input value; every other
    /// node becomes `sigmoid(bias + Σ weight · source_activation)` computed
    /// from the activations at the start of the step. Unknown input ids are
    /// ignored.
    pub fn propagate(&mut self, inputs: &BTreeMap<String, f64>) -> BTreeMap<String, f64> {
        let mut clamped: Vec<Option<f64>> = vec![None; self.nodes.len()];
        for (id, value) in inputs {
            match self.index.get(id) {
                Some(i) => clamped[i.get()] = Some(clamp(*value, &(0.0..=1.0))),
                None => tracing::trace!(node = %id, "input for unknown node ignored"),
            }
        }

        let start: Vec<f64> = self
            .nodes
            .iter()
            .zip(&clamped)
            .map(|(node, input)| input.unwrap_or(node.activation))
            .collect();

        let mut sums: Vec<f64> = self.nodes.iter().map(|n| n.bias).collect();
        for edge in &self.edges {
            sums[edge.target.get()] += edge.weight * start[edge.source.get()];
        }

        for ((node, input), sum) in self.nodes.iter_mut().zip(&clamped).zip(&sums) {
            node.activation = input.unwrap_or_else(|| sigmoid(*sum));
        }
        self.activations()
    }

    /// Current activation of every node, by id.
    pub fn activations(&self) -> BTreeMap<String, f64> {
        self.nodes
            .iter()
            .map(|n| (n.id.clone(), n.activation))
            .collect()
    }

    /// Perturb each weight, then each bias, with probability `rate` by a
    /// uniform step in `[-MUTATION_STEP, MUTATION_STEP)`. Returns whether any
    /// value changed.
    pub fn mutate<R: Rng>(&mut self, rate: f64, rng: &mut R) -> bool {
        let rate = clamp(rate, &(0.0..=1.0));
        let mut changed = false;
        for edge in &mut self.edges {
            if rng.gen::<f64>() < rate {
                let next = clamp(edge.weight + rng.gen_range(-MUTATION_STEP..MUTATION_STEP), &WEIGHT_RANGE);
                changed |= next != edge.weight;
                edge.weight = next;
            }
        }
        for node in &mut self.nodes {
            if rng.gen::<f64>() < rate {
                let next = clamp(node.bias + rng.gen_range(-MUTATION_STEP..MUTATION_STEP), &BIAS_RANGE);
                changed |= next != node.bias;
                node.bias = next;
            }
        }
        changed
    }

    pub fn activity(&self) -> ActivityReport {
        let mean = |sum: f64, n: usize| if n == 0 { 0.0 } else { sum / n as f64 };
        ActivityReport {
            activity: mean(self.nodes.iter().map(|n| n.activation).sum(), self.nodes.len()),
            edge_strength: mean(self.edges.iter().map(|e| e.weight.abs()).sum(), self.edges.len()),
            node_count: self.nodes.len(),
            edge_count: self.edges.len(),
        }
    }
}
