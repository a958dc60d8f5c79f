//! Networks by id, each with its own seeded RNG.

use std::collections::{BTreeMap, HashMap};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::NetworkError;
use crate::network::NeuralNetwork;
use crate::protocol::{ActivityReport, ComputeRequest, ComputeResponse, EdgeSpec, InitReport, NodeSpec};

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// 64-bit FNV-1a; stable across processes and platforms.
fn fnv1a(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .fold(FNV_OFFSET, |hash, b| (hash ^ u64::from(*b)).wrapping_mul(FNV_PRIME))
}

struct Entry<R> {
    network: NeuralNetwork,
    rng: R,
}

/// Owns every network known to one execution context (the worker thread or
/// the local fallback).
///
/// `R` is the random source behind mutation; every network gets its own
/// instance seeded from the registry seed and the network id.
pub struct NetworkRegistry<R = StdRng> {
    seed: u64,
    networks: HashMap<String, Entry<R>>,
}

impl NetworkRegistry<StdRng> {
    pub fn new(seed: u64) -> Self {
        Self::with_rng(seed)
    }
}

impl<R: Rng + SeedableRng> NetworkRegistry<R> {
    pub fn with_rng(seed: u64) -> Self {
        Self {
            seed,
            networks: HashMap::new(),
        }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn contains(&self, network_id: &str) -> bool {
        self.networks.contains_key(network_id)
    }

    pub fn len(&self) -> usize {
        self.networks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.networks.is_empty()
    }

    /// Build and register `network_id`, replacing any previous definition
    /// and restarting its RNG stream.
    pub fn init(
        &mut self,
        network_id: &str,
        nodes: &[NodeSpec],
        edges: &[EdgeSpec],
    ) -> Result<InitReport, NetworkError> {
        let network = NeuralNetwork::build(nodes, edges)?;
        let report = InitReport {
            node_count: network.node_count(),
            edge_count: network.edge_count(),
        };
        let rng = R::seed_from_u64(self.seed ^ fnv1a(network_id.as_bytes()));
        self.networks
            .insert(network_id.to_string(), Entry { network, rng });
        Ok(report)
    }

    pub fn propagate(
        &mut self,
        network_id: &str,
        inputs: &BTreeMap<String, f64>,
    ) -> Result<BTreeMap<String, f64>, NetworkError> {
        Ok(self.entry(network_id)?.network.propagate(inputs))
    }

    pub fn mutate(&mut self, network_id: &str, rate: f64) -> Result<bool, NetworkError> {
        let entry = self.entry(network_id)?;
        Ok(entry.network.mutate(rate, &mut entry.rng))
    }

    pub fn activity(&mut self, network_id: &str) -> Result<ActivityReport, NetworkError> {
        Ok(self.entry(network_id)?.network.activity())
    }

    /// Execute one protocol request.
    pub fn handle(&mut self, request: &ComputeRequest) -> Result<ComputeResponse, NetworkError> {
        match request {
            ComputeRequest::Init(p) => self
                .init(&p.network_id, &p.nodes, &p.edges)
                .map(ComputeResponse::Initialized),
            ComputeRequest::Propagate(p) => self
                .propagate(&p.network_id, &p.input_activations)
                .map(ComputeResponse::Activations),
            ComputeRequest::Mutate(p) => self
                .mutate(&p.network_id, p.rate)
                .map(ComputeResponse::Applied),
            ComputeRequest::Activity(p) => self
                .activity(&p.network_id)
                .map(ComputeResponse::Activity),
        }
    }

    fn entry(&mut self, network_id: &str) -> Result<&mut Entry<R>, NetworkError> {
        self.networks
            .get_mut(network_id)
            .ok_or_else(|| NetworkError::UnknownNetwork(network_id.to_string()))
    }
}
