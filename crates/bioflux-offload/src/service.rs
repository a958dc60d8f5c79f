//! Neural computation with worker offload and synchronous local fallback.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bioflux_core::report::{ErrorContext, ErrorReporter, Severity};

use crate::error::{NetworkError, OffloadError};
use crate::offload::AsyncComputeOffload;
use crate::protocol::{
    ActivityPayload, ActivityReport, ComputeRequest, ComputeResponse, EdgeSpec, InitPayload,
    InitReport, MutatePayload, NodeSpec, PropagatePayload,
};
use crate::registry::NetworkRegistry;

const COMPONENT: &str = "neural-compute";

/// Which execution context produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComputePath {
    Worker,
    Fallback,
}

impl std::fmt::Display for ComputePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Worker => write!(f, "worker"),
            Self::Fallback => write!(f, "fallback"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Computed<T> {
    pub value: T,
    pub path: ComputePath,
}

/// Runs neural kernels on the worker when it can and locally when it cannot.
///
/// Every network is also registered in a local registry seeded like the
/// worker's. Calls that change network state (propagate, mutate) are replayed
/// on the local copy after the worker answers, so a later fallback continues
/// from the same weights, activations and RNG position the worker had.
pub struct NeuralComputeService {
    offload: AsyncComputeOffload,
    local: Mutex<NetworkRegistry>,
    reporter: Arc<dyn ErrorReporter>,
    timeout: Duration,
}

impl NeuralComputeService {
    /// `seed` must match the seed the worker's registry was created with.
    pub fn new(
        offload: AsyncComputeOffload,
        seed: u64,
        timeout: Duration,
        reporter: Arc<dyn ErrorReporter>,
    ) -> Self {
        Self {
            offload,
            local: Mutex::new(NetworkRegistry::new(seed)),
            reporter,
            timeout,
        }
    }

    pub fn offload(&self) -> &AsyncComputeOffload {
        &self.offload
    }

    /// Validate and register a network locally, then on the worker.
    pub async fn init_network(
        &self,
        network_id: &str,
        nodes: Vec<NodeSpec>,
        edges: Vec<EdgeSpec>,
    ) -> Result<Computed<InitReport>, NetworkError> {
        let local = self.local.lock().unwrap().init(network_id, &nodes, &edges)?;
        let request = ComputeRequest::Init(InitPayload {
            network_id: network_id.to_string(),
            nodes,
            edges,
        });
        match self.on_worker(request, "initialized network", |r| match r {
            ComputeResponse::Initialized(report) => Some(report),
            _ => None,
        })
        .await
        {
            Some(report) => Ok(Computed {
                value: report,
                path: ComputePath::Worker,
            }),
            None => Ok(Computed {
                value: local,
                path: ComputePath::Fallback,
            }),
        }
    }

    pub async fn propagate(
        &self,
        network_id: &str,
        inputs: BTreeMap<String, f64>,
    ) -> Result<Computed<BTreeMap<String, f64>>, NetworkError> {
        let request = ComputeRequest::Propagate(PropagatePayload {
            network_id: network_id.to_string(),
            input_activations: inputs,
        });
        self.compute(request, "activations", |r| match r {
            ComputeResponse::Activations(map) => Some(map),
            _ => None,
        })
        .await
    }

    pub async fn mutate(&self, network_id: &str, rate: f64) -> Result<Computed<bool>, NetworkError> {
        let request = ComputeRequest::Mutate(MutatePayload {
            network_id: network_id.to_string(),
            rate,
        });
        self.compute(request, "mutation flag", |r| match r {
            ComputeResponse::Applied(applied) => Some(applied),
            _ => None,
        })
        .await
    }

    pub async fn activity(&self, network_id: &str) -> Result<Computed<ActivityReport>, NetworkError> {
        let request = ComputeRequest::Activity(ActivityPayload {
            network_id: network_id.to_string(),
        });
        self.compute(request, "activity report", |r| match r {
            ComputeResponse::Activity(report) => Some(report),
            _ => None,
        })
        .await
    }

    async fn compute<T>(
        &self,
        request: ComputeRequest,
        expected: &'static str,
        extract: fn(ComputeResponse) -> Option<T>,
    ) -> Result<Computed<T>, NetworkError> {
        if let Some(value) = self.on_worker(request.clone(), expected, extract).await {
            if changes_state(&request) {
                self.mirror(&request);
            }
            return Ok(Computed {
                value,
                path: ComputePath::Worker,
            });
        }
        let response = self.local.lock().unwrap().handle(&request)?;
        let value = extract(response).ok_or_else(|| NetworkError::UnknownNetwork(request.network_id().to_string()))?;
        Ok(Computed {
            value,
            path: ComputePath::Fallback,
        })
    }

    /// Apply a request the worker already executed to the local registry.
    fn mirror(&self, request: &ComputeRequest) {
        if let Err(e) = self.local.lock().unwrap().handle(request) {
            tracing::warn!(
                kind = request.kind(),
                network = request.network_id(),
                error = %e,
                "local mirror rejected a request the worker accepted"
            );
        }
    }

    /// The worker's answer, or `None` after reporting why the caller must
    /// fall back.
    async fn on_worker<T>(
        &self,
        request: ComputeRequest,
        expected: &'static str,
        extract: fn(ComputeResponse) -> Option<T>,
    ) -> Option<T> {
        let kind = request.kind();
        let network = request.network_id().to_string();
        let error = match self.offload.send(request, self.timeout).await {
            Ok(response) => match extract(response) {
                Some(value) => return Some(value),
                None => OffloadError::UnexpectedResponse(expected),
            },
            Err(e) => e,
        };
        let severity = match &error {
            OffloadError::Unavailable { .. } => Severity::Debug,
            _ => Severity::Warning,
        };
        tracing::debug!(kind, %network, error = %error, "falling back to local computation");
        self.reporter.report(
            ErrorContext::new(COMPONENT, "compute")
                .report(severity, format!("{kind} for {network} on fallback path: {error}")),
        );
        None
    }
}

fn changes_state(request: &ComputeRequest) -> bool {
    matches!(request, ComputeRequest::Propagate(_) | ComputeRequest::Mutate(_))
}
