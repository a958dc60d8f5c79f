//! Worker message envelopes.
//!
//! Requests travel as `{ "type", "id", "payload" }` and replies as
//! `{ "type": "RESULT" | "ERROR", "id", "payload", "processingTimeMs" }`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A node of a network definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: String,
    #[serde(default)]
    pub bias: f64,
    /// Initial activation.
    #[serde(default)]
    pub activation: f64,
}

impl NodeSpec {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            bias: 0.0,
            activation: 0.0,
        }
    }

    pub fn with_bias(mut self, bias: f64) -> Self {
        self.bias = bias;
        self
    }
}

/// A weighted directed edge between two nodes, by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeSpec {
    pub source: String,
    pub target: String,
    pub weight: f64,
}

impl EdgeSpec {
    pub fn new(source: impl Into<String>, target: impl Into<String>, weight: f64) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            weight,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitPayload {
    pub network_id: String,
    pub nodes: Vec<NodeSpec>,
    pub edges: Vec<EdgeSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropagatePayload {
    pub network_id: String,
    #[serde(default)]
    pub input_activations: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutatePayload {
    pub network_id: String,
    pub rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityPayload {
    pub network_id: String,
}

/// Work the worker understands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ComputeRequest {
    Init(InitPayload),
    Propagate(PropagatePayload),
    Mutate(MutatePayload),
    Activity(ActivityPayload),
}

impl ComputeRequest {
    /// Wire name of the message type.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Init(_) => "INIT",
            Self::Propagate(_) => "PROPAGATE",
            Self::Mutate(_) => "MUTATE",
            Self::Activity(_) => "ACTIVITY",
        }
    }

    pub fn network_id(&self) -> &str {
        match self {
            Self::Init(p) => &p.network_id,
            Self::Propagate(p) => &p.network_id,
            Self::Mutate(p) => &p.network_id,
            Self::Activity(p) => &p.network_id,
        }
    }
}

/// Result of `INIT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct InitReport {
    pub node_count: usize,
    pub edge_count: usize,
}

/// Result of `ACTIVITY`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ActivityReport {
    /// Mean node activation.
    pub activity: f64,
    /// Mean absolute edge weight.
    pub edge_strength: f64,
    pub node_count: usize,
    pub edge_count: usize,
}

/// `RESULT` payload. Variant order matters for untagged decoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ComputeResponse {
    Activity(ActivityReport),
    Initialized(InitReport),
    Applied(bool),
    Activations(BTreeMap<String, f64>),
}

/// Request envelope.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerMessage {
    pub id: u64,
    #[serde(flatten)]
    pub request: ComputeRequest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerReply {
    Result(ComputeResponse),
    Error(String),
}

/// Reply envelope.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerResponse {
    pub id: u64,
    #[serde(flatten)]
    pub reply: WorkerReply,
    #[serde(rename = "processingTimeMs")]
    pub processing_time_ms: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_envelope_shape() {
        let msg = WorkerMessage {
            id: 7,
            request: ComputeRequest::Mutate(MutatePayload {
                network_id: "mesh".into(),
                rate: 0.25,
            }),
        };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({ "id": 7, "type": "MUTATE", "payload": { "networkId": "mesh", "rate": 0.25 } })
        );
    }

    #[test]
    fn response_envelope_shape() {
        let ok = WorkerResponse {
            id: 3,
            reply: WorkerReply::Result(ComputeResponse::Applied(true)),
            processing_time_ms: 1.5,
        };
        assert_eq!(
            serde_json::to_value(&ok).unwrap(),
            json!({ "id": 3, "type": "RESULT", "payload": true, "processingTimeMs": 1.5 })
        );

        let err = WorkerResponse {
            id: 4,
            reply: WorkerReply::Error("unknown network: x".into()),
            processing_time_ms: 0.0,
        };
        assert_eq!(serde_json::to_value(&err).unwrap()["type"], "ERROR");
    }

    #[test]
    fn request_payload_decodes_with_defaults() {
        let req: ComputeRequest = serde_json::from_value(json!({
            "type": "INIT",
            "payload": {
                "networkId": "n",
                "nodes": [{ "id": "a" }, { "id": "b", "bias": 0.2 }],
                "edges": [{ "source": "a", "target": "b", "weight": 0.5 }]
            }
        }))
        .unwrap();
        assert_eq!(req.kind(), "INIT");
        assert_eq!(req.network_id(), "n");
        let ComputeRequest::Init(init) = req else {
            panic!("expected INIT");
        };
        assert_eq!(init.nodes[0], NodeSpec::new("a"));
        assert_eq!(init.nodes[1].bias, 0.2);
    }

    #[test]
    fn result_payloads_decode_to_the_right_variant() {
        let activity: ComputeResponse = serde_json::from_value(json!({
            "activity": 0.5, "edgeStrength": 0.25, "nodeCount": 3, "edgeCount": 2
        }))
        .unwrap();
        assert!(matches!(activity, ComputeResponse::Activity(_)));

        let init: ComputeResponse =
            serde_json::from_value(json!({ "nodeCount": 3, "edgeCount": 2 })).unwrap();
        assert_eq!(
            init,
            ComputeResponse::Initialized(InitReport { node_count: 3, edge_count: 2 })
        );

        let activations: ComputeResponse =
            serde_json::from_value(json!({ "a": 0.1, "b": 0.9 })).unwrap();
        assert!(matches!(activations, ComputeResponse::Activations(m) if m.len() == 2));
    }
}
