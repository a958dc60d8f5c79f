//! bioflux-offload: neural computation on a background worker.
//!
//! # Features
//! - [`AsyncComputeOffload`]: request/response correlation by id, per-request
//!   timeouts, fault fan-out and a `Ready`/`Busy`/`Degraded` state machine
//! - [`ThreadWorkerSpawner`]: runs the kernel on a dedicated OS thread fed by
//!   a bounded channel
//! - [`NeuralNetwork`] / [`NetworkRegistry`]: arena-backed sigmoid kernel with
//!   seedable mutation, shared by the worker and the fallback path
//! - [`NeuralComputeService`]: tries the worker, falls back to local
//!   computation on any offload error
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use bioflux_core::TracingReporter;
//! use bioflux_offload::{
//!     AsyncComputeOffload, EdgeSpec, NeuralComputeService, NodeSpec, OffloadConfig,
//!     ThreadWorkerSpawner,
//! };
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let reporter = Arc::new(TracingReporter::new());
//! let offload = AsyncComputeOffload::new(
//!     Arc::new(ThreadWorkerSpawner::new(7)),
//!     OffloadConfig::default(),
//!     reporter.clone(),
//! );
//! offload.start();
//!
//! let service = NeuralComputeService::new(offload, 7, Duration::from_millis(500), reporter);
//! service
//!     .init_network("mesh", vec![NodeSpec::new("a"), NodeSpec::new("b")], vec![EdgeSpec::new("a", "b", 0.4)])
//!     .await?;
//! let activity = service.activity("mesh").await?;
//! println!("{} via {}", activity.value.activity, activity.path);
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod network;
pub mod offload;
pub mod protocol;
pub mod registry;
pub mod service;
pub mod worker;

pub use error::{NetworkError, OffloadError};
pub use network::{NeuralNetwork, NodeIndex};
pub use offload::{AsyncComputeOffload, OffloadConfig, OffloadState, OffloadStats};
pub use protocol::{
    ActivityReport, ComputeRequest, ComputeResponse, EdgeSpec, InitReport, NodeSpec, WorkerMessage,
    WorkerReply, WorkerResponse,
};
pub use registry::NetworkRegistry;
pub use service::{ComputePath, Computed, NeuralComputeService};
pub use worker::{ThreadWorkerSpawner, WorkerChannels, WorkerEvent, WorkerSpawner};
