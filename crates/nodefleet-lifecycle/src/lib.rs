//! nodefleet-lifecycle: executes scaling decisions against live nodes.
//!
//! The controller never trusts a cached intention. Every operation starts
//! by listing the cluster's nodes from the [`ComputeApi`] and derives each
//! node's [`NodeState`] from what it observes, which is what makes
//! `scale_up`, `scale_down` and `reconcile` safe to re-run after a crash.
//!
//! # Node states
//!
//! ```text
//! requested ──create ok──▶ joining ──schedulable──▶ ready
//!     │                       │                       │ cordon (scale-down)
//!     │                       │                       ▼
//!     └───────────────────────┴────────────────▶ draining ──▶ terminated
//!              provisioning failure / reclamation      grace elapsed or drained
//! ```
//!
//! # Adapters
//!
//! - [`SimulatedCluster`]: in-memory, scriptable; implements both traits
//! - [`HttpComputeApi`]: JSON REST gateway in front of the compute provider
//! - [`KubectlControlPlane`]: `kubectl cordon` / `kubectl drain`

pub mod api;
pub mod controller;
pub mod error;
pub mod http_compute;
pub mod kubectl;
pub mod node;
pub mod placement;
pub mod selection;
pub mod sim;

pub use api::{
    BoxFuture, ComputeApi, ControlPlane, CreateNodeRequest, DrainStatus, MutationGuard, Unguarded,
};
pub use controller::{
    DrainResult, LifecycleController, ReconcileOutcome, RetiredNode, ScaleDownOutcome,
    ScaleUpOutcome,
};
pub use error::{LifecycleError, LifecycleResult};
pub use http_compute::HttpComputeApi;
pub use kubectl::KubectlControlPlane;
pub use node::{CapacityType, InstanceStatus, Node, NodeState};
pub use sim::{DrainBehavior, SimulatedCluster};
