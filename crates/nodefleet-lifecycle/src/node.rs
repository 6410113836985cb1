//! Observed node records and the derived lifecycle state.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapacityType {
    Spot,
    OnDemand,
}

/// Status of the underlying machine as reported by the compute provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Pending,
    Running,
    Stopping,
    Terminated,
}

/// Lifecycle state of a node, derived fresh from each observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    /// Create call issued, not yet observed.
    Requested,
    Joining,
    Ready,
    Draining,
    Terminated,
}

/// A worker as observed through the compute API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub node_id: String,
    pub cluster_id: String,
    /// Unix timestamp (seconds) the machine was launched.
    pub launch_time: u64,
    pub availability_zone: String,
    pub capacity_type: CapacityType,
    pub instance: InstanceStatus,
    /// The control plane accepts new workloads on this node.
    pub schedulable: bool,
    /// Explicitly marked unschedulable by a scale-down.
    #[serde(default)]
    pub cordoned: bool,
    #[serde(default)]
    pub workload_count: u32,
    /// Workloads that must never be evicted by a scale-down.
    #[serde(default)]
    pub critical_workloads: u32,
    /// The provider announced it will reclaim this machine.
    #[serde(default)]
    pub interruption_notice: bool,
}

impl Node {
    pub fn state(&self) -> NodeState {
        match self.instance {
            InstanceStatus::Stopping | InstanceStatus::Terminated => NodeState::Terminated,
            _ if self.cordoned => NodeState::Draining,
            InstanceStatus::Running if self.schedulable => NodeState::Ready,
            InstanceStatus::Pending | InstanceStatus::Running => NodeState::Joining,
        }
    }

    pub fn is_live(&self) -> bool {
        self.state() != NodeState::Terminated
    }

    pub fn is_ready(&self) -> bool {
        self.state() == NodeState::Ready
    }
}

/// Nodes currently serving workloads.
pub fn ready_count(nodes: &[Node]) -> u32 {
    nodes.iter().filter(|n| n.is_ready()).count() as u32
}
