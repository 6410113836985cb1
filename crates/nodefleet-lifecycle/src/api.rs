//! External contracts: the compute provider and the cluster control plane.
//!
//! Both traits return boxed futures so they stay object safe and can be
//! swapped at runtime (`Arc<dyn ComputeApi>`). Implementations should not
//! apply their own retry policy; the controller bounds every call with
//! `call_timeout` and decides what a failure means.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::LifecycleResult;
use crate::node::{CapacityType, Node};

/// Boxed future alias for lifecycle calls.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = LifecycleResult<T>> + Send + 'a>>;

/// Everything the provider needs to launch one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateNodeRequest {
    pub cluster_id: String,
    pub availability_zone: String,
    /// Launch template name.
    pub template: String,
    pub capacity_type: CapacityType,
}

/// How a drain request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrainStatus {
    Completed,
    /// Workloads were still running when the grace period ran out.
    TimedOut,
}

pub trait ComputeApi: Send + Sync {
    /// Every node the provider knows for the cluster, including recently
    /// terminated ones.
    fn list_nodes<'a>(&'a self, cluster_id: &'a str) -> BoxFuture<'a, Vec<Node>>;

    /// Launch a node and return its id.
    fn create_node<'a>(&'a self, request: &'a CreateNodeRequest) -> BoxFuture<'a, String>;

    /// Current view of one node; `None` once the provider has forgotten it.
    fn describe_node<'a>(&'a self, node_id: &'a str) -> BoxFuture<'a, Option<Node>>;

    /// Request termination. Terminating an already terminated node succeeds.
    fn terminate_node<'a>(&'a self, node_id: &'a str) -> BoxFuture<'a, ()>;
}

pub trait ControlPlane: Send + Sync {
    /// Mark the node unschedulable.
    fn cordon<'a>(&'a self, node_id: &'a str) -> BoxFuture<'a, ()>;

    /// Evict the node's workloads, giving up after `grace`.
    fn drain<'a>(&'a self, node_id: &'a str, grace: Duration) -> BoxFuture<'a, DrainStatus>;
}

/// Consulted before every node mutation. Returning `false` aborts the
/// operation before it touches the node.
pub trait MutationGuard: Send + Sync {
    fn may_mutate(&self) -> bool;
}

/// A guard that always allows mutation.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unguarded;

impl MutationGuard for Unguarded {
    fn may_mutate(&self) -> bool {
        true
    }
}
