//! SimulatedCluster: an in-memory compute provider and control plane.
//!
//! Backs the integration tests and `fleetd simulate`. Behavior that is hard
//! to provoke against real infrastructure can be scripted: slow boots,
//! failing launches, drains that hang or fail, and external reclamation.
//! Every call is counted per node so tests can assert idempotence.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use nodefleet_core::Clock;
use tokio::sync::Mutex;
use tracing::debug;

use crate::api::{BoxFuture, ComputeApi, ControlPlane, CreateNodeRequest, DrainStatus};
use crate::error::LifecycleError;
use crate::node::{CapacityType, InstanceStatus, Node};

/// How simulated drains behave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DrainBehavior {
    #[default]
    Complete,
    /// Returns `TimedOut` right away.
    ReportTimeout,
    /// Never returns.
    Hang,
    Fail,
}

struct SimNode {
    node: Node,
    /// Describe calls left before a pending node turns ready.
    polls_until_ready: u32,
}

#[derive(Default)]
struct SimState {
    nodes: BTreeMap<String, SimNode>,
    next_id: u64,
    boot_polls: u32,
    failing_creates: u32,
    drain: DrainBehavior,
    creates: u32,
    calls: HashMap<(&'static str, String), u32>,
}

impl SimState {
    fn count(&mut self, op: &'static str, node_id: &str) {
        *self.calls.entry((op, node_id.to_string())).or_default() += 1;
    }

    fn node_mut(&mut self, node_id: &str) -> Result<&mut SimNode, LifecycleError> {
        self.nodes
            .get_mut(node_id)
            .ok_or_else(|| LifecycleError::NotFound(node_id.to_string()))
    }

    fn allocate_id(&mut self) -> String {
        self.next_id += 1;
        format!("sim-{:04}", self.next_id)
    }
}

pub struct SimulatedCluster {
    state: Mutex<SimState>,
    clock: Arc<dyn Clock>,
}

impl SimulatedCluster {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(SimState::default()),
            clock,
        }
    }

    // ── Scripting ──────────────────────────────────────────────────

    /// Add `count` ready on-demand nodes spread across `zones`.
    pub async fn seed_ready(&self, cluster_id: &str, zones: &[String], count: u32) -> Vec<String> {
        let mut state = self.state.lock().await;
        let mut ids = Vec::with_capacity(count as usize);
        for i in 0..count as usize {
            let node_id = state.allocate_id();
            let zone = zones.get(i % zones.len().max(1)).cloned().unwrap_or_default();
            let node = Node {
                node_id: node_id.clone(),
                cluster_id: cluster_id.to_string(),
                launch_time: self.clock.now(),
                availability_zone: zone,
                capacity_type: CapacityType::OnDemand,
                instance: InstanceStatus::Running,
                schedulable: true,
                cordoned: false,
                workload_count: 0,
                critical_workloads: 0,
                interruption_notice: false,
            };
            state.nodes.insert(
                node_id.clone(),
                SimNode {
                    node,
                    polls_until_ready: 0,
                },
            );
            ids.push(node_id);
        }
        ids
    }

    /// Describe calls a new node needs before it reports schedulable.
    /// `u32::MAX` means it never does.
    pub async fn set_boot_polls(&self, polls: u32) {
        self.state.lock().await.boot_polls = polls;
    }

    /// Fail the next `count` create calls.
    pub async fn fail_creates(&self, count: u32) {
        self.state.lock().await.failing_creates = count;
    }

    pub async fn set_drain_behavior(&self, behavior: DrainBehavior) {
        self.state.lock().await.drain = behavior;
    }

    pub async fn set_workload(&self, node_id: &str, workloads: u32, critical: u32) {
        if let Some(sim) = self.state.lock().await.nodes.get_mut(node_id) {
            sim.node.workload_count = workloads;
            sim.node.critical_workloads = critical;
        }
    }

    /// Terminate a node behind the controller's back.
    pub async fn reclaim(&self, node_id: &str) {
        if let Some(sim) = self.state.lock().await.nodes.get_mut(node_id) {
            sim.node.instance = InstanceStatus::Terminated;
            sim.node.schedulable = false;
        }
    }

    // ── Inspection ─────────────────────────────────────────────────

    pub async fn nodes(&self) -> Vec<Node> {
        let state = self.state.lock().await;
        state.nodes.values().map(|s| s.node.clone()).collect()
    }

    pub async fn node(&self, node_id: &str) -> Option<Node> {
        let state = self.state.lock().await;
        state.nodes.get(node_id).map(|s| s.node.clone())
    }

    pub async fn ready_count(&self) -> u32 {
        crate::node::ready_count(&self.nodes().await)
    }

    /// How many times `op` (`cordon`, `drain`, `terminate`, `describe`)
    /// was called for `node_id`.
    pub async fn calls(&self, op: &str, node_id: &str) -> u32 {
        let state = self.state.lock().await;
        state
            .calls
            .iter()
            .filter(|((o, n), _)| *o == op && n == node_id)
            .map(|(_, c)| *c)
            .sum()
    }

    pub async fn terminate_calls(&self, node_id: &str) -> u32 {
        self.calls("terminate", node_id).await
    }

    pub async fn create_calls(&self) -> u32 {
        self.state.lock().await.creates
    }
}

impl ComputeApi for SimulatedCluster {
    fn list_nodes<'a>(&'a self, cluster_id: &'a str) -> BoxFuture<'a, Vec<Node>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            Ok(state
                .nodes
                .values()
                .filter(|s| s.node.cluster_id == cluster_id)
                .map(|s| s.node.clone())
                .collect())
        })
    }

    fn create_node<'a>(&'a self, request: &'a CreateNodeRequest) -> BoxFuture<'a, String> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            state.creates += 1;
            if state.failing_creates > 0 {
                state.failing_creates -= 1;
                return Err(LifecycleError::api(
                    "create_node",
                    &request.availability_zone,
                    "insufficient capacity",
                ));
            }
            let node_id = state.allocate_id();
            let polls = state.boot_polls;
            let node = Node {
                node_id: node_id.clone(),
                cluster_id: request.cluster_id.clone(),
                launch_time: self.clock.now(),
                availability_zone: request.availability_zone.clone(),
                capacity_type: request.capacity_type,
                instance: InstanceStatus::Pending,
                schedulable: false,
                cordoned: false,
                workload_count: 0,
                critical_workloads: 0,
                interruption_notice: false,
            };
            state.nodes.insert(
                node_id.clone(),
                SimNode {
                    node,
                    polls_until_ready: polls,
                },
            );
            debug!(%node_id, zone = %request.availability_zone, "simulated launch");
            Ok(node_id)
        })
    }

    fn describe_node<'a>(&'a self, node_id: &'a str) -> BoxFuture<'a, Option<Node>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            state.count("describe", node_id);
            let Some(sim) = state.nodes.get_mut(node_id) else {
                return Ok(None);
            };
            if sim.node.instance == InstanceStatus::Pending {
                if sim.polls_until_ready == 0 {
                    sim.node.instance = InstanceStatus::Running;
                    sim.node.schedulable = !sim.node.cordoned;
                } else if sim.polls_until_ready != u32::MAX {
                    sim.polls_until_ready -= 1;
                }
            }
            Ok(Some(sim.node.clone()))
        })
    }

    fn terminate_node<'a>(&'a self, node_id: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            state.count("terminate", node_id);
            let sim = state.node_mut(node_id)?;
            sim.node.instance = InstanceStatus::Terminated;
            sim.node.schedulable = false;
            Ok(())
        })
    }
}

impl ControlPlane for SimulatedCluster {
    fn cordon<'a>(&'a self, node_id: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            state.count("cordon", node_id);
            let sim = state.node_mut(node_id)?;
            sim.node.cordoned = true;
            sim.node.schedulable = false;
            Ok(())
        })
    }

    fn drain<'a>(&'a self, node_id: &'a str, _grace: Duration) -> BoxFuture<'a, DrainStatus> {
        Box::pin(async move {
            let behavior = {
                let mut state = self.state.lock().await;
                state.count("drain", node_id);
                let behavior = state.drain;
                let sim = state.node_mut(node_id)?;
                if behavior == DrainBehavior::Complete {
                    sim.node.workload_count = 0;
                }
                behavior
            };
            match behavior {
                DrainBehavior::Complete => Ok(DrainStatus::Completed),
                DrainBehavior::ReportTimeout => Ok(DrainStatus::TimedOut),
                DrainBehavior::Fail => Err(LifecycleError::api("drain", node_id, "eviction refused")),
                DrainBehavior::Hang => std::future::pending().await,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodefleet_core::ManualClock;

    fn sim() -> SimulatedCluster {
        SimulatedCluster::new(Arc::new(ManualClock::new(1_000)))
    }

    fn request() -> CreateNodeRequest {
        CreateNodeRequest {
            cluster_id: "c".to_string(),
            availability_zone: "a".to_string(),
            template: "t".to_string(),
            capacity_type: CapacityType::OnDemand,
        }
    }

    #[tokio::test]
    async fn new_node_boots_after_polls() {
        let sim = sim();
        sim.set_boot_polls(1).await;
        let id = sim.create_node(&request()).await.unwrap();

        let first = sim.describe_node(&id).await.unwrap().unwrap();
        assert!(!first.is_ready());
        let second = sim.describe_node(&id).await.unwrap().unwrap();
        assert!(second.is_ready());
        assert_eq!(second.launch_time, 1_000);
    }

    #[tokio::test]
    async fn scripted_create_failures() {
        let sim = sim();
        sim.fail_creates(1).await;
        assert!(sim.create_node(&request()).await.is_err());
        assert!(sim.create_node(&request()).await.is_ok());
        assert_eq!(sim.create_calls().await, 2);
    }

    #[tokio::test]
    async fn cordon_drain_terminate_are_counted() {
        let sim = sim();
        let ids = sim.seed_ready("c", &["a".to_string()], 1).await;
        let id = &ids[0];
        sim.cordon(id).await.unwrap();
        assert_eq!(
            sim.drain(id, Duration::from_secs(1)).await.unwrap(),
            DrainStatus::Completed
        );
        sim.terminate_node(id).await.unwrap();
        sim.terminate_node(id).await.unwrap();

        assert_eq!(sim.calls("cordon", id).await, 1);
        assert_eq!(sim.terminate_calls(id).await, 2);
        assert!(!sim.node(id).await.unwrap().is_live());
    }

    #[tokio::test]
    async fn hanging_drain_never_returns() {
        let sim = sim();
        let ids = sim.seed_ready("c", &["a".to_string()], 1).await;
        sim.set_drain_behavior(DrainBehavior::Hang).await;
        let result = tokio::time::timeout(
            Duration::from_millis(50),
            sim.drain(&ids[0], Duration::from_secs(1)),
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn list_is_scoped_to_cluster() {
        let sim = sim();
        sim.seed_ready("c1", &["a".to_string()], 2).await;
        sim.seed_ready("c2", &["a".to_string()], 1).await;
        assert_eq!(sim.list_nodes("c1").await.unwrap().len(), 2);
        assert_eq!(sim.describe_node("missing").await.unwrap(), None);
    }
}
