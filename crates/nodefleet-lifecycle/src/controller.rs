//! LifecycleController: scale-up, scale-down and crash recovery.
//!
//! Every operation re-lists the cluster first and acts on the difference
//! between recorded intent and observed reality, so a run interrupted at
//! any point can simply be run again:
//!
//! - joining nodes left by a crashed scale-up are adopted, not duplicated
//! - cordoned nodes left by a crashed scale-down are finished first
//! - a node already observed as terminated is never terminated again

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use nodefleet_core::{CapacityConfig, ClusterConfig, FleetConfig, LifecycleConfig};
use serde::{Deserialize, Serialize};
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, info, warn};

use crate::api::{ComputeApi, ControlPlane, CreateNodeRequest, DrainStatus, MutationGuard};
use crate::error::{LifecycleError, LifecycleResult};
use crate::node::{Node, NodeState, ready_count};
use crate::placement::plan_launches;
use crate::selection::removal_candidates;

/// How a node's workloads left it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrainResult {
    Clean,
    /// The grace period ran out (or the drain failed) and the node was
    /// terminated with workloads still on it.
    Forced,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetiredNode {
    pub node_id: String,
    pub drain: DrainResult,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScaleUpOutcome {
    /// Nodes that reached ready, including adopted ones.
    pub launched: Vec<String>,
    /// Nodes that were created but never became ready (now terminated).
    pub failed: Vec<String>,
    /// Create requests that failed on every attempt.
    pub failed_creates: u32,
    /// Ready nodes observed after the operation.
    pub observed_nodes: u32,
}

impl ScaleUpOutcome {
    /// Nothing was added although something was attempted.
    pub fn is_total_failure(&self) -> bool {
        self.launched.is_empty() && (self.failed_creates > 0 || !self.failed.is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScaleDownOutcome {
    pub removed: Vec<RetiredNode>,
    pub observed_nodes: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileOutcome {
    /// Interrupted scale-downs that were finished.
    pub resumed: Vec<RetiredNode>,
    /// Joining nodes past their ready deadline that were terminated.
    pub abandoned: Vec<String>,
    pub observed_nodes: u32,
}

pub struct LifecycleController {
    compute: Arc<dyn ComputeApi>,
    control: Arc<dyn ControlPlane>,
    cluster: ClusterConfig,
    lifecycle: LifecycleConfig,
    capacity: CapacityConfig,
    spot_ratio: f64,
}

impl LifecycleController {
    pub fn new(
        compute: Arc<dyn ComputeApi>,
        control: Arc<dyn ControlPlane>,
        config: &FleetConfig,
    ) -> Self {
        Self {
            compute,
            control,
            cluster: config.cluster.clone(),
            lifecycle: config.lifecycle.clone(),
            capacity: config.capacity.clone(),
            spot_ratio: config.spot_ratio(),
        }
    }

    // ── Observation ────────────────────────────────────────────────

    /// Non-terminated nodes of the cluster as the provider sees them now.
    pub async fn live_nodes(&self, cluster_id: &str) -> LifecycleResult<Vec<Node>> {
        let nodes = self
            .bounded("list_nodes", cluster_id, self.compute.list_nodes(cluster_id))
            .await?;
        Ok(nodes.into_iter().filter(Node::is_live).collect())
    }

    pub async fn observed_ready(&self, cluster_id: &str) -> LifecycleResult<u32> {
        Ok(ready_count(&self.live_nodes(cluster_id).await?))
    }

    // ── Scale up ───────────────────────────────────────────────────

    /// Bring the cluster to `recorded + count` nodes (capped at
    /// `max_nodes`), counting nodes that are already joining.
    pub async fn scale_up(
        &self,
        cluster_id: &str,
        recorded: u32,
        count: u32,
        guard: &dyn MutationGuard,
    ) -> LifecycleResult<ScaleUpOutcome> {
        let live = self.live_nodes(cluster_id).await?;
        let target = recorded.saturating_add(count).min(self.cluster.max_nodes);
        let adopted: Vec<String> = live
            .iter()
            .filter(|n| n.state() == NodeState::Joining)
            .map(|n| n.node_id.clone())
            .collect();
        let serving = ready_count(&live) + adopted.len() as u32;
        let to_create = target.saturating_sub(serving);

        info!(
            %cluster_id,
            recorded,
            target,
            ready = serving - adopted.len() as u32,
            adopted = adopted.len(),
            to_create,
            "scaling up"
        );

        let mut outcome = ScaleUpOutcome::default();
        let mut pending = adopted;
        let plan = plan_launches(
            cluster_id,
            &live,
            &self.cluster.zones,
            to_create,
            &self.capacity,
            self.spot_ratio,
        );
        for request in &plan {
            if !guard.may_mutate() {
                return Err(LifecycleError::LeaseLost(cluster_id.to_string()));
            }
            match self.create_with_retries(request).await {
                Some(node_id) => pending.push(node_id),
                None => outcome.failed_creates += 1,
            }
        }

        let (ready, stuck) = self.wait_ready(pending).await;
        outcome.launched = ready;
        for node_id in stuck {
            // A node that never joined must not count as capacity.
            if let Err(e) = self.terminate(&node_id).await {
                warn!(%node_id, error = %e, "failed to terminate node that never became ready");
            }
            outcome.failed.push(node_id);
        }

        outcome.observed_nodes = self.observed_ready(cluster_id).await?;
        info!(
            %cluster_id,
            launched = outcome.launched.len(),
            failed = outcome.failed.len(),
            failed_creates = outcome.failed_creates,
            observed = outcome.observed_nodes,
            "scale-up finished"
        );
        Ok(outcome)
    }

    async fn create_with_retries(&self, request: &CreateNodeRequest) -> Option<String> {
        let attempts = self.lifecycle.provision_retries + 1;
        for attempt in 1..=attempts {
            match self
                .bounded(
                    "create_node",
                    &request.availability_zone,
                    self.compute.create_node(request),
                )
                .await
            {
                Ok(node_id) => {
                    debug!(
                        %node_id,
                        zone = %request.availability_zone,
                        capacity = ?request.capacity_type,
                        "node requested"
                    );
                    return Some(node_id);
                }
                Err(e) => warn!(
                    zone = %request.availability_zone,
                    attempt,
                    attempts,
                    error = %e,
                    "create failed"
                ),
            }
        }
        None
    }

    /// Poll until every node is ready or `ready_timeout` elapses. Returns
    /// (ready, not ready).
    async fn wait_ready(&self, mut pending: Vec<String>) -> (Vec<String>, Vec<String>) {
        let deadline = Instant::now() + self.lifecycle.ready_timeout.as_duration();
        let mut ready = Vec::new();
        let mut gone = Vec::new();

        while !pending.is_empty() {
            let mut still = Vec::with_capacity(pending.len());
            for node_id in pending {
                match self
                    .bounded("describe_node", &node_id, self.compute.describe_node(&node_id))
                    .await
                {
                    Ok(Some(node)) if node.is_ready() => {
                        debug!(%node_id, "node ready");
                        ready.push(node_id);
                    }
                    Ok(Some(node)) if node.state() == NodeState::Terminated => {
                        warn!(%node_id, "node terminated while joining");
                        gone.push(node_id);
                    }
                    Ok(None) => {
                        warn!(%node_id, "node disappeared while joining");
                        gone.push(node_id);
                    }
                    Ok(Some(_)) => still.push(node_id),
                    Err(e) => {
                        debug!(%node_id, error = %e, "describe failed; will retry");
                        still.push(node_id);
                    }
                }
            }
            pending = still;
            if pending.is_empty() || Instant::now() >= deadline {
                break;
            }
            sleep(self.lifecycle.poll_interval.as_duration()).await;
        }

        if !pending.is_empty() {
            warn!(
                nodes = ?pending,
                timeout = %self.lifecycle.ready_timeout,
                "nodes not ready in time"
            );
        }
        gone.extend(pending);
        (ready, gone)
    }

    // ── Scale down ─────────────────────────────────────────────────

    /// Remove up to `count` nodes without going below `min_nodes`.
    ///
    /// Nodes already cordoned by an interrupted run count toward `count`
    /// and are finished before any new node is touched.
    pub async fn scale_down(
        &self,
        cluster_id: &str,
        count: u32,
        guard: &dyn MutationGuard,
    ) -> LifecycleResult<ScaleDownOutcome> {
        let live = self.live_nodes(cluster_id).await?;
        let resumed: Vec<&Node> = live
            .iter()
            .filter(|n| n.state() == NodeState::Draining)
            .collect();
        let ready = ready_count(&live);
        let headroom = ready.saturating_sub(self.cluster.min_nodes);
        let fresh = count
            .saturating_sub(resumed.len() as u32)
            .min(headroom) as usize;

        let resuming = resumed.len();
        let mut targets: Vec<&Node> = resumed;
        targets.extend(removal_candidates(&live).into_iter().take(fresh));

        info!(
            %cluster_id,
            count,
            ready,
            resuming,
            fresh = targets.len() - resuming,
            "scaling down"
        );
        if targets.is_empty() {
            debug!(%cluster_id, "no removable nodes");
        }

        let mut outcome = ScaleDownOutcome::default();
        for node in targets {
            let drain = self.retire(node, guard).await?;
            outcome.removed.push(RetiredNode {
                node_id: node.node_id.clone(),
                drain,
            });
        }
        outcome.observed_nodes = self.observed_ready(cluster_id).await?;
        Ok(outcome)
    }

    /// cordon → drain (bounded by the grace period) → terminate → confirm.
    async fn retire(&self, node: &Node, guard: &dyn MutationGuard) -> LifecycleResult<DrainResult> {
        let node_id = node.node_id.as_str();
        if !guard.may_mutate() {
            return Err(LifecycleError::LeaseLost(node_id.to_string()));
        }

        if !node.cordoned {
            self.bounded("cordon", node_id, self.control.cordon(node_id))
                .await?;
            debug!(%node_id, "cordoned");
        }

        let grace = self.lifecycle.drain_grace.as_duration();
        let drain = match timeout(grace, self.control.drain(node_id, grace)).await {
            Ok(Ok(DrainStatus::Completed)) => DrainResult::Clean,
            Ok(Ok(DrainStatus::TimedOut)) => {
                warn!(%node_id, grace = %self.lifecycle.drain_grace, "drain timed out; forcing");
                DrainResult::Forced
            }
            Ok(Err(e)) => {
                warn!(%node_id, error = %e, "drain failed; forcing");
                DrainResult::Forced
            }
            Err(_) => {
                warn!(%node_id, grace = %self.lifecycle.drain_grace, "drain exceeded grace; forcing");
                DrainResult::Forced
            }
        };

        if !guard.may_mutate() {
            return Err(LifecycleError::LeaseLost(node_id.to_string()));
        }
        self.terminate(node_id).await?;
        self.confirm_terminated(node_id).await?;
        info!(%node_id, ?drain, "node retired");
        Ok(drain)
    }

    async fn terminate(&self, node_id: &str) -> LifecycleResult<()> {
        self.bounded("terminate_node", node_id, self.compute.terminate_node(node_id))
            .await
    }

    async fn confirm_terminated(&self, node_id: &str) -> LifecycleResult<()> {
        let limit = self.lifecycle.terminate_timeout.as_duration();
        let deadline = Instant::now() + limit;
        loop {
            let observed = self
                .bounded("describe_node", node_id, self.compute.describe_node(node_id))
                .await?;
            match observed {
                None => return Ok(()),
                Some(node) if node.state() == NodeState::Terminated => return Ok(()),
                Some(_) => {}
            }
            if Instant::now() >= deadline {
                return Err(LifecycleError::TerminationUnconfirmed {
                    node_id: node_id.to_string(),
                    after: limit,
                });
            }
            sleep(self.lifecycle.poll_interval.as_duration()).await;
        }
    }

    // ── Recovery ───────────────────────────────────────────────────

    /// Finish whatever an interrupted run left behind and report the live
    /// ready count.
    pub async fn reconcile(
        &self,
        cluster_id: &str,
        now: u64,
        guard: &dyn MutationGuard,
    ) -> LifecycleResult<ReconcileOutcome> {
        let live = self.live_nodes(cluster_id).await?;
        let ready_secs = self.lifecycle.ready_timeout.as_secs();
        let mut outcome = ReconcileOutcome::default();
        let mut touched = HashSet::new();

        for node in live.iter().filter(|n| n.state() == NodeState::Draining) {
            let drain = self.retire(node, guard).await?;
            touched.insert(node.node_id.as_str());
            outcome.resumed.push(RetiredNode {
                node_id: node.node_id.clone(),
                drain,
            });
        }

        for node in live.iter().filter(|n| n.state() == NodeState::Joining) {
            if touched.contains(node.node_id.as_str()) {
                continue;
            }
            if now.saturating_sub(node.launch_time) < ready_secs {
                continue;
            }
            if !guard.may_mutate() {
                return Err(LifecycleError::LeaseLost(node.node_id.clone()));
            }
            warn!(node_id = %node.node_id, "abandoning node stuck joining");
            self.terminate(&node.node_id).await?;
            outcome.abandoned.push(node.node_id.clone());
        }

        outcome.observed_nodes = self.observed_ready(cluster_id).await?;
        info!(
            %cluster_id,
            resumed = outcome.resumed.len(),
            abandoned = outcome.abandoned.len(),
            observed = outcome.observed_nodes,
            "reconciled"
        );
        Ok(outcome)
    }

    /// Run one external call under `call_timeout`.
    async fn bounded<T>(
        &self,
        operation: &'static str,
        target: &str,
        call: impl Future<Output = LifecycleResult<T>>,
    ) -> LifecycleResult<T> {
        let limit: Duration = self.lifecycle.call_timeout.as_duration();
        match timeout(limit, call).await {
            Ok(result) => result,
            Err(_) => Err(LifecycleError::Timeout {
                operation,
                target: target.to_string(),
                after: limit,
            }),
        }
    }
}
