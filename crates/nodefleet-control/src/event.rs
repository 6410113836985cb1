//! Cycle events: what each tick did, for whoever is listening.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use nodefleet_decide::Decision;
use nodefleet_lifecycle::DrainResult;
use serde::{Deserialize, Serialize};

use crate::cycle::{CycleReport, Execution};
use crate::error::CycleError;

pub type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Callback invoked once per cycle, after the lock is released.
pub type EventCallback = Arc<dyn Fn(CycleEvent) -> BoxFuture + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleOutcome {
    /// Another invocation held the lock.
    Skipped,
    NoAction,
    ScaledUp,
    ScaledDown,
    /// An interrupted cycle was reconciled.
    Recovered,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleEvent {
    pub cluster_id: String,
    pub timestamp: u64,
    pub holder_id: String,
    /// `no_op` when the cycle ended before deciding anything.
    pub decision: Decision,
    pub reason: String,
    pub outcome: CycleOutcome,
    /// Recorded node count after the cycle, when state was read.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub added: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub removed: Vec<String>,
    /// Removed nodes whose drain did not finish within the grace period.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub forced_drains: Vec<String>,
}

impl CycleEvent {
    pub fn from_report(report: &CycleReport) -> Self {
        let mut event = Self {
            cluster_id: report.cluster_id.clone(),
            timestamp: report.timestamp,
            holder_id: report.holder_id.clone(),
            decision: report.decision,
            reason: report.reason.clone(),
            outcome: report.outcome(),
            node_count: Some(report.state.node_count),
            added: Vec::new(),
            removed: Vec::new(),
            forced_drains: Vec::new(),
        };
        let retired = match &report.execution {
            Execution::None => &[][..],
            Execution::ScaleUp(up) => {
                event.added = up.launched.clone();
                &[][..]
            }
            Execution::ScaleDown(down) => &down.removed[..],
            Execution::Recovery(recovery) => {
                event.removed.extend(recovery.abandoned.iter().cloned());
                &recovery.resumed[..]
            }
        };
        for node in retired {
            event.removed.push(node.node_id.clone());
            if node.drain == DrainResult::Forced {
                event.forced_drains.push(node.node_id.clone());
            }
        }
        event
    }

    pub fn from_error(
        cluster_id: &str,
        timestamp: u64,
        holder_id: &str,
        decision: Option<Decision>,
        error: &CycleError,
    ) -> Self {
        let outcome = match error {
            CycleError::LockContention { .. } => CycleOutcome::Skipped,
            CycleError::MetricsUnavailable(_) => CycleOutcome::NoAction,
            _ => CycleOutcome::Failed,
        };
        Self {
            cluster_id: cluster_id.to_string(),
            timestamp,
            holder_id: holder_id.to_string(),
            decision: decision.unwrap_or(Decision::NoOp),
            reason: error.to_string(),
            outcome,
            node_count: None,
            added: Vec::new(),
            removed: Vec::new(),
            forced_drains: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodefleet_lifecycle::{RetiredNode, ScaleDownOutcome};
    use nodefleet_state::ClusterState;

    fn report(execution: Execution, decision: Decision) -> CycleReport {
        CycleReport {
            cluster_id: "c".to_string(),
            holder_id: "h#1".to_string(),
            timestamp: 100,
            decision,
            reason: "cpu below 30% for 300s".to_string(),
            execution,
            state: ClusterState::initial("c", 3),
        }
    }

    #[test]
    fn forced_drains_are_tagged() {
        let down = ScaleDownOutcome {
            removed: vec![
                RetiredNode {
                    node_id: "n1".to_string(),
                    drain: DrainResult::Clean,
                },
                RetiredNode {
                    node_id: "n2".to_string(),
                    drain: DrainResult::Forced,
                },
            ],
            observed_nodes: 3,
        };
        let event = CycleEvent::from_report(&report(Execution::ScaleDown(down), Decision::ScaleDown));
        assert_eq!(event.outcome, CycleOutcome::ScaledDown);
        assert_eq!(event.removed, vec!["n1", "n2"]);
        assert_eq!(event.forced_drains, vec!["n2"]);
        assert_eq!(event.node_count, Some(3));
    }

    #[test]
    fn contention_is_skipped() {
        let err = CycleError::LockContention {
            cluster_id: "c".to_string(),
            holder_id: "other".to_string(),
            expires_at: 900,
        };
        let event = CycleEvent::from_error("c", 100, "h#2", None, &err);
        assert_eq!(event.outcome, CycleOutcome::Skipped);
        assert_eq!(event.decision, Decision::NoOp);
    }

    #[test]
    fn serializes_compactly() {
        let event = CycleEvent::from_report(&report(Execution::None, Decision::NoOp));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["outcome"], "no_action");
        assert_eq!(json["decision"]["action"], "no_op");
        assert!(json.get("removed").is_none());
    }
}
