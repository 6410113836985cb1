//! Scale-down candidate ranking.

use std::cmp::Ordering;

use crate::node::{CapacityType, Node, NodeState};

/// Ready nodes eligible for removal, best candidate first.
///
/// Nodes hosting any critical workload are never candidates. The rest are
/// ordered by workload count, then spot before on-demand, then node id, so
/// the same fleet always yields the same order.
pub fn removal_candidates(nodes: &[Node]) -> Vec<&Node> {
    let mut candidates: Vec<&Node> = nodes
        .iter()
        .filter(|n| n.state() == NodeState::Ready && n.critical_workloads == 0)
        .collect();
    candidates.sort_by(|a, b| rank(a, b));
    candidates
}

fn rank(a: &Node, b: &Node) -> Ordering {
    a.workload_count
        .cmp(&b.workload_count)
        .then_with(|| spot_first(a.capacity_type).cmp(&spot_first(b.capacity_type)))
        .then_with(|| a.node_id.cmp(&b.node_id))
}

fn spot_first(capacity: CapacityType) -> u8 {
    match capacity {
        CapacityType::Spot => 0,
        CapacityType::OnDemand => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::InstanceStatus;

    fn node(id: &str, workloads: u32, capacity_type: CapacityType) -> Node {
        Node {
            node_id: id.to_string(),
            cluster_id: "c".to_string(),
            launch_time: 0,
            availability_zone: "a".to_string(),
            capacity_type,
            instance: InstanceStatus::Running,
            schedulable: true,
            cordoned: false,
            workload_count: workloads,
            critical_workloads: 0,
            interruption_notice: false,
        }
    }

    fn ids(nodes: Vec<&Node>) -> Vec<&str> {
        nodes.into_iter().map(|n| n.node_id.as_str()).collect()
    }

    #[test]
    fn lowest_workload_first() {
        let nodes = vec![
            node("a", 5, CapacityType::OnDemand),
            node("b", 1, CapacityType::OnDemand),
            node("c", 3, CapacityType::OnDemand),
        ];
        assert_eq!(ids(removal_candidates(&nodes)), vec!["b", "c", "a"]);
    }

    #[test]
    fn ties_prefer_spot_then_id() {
        let nodes = vec![
            node("z", 2, CapacityType::OnDemand),
            node("y", 2, CapacityType::Spot),
            node("x", 2, CapacityType::OnDemand),
        ];
        assert_eq!(ids(removal_candidates(&nodes)), vec!["y", "x", "z"]);
    }

    #[test]
    fn critical_and_not_ready_are_excluded() {
        let mut critical = node("crit", 0, CapacityType::Spot);
        critical.critical_workloads = 1;
        let mut joining = node("join", 0, CapacityType::Spot);
        joining.schedulable = false;
        let mut draining = node("drain", 0, CapacityType::Spot);
        draining.cordoned = true;
        let nodes = vec![critical, joining, draining, node("ok", 9, CapacityType::OnDemand)];
        assert_eq!(ids(removal_candidates(&nodes)), vec!["ok"]);
    }
}
