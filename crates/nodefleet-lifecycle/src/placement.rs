//! Launch planning: which zone and which capacity type each new node gets.
//!
//! Zones are filled least-populated first, so consecutive launches rotate
//! across zones instead of piling into one. Capacity type keeps the fleet
//! near the configured spot share, leaning spot when rounding leaves slack.

use std::collections::HashMap;

use nodefleet_core::CapacityConfig;
use tracing::debug;

use crate::api::CreateNodeRequest;
use crate::node::{CapacityType, Node};

/// How many of each capacity type to launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CapacityMix {
    pub spot: u32,
    pub on_demand: u32,
}

/// Split `to_add` new nodes so the fleet approaches `spot_ratio`.
pub fn capacity_mix(existing: &[Node], to_add: u32, spot_ratio: f64) -> CapacityMix {
    if to_add == 0 {
        return CapacityMix::default();
    }
    if spot_ratio <= 0.0 {
        return CapacityMix {
            spot: 0,
            on_demand: to_add,
        };
    }

    let existing_spot = existing
        .iter()
        .filter(|n| n.capacity_type == CapacityType::Spot)
        .count() as u32;
    let existing_on_demand = existing.len() as u32 - existing_spot;
    let desired = existing.len() as u32 + to_add;

    let ideal_spot = (f64::from(desired) * spot_ratio.min(1.0) + 1e-9).floor() as u32;
    let ideal_on_demand = desired - ideal_spot;
    let mut spot = ideal_spot.saturating_sub(existing_spot);
    let mut on_demand = ideal_on_demand.saturating_sub(existing_on_demand);

    if spot + on_demand > to_add {
        spot = spot.min(to_add);
        on_demand = to_add - spot;
    } else {
        spot += to_add - (spot + on_demand);
    }
    CapacityMix { spot, on_demand }
}

/// Plan `count` launches across `zones` for the given live nodes.
pub fn plan_launches(
    cluster_id: &str,
    live: &[Node],
    zones: &[String],
    count: u32,
    capacity: &CapacityConfig,
    spot_ratio: f64,
) -> Vec<CreateNodeRequest> {
    if zones.is_empty() || count == 0 {
        return Vec::new();
    }

    let mut per_zone: HashMap<&str, u32> = zones.iter().map(|z| (z.as_str(), 0)).collect();
    for node in live {
        if let Some(n) = per_zone.get_mut(node.availability_zone.as_str()) {
            *n += 1;
        }
    }

    let mix = capacity_mix(live, count, spot_ratio);
    let spot_template = capacity.spot_template.as_deref();
    let mut requests = Vec::with_capacity(count as usize);
    for i in 0..count {
        // Ties go to the earliest zone in configuration order.
        let zone = zones
            .iter()
            .min_by_key(|z| per_zone.get(z.as_str()).copied().unwrap_or(0))
            .map(String::as_str)
            .unwrap_or_default();
        if let Some(n) = per_zone.get_mut(zone) {
            *n += 1;
        }

        let (capacity_type, template) = match spot_template {
            Some(t) if i < mix.spot => (CapacityType::Spot, t),
            _ => (CapacityType::OnDemand, capacity.on_demand_template.as_str()),
        };
        requests.push(CreateNodeRequest {
            cluster_id: cluster_id.to_string(),
            availability_zone: zone.to_string(),
            template: template.to_string(),
            capacity_type,
        });
    }

    debug!(
        %cluster_id,
        count,
        spot = mix.spot,
        on_demand = mix.on_demand,
        "planned launches"
    );
    requests
}
