//! Domain types persisted in the coordination store.
//!
//! These types are JSON-serialized into redb tables. `ClusterState` is the
//! durable record of fleet truth, `LockRecord` gates every mutation of it,
//! and `MetricSnapshot` is the immutable per-tick load sample.

use serde::{Deserialize, Serialize};

/// Unique identifier for a managed cluster.
pub type ClusterId = String;

// ── Cluster state ─────────────────────────────────────────────────

/// Direction of the most recent completed scaling action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ScaleDirection {
    Up,
    Down,
    #[default]
    None,
}

/// Durable record of fleet truth for one cluster.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClusterState {
    pub cluster_id: ClusterId,
    pub node_count: u32,
    pub scaling_in_progress: bool,
    /// Unix timestamp (seconds) of the last completed scaling action.
    pub last_scale_time: u64,
    pub last_scale_direction: ScaleDirection,
    /// Bumped by every successful conditional write.
    pub version: u64,
}

impl ClusterState {
    /// State assumed for a cluster that has never been written.
    pub fn initial(cluster_id: &str, node_count: u32) -> Self {
        Self {
            cluster_id: cluster_id.to_string(),
            node_count,
            scaling_in_progress: false,
            last_scale_time: 0,
            last_scale_direction: ScaleDirection::None,
            version: 0,
        }
    }

    /// Seconds since the last scaling action, saturating at zero for
    /// timestamps in the future.
    pub fn secs_since_last_scale(&self, now: u64) -> u64 {
        now.saturating_sub(self.last_scale_time)
    }
}

// ── Lock ──────────────────────────────────────────────────────────

/// The mutual-exclusion record for one cluster.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockRecord {
    pub cluster_id: ClusterId,
    pub holder_id: String,
    pub acquired_at: u64,
    pub expires_at: u64,
}

impl LockRecord {
    /// A record is live until its expiry instant (exclusive).
    pub fn is_live(&self, now: u64) -> bool {
        now < self.expires_at
    }
}

// ── Metrics ───────────────────────────────────────────────────────

/// Point-in-time cluster load sample. Never mutated after construction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricSnapshot {
    pub cluster_id: ClusterId,
    /// Unix timestamp (seconds) when the sample was taken.
    pub timestamp: u64,
    /// Average CPU utilization across workers (0–100).
    pub avg_cpu_utilization: f64,
    /// Average memory utilization across workers (0–100), if reported.
    #[serde(default)]
    pub avg_memory_utilization: Option<f64>,
    /// Workloads that could not be scheduled anywhere.
    pub pending_workload_count: u64,
    #[serde(default)]
    pub queue_depth: Option<u64>,
    /// Out-of-band notice that capacity is about to be reclaimed.
    #[serde(default)]
    pub external_interruption_signal: bool,
}

impl MetricSnapshot {
    /// Build a snapshot, clamping utilization into 0–100. Non-finite
    /// readings are treated as zero.
    pub fn new(cluster_id: &str, timestamp: u64, avg_cpu_utilization: f64, pending: u64) -> Self {
        Self {
            cluster_id: cluster_id.to_string(),
            timestamp,
            avg_cpu_utilization: clamp_percent(avg_cpu_utilization),
            avg_memory_utilization: None,
            pending_workload_count: pending,
            queue_depth: None,
            external_interruption_signal: false,
        }
    }

    pub fn with_memory(mut self, percent: f64) -> Self {
        self.avg_memory_utilization = Some(clamp_percent(percent));
        self
    }

    pub fn with_queue_depth(mut self, depth: u64) -> Self {
        self.queue_depth = Some(depth);
        self
    }

    pub fn with_interruption(mut self, signal: bool) -> Self {
        self.external_interruption_signal = signal;
        self
    }

    /// Build the composite key for the snapshots table.
    pub fn table_key(&self) -> String {
        snapshot_key(&self.cluster_id, self.timestamp)
    }
}

/// Snapshot key with a zero-padded timestamp so lexical order is time order.
pub fn snapshot_key(cluster_id: &str, timestamp: u64) -> String {
    format!("{cluster_id}:{timestamp:020}")
}

fn clamp_percent(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 100.0)
    } else {
        0.0
    }
}
