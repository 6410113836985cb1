//! fleet.toml configuration parser.
//!
//! Every section has defaults matching the autoscaler's production
//! settings, so a minimal file only needs the fields that differ:
//!
//! ```toml
//! [cluster]
//! cluster_id = "prod-workers"
//! min_nodes = 3
//! max_nodes = 12
//! zones = ["eu-west-1a", "eu-west-1b", "eu-west-1c"]
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::duration::HumanDuration;

/// Validation failures for a parsed configuration.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("invalid [{section}] {field}: {reason}")]
    Invalid {
        section: &'static str,
        field: &'static str,
        reason: String,
    },
}

fn invalid(section: &'static str, field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        section,
        field,
        reason: reason.into(),
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    pub cluster: ClusterConfig,
    pub thresholds: ThresholdConfig,
    pub cooldown: CooldownConfig,
    pub lock: LockConfig,
    pub lifecycle: LifecycleConfig,
    pub predictive: PredictiveConfig,
    pub metrics: MetricsConfig,
    pub capacity: CapacityConfig,
}

/// Cluster identity and size bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub cluster_id: String,
    /// Floor: no reachable state may have fewer nodes.
    pub min_nodes: u32,
    pub max_nodes: u32,
    /// Availability zones new nodes are spread across.
    pub zones: Vec<String>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            cluster_id: "node-fleet-cluster".to_string(),
            min_nodes: 2,
            max_nodes: 10,
            zones: vec!["zone-a".to_string(), "zone-b".to_string()],
        }
    }
}

/// Reactive watermarks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdConfig {
    pub cpu_high: f64,
    pub cpu_low: f64,
    pub memory_high: f64,
    pub memory_low: f64,
    /// Queue backlog above which a non-urgent scale-up is requested.
    pub queue_depth_high: Option<u64>,
    /// How long a watermark must hold before it counts.
    pub sustained_for: HumanDuration,
    /// CPU above which a scale-up adds two nodes instead of one.
    pub burst_cpu: f64,
    /// Pending workloads above which a scale-up adds two nodes.
    pub burst_pending: u64,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            cpu_high: 70.0,
            cpu_low: 30.0,
            memory_high: 75.0,
            memory_low: 50.0,
            queue_depth_high: Some(1000),
            sustained_for: HumanDuration::from_secs(300),
            burst_cpu: 80.0,
            burst_pending: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CooldownConfig {
    /// Minimum quiet time after any scaling action.
    pub scale_up: HumanDuration,
    /// Longer quiet time required before removing capacity.
    pub scale_down: HumanDuration,
}

impl Default for CooldownConfig {
    fn default() -> Self {
        Self {
            scale_up: HumanDuration::from_secs(300),
            scale_down: HumanDuration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub ttl: HumanDuration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl: HumanDuration::from_secs(900),
        }
    }
}

/// Timeouts and retry bounds for node operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Upper bound on any single compute or control-plane call.
    pub call_timeout: HumanDuration,
    pub ready_timeout: HumanDuration,
    pub poll_interval: HumanDuration,
    pub drain_grace: HumanDuration,
    pub terminate_timeout: HumanDuration,
    /// Extra create attempts per node after the first failure.
    pub provision_retries: u32,
    /// Base URL of the compute REST gateway. Required by `fleetd run`.
    pub compute_api_url: Option<String>,
    pub kubectl_path: String,
    pub kubeconfig: Option<String>,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            call_timeout: HumanDuration::from_secs(30),
            ready_timeout: HumanDuration::from_secs(300),
            poll_interval: HumanDuration::from_secs(10),
            drain_grace: HumanDuration::from_secs(300),
            terminate_timeout: HumanDuration::from_secs(120),
            provision_retries: 2,
            compute_api_url: None,
            kubectl_path: "kubectl".to_string(),
            kubeconfig: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictiveConfig {
    pub enabled: bool,
    /// Scores above this trigger a preventative scale-up.
    pub score_threshold: f64,
    /// How much history the predictor may look at.
    pub lookback: HumanDuration,
    pub max_preventative_nodes: u32,
}

impl Default for PredictiveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            score_threshold: 0.5,
            lookback: HumanDuration::from_secs(7 * 86_400),
            max_preventative_nodes: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub prometheus_url: Option<String>,
    pub query_timeout: HumanDuration,
    /// Control loop tick interval.
    pub interval: HumanDuration,
    /// Snapshots older than this are pruned from the history table.
    pub retention: HumanDuration,
    pub queue_depth_query: Option<String>,
    pub interruption_query: Option<String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            prometheus_url: None,
            query_timeout: HumanDuration::from_secs(10),
            interval: HumanDuration::from_secs(120),
            retention: HumanDuration::from_secs(30 * 86_400),
            queue_depth_query: None,
            interruption_query: None,
        }
    }
}

/// Launch templates and the spot/on-demand mix.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CapacityConfig {
    pub on_demand_template: String,
    /// Without a spot template every node is launched on-demand.
    pub spot_template: Option<String>,
    pub spot_percentage: u8,
}

impl Default for CapacityConfig {
    fn default() -> Self {
        Self {
            on_demand_template: "worker-on-demand".to_string(),
            spot_template: None,
            spot_percentage: 70,
        }
    }
}

impl FleetConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: FleetConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let c = &self.cluster;
        if c.cluster_id.trim().is_empty() {
            return Err(invalid("cluster", "cluster_id", "must not be empty"));
        }
        if c.max_nodes == 0 {
            return Err(invalid("cluster", "max_nodes", "must be at least 1"));
        }
        if c.min_nodes > c.max_nodes {
            return Err(invalid(
                "cluster",
                "min_nodes",
                format!("{} exceeds max_nodes {}", c.min_nodes, c.max_nodes),
            ));
        }
        if c.zones.is_empty() {
            return Err(invalid("cluster", "zones", "at least one zone is required"));
        }

        let t = &self.thresholds;
        for (field, value) in [
            ("cpu_high", t.cpu_high),
            ("cpu_low", t.cpu_low),
            ("memory_high", t.memory_high),
            ("memory_low", t.memory_low),
            ("burst_cpu", t.burst_cpu),
        ] {
            if !(0.0..=100.0).contains(&value) {
                return Err(invalid("thresholds", field, format!("{value} is outside 0-100")));
            }
        }
        if t.cpu_low >= t.cpu_high {
            return Err(invalid("thresholds", "cpu_low", "must be below cpu_high"));
        }
        if t.memory_low >= t.memory_high {
            return Err(invalid("thresholds", "memory_low", "must be below memory_high"));
        }

        if self.lock.ttl.as_secs() == 0 {
            return Err(invalid("lock", "ttl", "must be positive"));
        }
        let budget = self.worst_case_cycle();
        if self.lock.ttl.as_duration() <= budget {
            return Err(invalid(
                "lock",
                "ttl",
                format!(
                    "{} does not cover the worst-case cycle of {}",
                    self.lock.ttl,
                    HumanDuration::from(budget)
                ),
            ));
        }
        if self.lifecycle.poll_interval.as_duration().is_zero() {
            return Err(invalid("lifecycle", "poll_interval", "must be positive"));
        }
        if !(0.0..=1.0).contains(&self.predictive.score_threshold) {
            return Err(invalid("predictive", "score_threshold", "must be within 0-1"));
        }
        if self.capacity.spot_percentage > 100 {
            return Err(invalid("capacity", "spot_percentage", "must be at most 100"));
        }
        if self.capacity.on_demand_template.trim().is_empty() {
            return Err(invalid("capacity", "on_demand_template", "must not be empty"));
        }
        Ok(())
    }

    /// Longest a single cycle can hold the lock: one metrics query plus
    /// the slower of a full scale-up (every create retried, one readiness
    /// wait) and a one-node removal (cordon, drain, terminate, confirm).
    pub fn worst_case_cycle(&self) -> Duration {
        let l = &self.lifecycle;
        let call = l.call_timeout.as_duration();
        let creates = self.predictive.max_preventative_nodes.max(2) * (l.provision_retries + 1);
        let scale_up = call * (creates + 2) + l.ready_timeout.as_duration();
        let scale_down = call * 3 + l.drain_grace.as_duration() + l.terminate_timeout.as_duration();
        self.metrics.query_timeout.as_duration() + scale_up.max(scale_down)
    }

    /// Effective spot share: zero when no spot template is configured.
    pub fn spot_ratio(&self) -> f64 {
        match self.capacity.spot_template {
            Some(_) => f64::from(self.capacity.spot_percentage) / 100.0,
            None => 0.0,
        }
    }
}
