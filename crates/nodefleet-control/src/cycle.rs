//! ControlLoop: one locked cycle per tick.
//!
//! The in-progress marker written before any node is touched doubles as a
//! crash flag. A cycle that dies (or errors) mid-execution leaves it set,
//! and whichever cycle next takes the lock reconciles the cluster before
//! deciding anything new.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use nodefleet_core::{Clock, FleetConfig};
use nodefleet_decide::{Decision, DecisionEngine, Evaluation};
use nodefleet_lifecycle::{
    ComputeApi, ControlPlane, LifecycleController, MutationGuard, ReconcileOutcome,
    ScaleDownOutcome, ScaleUpOutcome,
};
use nodefleet_metrics::{MetricSource, MetricsError};
use nodefleet_state::{
    ClusterState, CoordinationStore, LockManager, LockOutcome, MetricSnapshot, ScaleDirection,
    StateError,
};
use serde::Serialize;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::error::{CycleError, CycleResult};
use crate::event::{CycleEvent, CycleOutcome, EventCallback};

/// What the cycle did to the cluster.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Execution {
    None,
    ScaleUp(ScaleUpOutcome),
    ScaleDown(ScaleDownOutcome),
    Recovery(ReconcileOutcome),
}

/// Result of a cycle that held the lock and finished.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleReport {
    pub cluster_id: String,
    pub holder_id: String,
    pub timestamp: u64,
    pub decision: Decision,
    pub reason: String,
    pub execution: Execution,
    /// Cluster state as written (or read, for no-op cycles).
    pub state: ClusterState,
}

impl CycleReport {
    pub fn outcome(&self) -> CycleOutcome {
        match self.execution {
            Execution::None => CycleOutcome::NoAction,
            Execution::ScaleUp(_) => CycleOutcome::ScaledUp,
            Execution::ScaleDown(_) => CycleOutcome::ScaledDown,
            Execution::Recovery(_) => CycleOutcome::Recovered,
        }
    }
}

/// Lets node mutations proceed only while this cycle still owns the lock.
struct LeaseGuard<'a> {
    locks: &'a LockManager,
    cluster_id: &'a str,
    holder_id: &'a str,
}

impl MutationGuard for LeaseGuard<'_> {
    fn may_mutate(&self) -> bool {
        match self.locks.holds_lock(self.cluster_id, self.holder_id) {
            Ok(true) => true,
            Ok(false) => {
                warn!(cluster_id = %self.cluster_id, holder_id = %self.holder_id, "lease expired mid-cycle");
                false
            }
            Err(e) => {
                warn!(cluster_id = %self.cluster_id, error = %e, "cannot confirm lease");
                false
            }
        }
    }
}

pub struct ControlLoop {
    config: FleetConfig,
    /// Per-process prefix; each cycle appends its own sequence number.
    holder_prefix: String,
    cycles: AtomicU64,
    locks: LockManager,
    store: Arc<dyn CoordinationStore>,
    metrics: Arc<dyn MetricSource>,
    engine: DecisionEngine,
    lifecycle: LifecycleController,
    clock: Arc<dyn Clock>,
    on_event: Option<EventCallback>,
}

impl ControlLoop {
    pub fn new(
        config: FleetConfig,
        store: Arc<dyn CoordinationStore>,
        metrics: Arc<dyn MetricSource>,
        compute: Arc<dyn ComputeApi>,
        control: Arc<dyn ControlPlane>,
        clock: Arc<dyn Clock>,
        holder_prefix: impl Into<String>,
    ) -> Self {
        let locks = LockManager::new(store.clone(), clock.clone(), config.cluster.min_nodes);
        let lifecycle = LifecycleController::new(compute, control, &config);
        let engine = DecisionEngine::new(config.clone());
        Self {
            config,
            holder_prefix: holder_prefix.into(),
            cycles: AtomicU64::new(0),
            locks,
            store,
            metrics,
            engine,
            lifecycle,
            clock,
            on_event: None,
        }
    }

    pub fn with_engine(mut self, engine: DecisionEngine) -> Self {
        self.engine = engine;
        self
    }

    pub fn with_callback(mut self, callback: EventCallback) -> Self {
        self.on_event = Some(callback);
        self
    }

    pub fn cluster_id(&self) -> &str {
        &self.config.cluster.cluster_id
    }

    pub fn holder_prefix(&self) -> &str {
        &self.holder_prefix
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    /// Run one full cycle and report it to the event callback.
    pub async fn run_cycle(&self) -> CycleResult<CycleReport> {
        let cluster_id = self.cluster_id();
        let seq = self.cycles.fetch_add(1, Ordering::SeqCst) + 1;
        let holder_id = format!("{}#{seq}", self.holder_prefix);
        let now = self.clock.now();

        let mut decided = None;
        let result = self.cycle(cluster_id, &holder_id, now, &mut decided).await;

        let event = match &result {
            Ok(report) => {
                info!(
                    %cluster_id,
                    %holder_id,
                    decision = %report.decision,
                    outcome = ?report.outcome(),
                    node_count = report.state.node_count,
                    "cycle complete"
                );
                CycleEvent::from_report(report)
            }
            Err(e) => {
                match e {
                    CycleError::LockContention { .. } => {
                        debug!(%cluster_id, %holder_id, reason = %e, "cycle skipped")
                    }
                    CycleError::MetricsUnavailable(_) | CycleError::StaleState(_) => {
                        warn!(%cluster_id, %holder_id, error = %e, "cycle aborted")
                    }
                    _ => error!(%cluster_id, %holder_id, error = %e, "cycle failed"),
                }
                CycleEvent::from_error(cluster_id, now, &holder_id, decided, e)
            }
        };
        if let Some(callback) = &self.on_event {
            callback(event).await;
        }
        result
    }

    async fn cycle(
        &self,
        cluster_id: &str,
        holder_id: &str,
        now: u64,
        decided: &mut Option<Decision>,
    ) -> CycleResult<CycleReport> {
        let ttl = self.config.lock.ttl.as_duration();
        match self.locks.try_acquire_lock(cluster_id, holder_id, ttl)? {
            LockOutcome::Acquired => {}
            LockOutcome::AlreadyHeld {
                holder_id: holder,
                expires_at,
            } => {
                return Err(CycleError::LockContention {
                    cluster_id: cluster_id.to_string(),
                    holder_id: holder,
                    expires_at,
                });
            }
        }

        let guard = LeaseGuard {
            locks: &self.locks,
            cluster_id,
            holder_id,
        };
        let result = self.locked(&guard, now, decided).await;

        if let Err(e) = self.locks.release_lock(cluster_id, holder_id) {
            warn!(%cluster_id, %holder_id, error = %e, "failed to release lock; it will expire");
        }
        result
    }

    async fn locked(
        &self,
        guard: &LeaseGuard<'_>,
        now: u64,
        decided: &mut Option<Decision>,
    ) -> CycleResult<CycleReport> {
        let cluster_id = guard.cluster_id;
        let state = self.locks.read_state(cluster_id)?;
        if state.scaling_in_progress {
            return self.recover(guard, now, state).await;
        }

        let snapshot = self.sample(cluster_id, now).await?;
        let history = self.record_history(&snapshot, now)?;

        let evaluation = self.engine.evaluate_explained(&history, &state, now);
        *decided = Some(evaluation.decision);
        match evaluation.decision {
            Decision::NoOp => Ok(self.report(guard, now, evaluation, Execution::None, state)),
            Decision::ScaleUp { .. } => self.scale_up(guard, now, evaluation, state).await,
            Decision::ScaleDown => self.scale_down(guard, now, evaluation, state).await,
        }
    }

    // ── Observe ────────────────────────────────────────────────────

    async fn sample(&self, cluster_id: &str, now: u64) -> CycleResult<MetricSnapshot> {
        let limit = self.config.metrics.query_timeout.as_duration();
        match timeout(limit, self.metrics.snapshot(cluster_id, now)).await {
            Ok(Ok(snapshot)) => Ok(snapshot),
            Ok(Err(e)) => Err(CycleError::MetricsUnavailable(e)),
            Err(_) => Err(CycleError::MetricsUnavailable(MetricsError::Unavailable(
                format!("{} source timed out after {limit:?}", self.metrics.name()),
            ))),
        }
    }

    /// Persist `snapshot`, prune past retention, and load the window the
    /// engine needs.
    fn record_history(&self, snapshot: &MetricSnapshot, now: u64) -> CycleResult<Vec<MetricSnapshot>> {
        let cluster_id = snapshot.cluster_id.as_str();
        self.store.put_snapshot(snapshot)?;

        let retention = self.config.metrics.retention.as_secs();
        if retention > 0 {
            let pruned = self
                .store
                .prune_snapshots_before(cluster_id, now.saturating_sub(retention))?;
            if pruned > 0 {
                debug!(%cluster_id, pruned, "pruned old snapshots");
            }
        }

        Ok(self
            .store
            .list_snapshots_since(cluster_id, now.saturating_sub(self.history_window()))?)
    }

    fn history_window(&self) -> u64 {
        let sustained = self.config.thresholds.sustained_for.as_secs();
        let lookback = if self.config.predictive.enabled {
            self.config.predictive.lookback.as_secs()
        } else {
            0
        };
        // One extra tick so the sample just before the window is included.
        sustained.max(lookback) + self.config.metrics.interval.as_secs()
    }

    // ── Execute ────────────────────────────────────────────────────

    async fn scale_up(
        &self,
        guard: &LeaseGuard<'_>,
        now: u64,
        evaluation: Evaluation,
        state: ClusterState,
    ) -> CycleResult<CycleReport> {
        let cluster_id = guard.cluster_id;
        let marked = self.mark_in_progress(cluster_id, &state, &evaluation)?;
        let outcome = self
            .lifecycle
            .scale_up(cluster_id, marked.node_count, evaluation.nodes, guard)
            .await?;

        if outcome.is_total_failure() {
            self.locks
                .update_state(cluster_id, marked.version, |s| s.scaling_in_progress = false)?;
            return Err(CycleError::ProvisioningFailure {
                failed_creates: outcome.failed_creates,
                not_ready: outcome.failed.len() as u32,
            });
        }

        let written = self.finish(cluster_id, now, &marked, outcome.observed_nodes, ScaleDirection::Up)?;
        Ok(self.report(guard, now, evaluation, Execution::ScaleUp(outcome), written))
    }

    async fn scale_down(
        &self,
        guard: &LeaseGuard<'_>,
        now: u64,
        evaluation: Evaluation,
        state: ClusterState,
    ) -> CycleResult<CycleReport> {
        let cluster_id = guard.cluster_id;
        let marked = self.mark_in_progress(cluster_id, &state, &evaluation)?;
        let outcome = self
            .lifecycle
            .scale_down(cluster_id, evaluation.nodes, guard)
            .await?;

        let written = self.finish(cluster_id, now, &marked, outcome.observed_nodes, ScaleDirection::Down)?;
        Ok(self.report(guard, now, evaluation, Execution::ScaleDown(outcome), written))
    }

    fn mark_in_progress(
        &self,
        cluster_id: &str,
        state: &ClusterState,
        evaluation: &Evaluation,
    ) -> CycleResult<ClusterState> {
        let marked = self
            .locks
            .update_state(cluster_id, state.version, |s| s.scaling_in_progress = true)?;
        info!(
            %cluster_id,
            decision = %evaluation.decision,
            nodes = evaluation.nodes,
            reason = %evaluation.reason,
            "executing"
        );
        Ok(marked)
    }

    /// Record the observed outcome and clear the in-progress marker.
    fn finish(
        &self,
        cluster_id: &str,
        now: u64,
        marked: &ClusterState,
        observed: u32,
        direction: ScaleDirection,
    ) -> CycleResult<ClusterState> {
        let result = self.locks.update_state(cluster_id, marked.version, |s| {
            s.node_count = observed;
            s.scaling_in_progress = false;
            s.last_scale_time = now;
            s.last_scale_direction = direction;
        });
        match result {
            Err(StateError::Invariant(reason)) => {
                // Reality is below the floor (reclaimed nodes); record it so
                // the next cycle scales back up.
                warn!(%cluster_id, %reason, observed, "recording observed count below floor");
                Ok(self
                    .locks
                    .record_observed_count(cluster_id, marked.version, observed)?)
            }
            other => Ok(other?),
        }
    }

    // ── Recover ────────────────────────────────────────────────────

    async fn recover(
        &self,
        guard: &LeaseGuard<'_>,
        now: u64,
        state: ClusterState,
    ) -> CycleResult<CycleReport> {
        let cluster_id = guard.cluster_id;
        warn!(
            %cluster_id,
            version = state.version,
            recorded = state.node_count,
            "previous cycle left scaling in progress; reconciling"
        );
        let outcome = self.lifecycle.reconcile(cluster_id, now, guard).await?;
        let written = self
            .locks
            .record_observed_count(cluster_id, state.version, outcome.observed_nodes)?;
        Ok(CycleReport {
            cluster_id: cluster_id.to_string(),
            holder_id: guard.holder_id.to_string(),
            timestamp: now,
            decision: Decision::NoOp,
            reason: "reconciled interrupted scaling".to_string(),
            execution: Execution::Recovery(outcome),
            state: written,
        })
    }

    fn report(
        &self,
        guard: &LeaseGuard<'_>,
        now: u64,
        evaluation: Evaluation,
        execution: Execution,
        state: ClusterState,
    ) -> CycleReport {
        CycleReport {
            cluster_id: guard.cluster_id.to_string(),
            holder_id: guard.holder_id.to_string(),
            timestamp: now,
            decision: evaluation.decision,
            reason: evaluation.reason,
            execution,
            state,
        }
    }
}
