//! DecisionEngine: runs the rule chain and sizes the result.

use std::borrow::Cow;

use nodefleet_core::FleetConfig;
use nodefleet_state::{ClusterState, MetricSnapshot};
use tracing::debug;

use crate::decision::{Decision, Evaluation, Layer};
use crate::predict::{HourlyPatternPredictor, LoadPredictor, NoPrediction, Prediction};
use crate::rules::{RuleContext, first_verdict};

pub struct DecisionEngine {
    config: FleetConfig,
    predictor: Box<dyn LoadPredictor>,
}

impl DecisionEngine {
    /// Build an engine with the predictor selected by `[predictive]`.
    pub fn new(config: FleetConfig) -> Self {
        let predictor: Box<dyn LoadPredictor> = if config.predictive.enabled {
            Box::new(HourlyPatternPredictor::from_config(&config.thresholds))
        } else {
            Box::new(NoPrediction)
        };
        Self { config, predictor }
    }

    /// Replace the load predictor.
    pub fn with_predictor(mut self, predictor: Box<dyn LoadPredictor>) -> Self {
        self.predictor = predictor;
        self
    }

    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    pub fn predictor_name(&self) -> &'static str {
        self.predictor.name()
    }

    /// Decide what to do given `history` and the current `state` at `now`.
    pub fn evaluate(&self, history: &[MetricSnapshot], state: &ClusterState, now: u64) -> Decision {
        self.evaluate_explained(history, state, now).decision
    }

    /// Like [`evaluate`](Self::evaluate), but also reports the deciding
    /// layer, a reason, and how many nodes to add or remove.
    pub fn evaluate_explained(
        &self,
        history: &[MetricSnapshot],
        state: &ClusterState,
        now: u64,
    ) -> Evaluation {
        let history: Cow<'_, [MetricSnapshot]> =
            if history.is_sorted_by_key(|s| s.timestamp) {
                Cow::Borrowed(history)
            } else {
                let mut sorted = history.to_vec();
                sorted.sort_by_key(|s| s.timestamp);
                Cow::Owned(sorted)
            };

        let prediction = self.predict(&history, now);
        let ctx = RuleContext {
            history: &history,
            state,
            config: &self.config,
            now,
            prediction: prediction.as_ref(),
        };

        let mut evaluation = self.apply_bounds(first_verdict(&ctx), state);
        evaluation.nodes = self.size(&evaluation, &ctx);

        debug!(
            cluster_id = %state.cluster_id,
            decision = %evaluation.decision,
            layer = ?evaluation.layer,
            nodes = evaluation.nodes,
            reason = %evaluation.reason,
            "evaluated"
        );
        evaluation
    }

    fn predict(&self, history: &[MetricSnapshot], now: u64) -> Option<Prediction> {
        if !self.config.predictive.enabled {
            return None;
        }
        let since = now.saturating_sub(self.config.predictive.lookback.as_secs());
        let start = history.partition_point(|s| s.timestamp < since);
        self.predictor.predict(&history[start..], now)
    }

    /// Cluster-size guards that override whatever the chain decided.
    fn apply_bounds(&self, evaluation: Evaluation, state: &ClusterState) -> Evaluation {
        let cluster = &self.config.cluster;
        match evaluation.decision {
            Decision::ScaleUp { .. } if state.node_count >= cluster.max_nodes => {
                Evaluation::noop(
                    Layer::Safety,
                    format!(
                        "at max capacity ({} nodes); wanted to scale up: {}",
                        cluster.max_nodes, evaluation.reason
                    ),
                )
            }
            Decision::ScaleDown if state.node_count <= cluster.min_nodes => Evaluation::noop(
                Layer::Safety,
                format!("at min capacity ({} nodes)", cluster.min_nodes),
            ),
            _ => evaluation,
        }
    }

    fn size(&self, evaluation: &Evaluation, ctx: &RuleContext<'_>) -> u32 {
        let cluster = &self.config.cluster;
        let current = ctx.state.node_count;
        match evaluation.decision {
            Decision::NoOp => 0,
            Decision::ScaleDown => 1,
            Decision::ScaleUp {
                urgent,
                preventative,
            } => {
                let wanted = if preventative && urgent {
                    1
                } else if preventative {
                    let recommended = ctx
                        .prediction
                        .map(|p| self.predictor.recommended_nodes(p, current))
                        .unwrap_or(current);
                    recommended
                        .saturating_sub(current)
                        .clamp(1, self.config.predictive.max_preventative_nodes.max(1))
                } else {
                    let t = &self.config.thresholds;
                    let burst = ctx.latest().is_some_and(|s| {
                        s.avg_cpu_utilization > t.burst_cpu
                            || s.pending_workload_count > t.burst_pending
                    });
                    let reactive = if burst { 2 } else { 1 };
                    reactive.max(cluster.min_nodes.saturating_sub(current))
                };
                wanted.min(cluster.max_nodes.saturating_sub(current))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Well past any cooldown measured from `last_scale_time = 0`.
    const NOW: u64 = 1_700_000_000;

    fn engine() -> DecisionEngine {
        DecisionEngine::new(FleetConfig::default()).with_predictor(Box::new(NoPrediction))
    }

    fn state(nodes: u32) -> ClusterState {
        ClusterState::initial("c", nodes)
    }

    /// Samples every 60s, ending at `NOW`.
    fn history(cpus: &[f64]) -> Vec<MetricSnapshot> {
        let start = NOW - 60 * (cpus.len() as u64 - 1);
        cpus.iter()
            .enumerate()
            .map(|(i, cpu)| MetricSnapshot::new("c", start + 60 * i as u64, *cpu, 0))
            .collect()
    }

    fn with_latest(mut history: Vec<MetricSnapshot>, f: impl FnOnce(MetricSnapshot) -> MetricSnapshot) -> Vec<MetricSnapshot> {
        if let Some(last) = history.pop() {
            history.push(f(last));
        }
        history
    }

    const NON_URGENT: Decision = Decision::ScaleUp {
        urgent: false,
        preventative: false,
    };
    const URGENT: Decision = Decision::ScaleUp {
        urgent: true,
        preventative: false,
    };

    struct FixedScore(f64);

    impl LoadPredictor for FixedScore {
        fn name(&self) -> &'static str {
            "fixed"
        }

        fn predict(&self, _history: &[MetricSnapshot], _now: u64) -> Option<Prediction> {
            Some(Prediction {
                predicted_cpu: 90.0,
                predicted_memory: 0.0,
                predicted_pending: 0,
                confidence: self.0,
                score: self.0,
                reason: "fixed".to_string(),
            })
        }
    }

    // ── Reactive ───────────────────────────────────────────────────

    #[test]
    fn sustained_high_cpu_scales_up() {
        let eval = engine().evaluate_explained(&history(&[75.0; 6]), &state(4), NOW);
        assert_eq!(eval.decision, NON_URGENT);
        assert_eq!(eval.layer, Layer::Reactive);
        assert_eq!(eval.nodes, 1);
    }

    #[test]
    fn gapped_history_is_not_sustained() {
        let hot = vec![
            MetricSnapshot::new("c", NOW - 400, 75.0, 0),
            MetricSnapshot::new("c", NOW, 75.0, 0),
        ];
        assert_eq!(engine().evaluate(&hot, &state(4), NOW), Decision::NoOp);

        let cold = vec![
            MetricSnapshot::new("c", NOW - 400, 10.0, 0),
            MetricSnapshot::new("c", NOW, 10.0, 0),
        ];
        assert_eq!(engine().evaluate(&cold, &state(5), NOW), Decision::NoOp);

        // The same two readings with the tick in between present do count.
        let filled: Vec<_> = (0..=4)
            .map(|i| MetricSnapshot::new("c", NOW - 400 + 100 * i, 75.0, 0))
            .collect();
        assert_eq!(engine().evaluate(&filled, &state(4), NOW), NON_URGENT);
    }

    #[test]
    fn single_spike_is_ignored() {
        let h = history(&[50.0, 50.0, 50.0, 95.0, 50.0, 50.0]);
        assert_eq!(engine().evaluate(&h, &state(4), NOW), Decision::NoOp);

        let spike_last = history(&[50.0, 50.0, 50.0, 50.0, 50.0, 95.0]);
        assert_eq!(engine().evaluate(&spike_last, &state(4), NOW), Decision::NoOp);
    }

    #[test]
    fn pending_work_is_urgent_without_history() {
        let h = with_latest(history(&[10.0]), |s| MetricSnapshot {
            pending_workload_count: 1,
            ..s
        });
        let eval = engine().evaluate_explained(&h, &state(4), NOW);
        assert_eq!(eval.decision, URGENT);
        assert_eq!(eval.nodes, 1);
    }

    #[test]
    fn burst_adds_two_nodes() {
        let h = with_latest(history(&[10.0]), |s| MetricSnapshot {
            pending_workload_count: 6,
            ..s
        });
        assert_eq!(engine().evaluate_explained(&h, &state(4), NOW).nodes, 2);

        let hot = history(&[85.0; 6]);
        assert_eq!(engine().evaluate_explained(&hot, &state(4), NOW).nodes, 2);
    }

    #[test]
    fn sizing_capped_at_max() {
        let hot = history(&[85.0; 6]);
        let eval = engine().evaluate_explained(&hot, &state(9), NOW);
        assert_eq!(eval.decision, NON_URGENT);
        assert_eq!(eval.nodes, 1);
    }

    #[test]
    fn scale_up_at_max_is_noop() {
        let eval = engine().evaluate_explained(&history(&[95.0; 6]), &state(10), NOW);
        assert_eq!(eval.decision, Decision::NoOp);
        assert_eq!(eval.layer, Layer::Safety);
        assert!(eval.reason.contains("max capacity"));
    }

    #[test]
    fn sustained_memory_scales_up() {
        let h: Vec<_> = history(&[40.0; 6])
            .into_iter()
            .map(|s| s.with_memory(80.0))
            .collect();
        assert_eq!(engine().evaluate(&h, &state(4), NOW), NON_URGENT);
    }

    #[test]
    fn queue_backlog_scales_up() {
        let h = with_latest(history(&[40.0; 3]), |s| s.with_queue_depth(1_500));
        assert_eq!(engine().evaluate(&h, &state(4), NOW), NON_URGENT);

        let shallow = with_latest(history(&[40.0; 3]), |s| s.with_queue_depth(10));
        assert_eq!(engine().evaluate(&shallow, &state(4), NOW), Decision::NoOp);
    }

    #[test]
    fn below_floor_restores_floor() {
        let eval = engine().evaluate_explained(&history(&[40.0]), &state(0), NOW);
        assert_eq!(eval.decision, URGENT);
        assert_eq!(eval.nodes, 2);
    }

    // ── Scale-down ─────────────────────────────────────────────────

    #[test]
    fn sustained_low_scales_down_one() {
        let eval = engine().evaluate_explained(&history(&[10.0; 6]), &state(5), NOW);
        assert_eq!(eval.decision, Decision::ScaleDown);
        assert_eq!(eval.nodes, 1);
    }

    #[test]
    fn floor_is_never_crossed() {
        let low = history(&[5.0; 12]);
        assert_eq!(engine().evaluate(&low, &state(2), NOW), Decision::NoOp);
        // Below the floor the engine asks for capacity back instead.
        assert_eq!(engine().evaluate(&low, &state(1), NOW), URGENT);
    }

    #[test]
    fn high_memory_blocks_scale_down() {
        let h: Vec<_> = history(&[10.0; 6])
            .into_iter()
            .map(|s| s.with_memory(60.0))
            .collect();
        assert_eq!(engine().evaluate(&h, &state(5), NOW), Decision::NoOp);
    }

    #[test]
    fn scale_down_waits_for_longer_cooldown() {
        let mut s = state(5);
        s.last_scale_time = NOW - 400;
        assert_eq!(engine().evaluate(&history(&[10.0; 6]), &s, NOW), Decision::NoOp);
        s.last_scale_time = NOW - 600;
        assert_eq!(engine().evaluate(&history(&[10.0; 6]), &s, NOW), Decision::ScaleDown);
    }

    #[test]
    fn interruption_beats_scale_down() {
        let h = with_latest(history(&[10.0; 6]), |s| s.with_interruption(true));
        let eval = engine().evaluate_explained(&h, &state(5), NOW);
        assert_eq!(
            eval.decision,
            Decision::ScaleUp {
                urgent: true,
                preventative: true
            }
        );
        assert_eq!(eval.layer, Layer::Predictive);
        assert_eq!(eval.nodes, 1);
    }

    #[test]
    fn predicted_spike_beats_scale_down() {
        let engine = engine().with_predictor(Box::new(FixedScore(0.8)));
        let eval = engine.evaluate_explained(&history(&[10.0; 6]), &state(4), NOW);
        assert_eq!(
            eval.decision,
            Decision::ScaleUp {
                urgent: false,
                preventative: true
            }
        );
        // 90% predicted on 4 nodes recommends 7, capped at two preventative nodes.
        assert_eq!(eval.nodes, 2);
    }

    #[test]
    fn weak_prediction_is_ignored() {
        let engine = engine().with_predictor(Box::new(FixedScore(0.4)));
        assert_eq!(
            engine.evaluate(&history(&[50.0; 6]), &state(4), NOW),
            Decision::NoOp
        );
    }

    #[test]
    fn disabled_prediction_skips_predictor() {
        let mut config = FleetConfig::default();
        config.predictive.enabled = false;
        let engine = DecisionEngine::new(config).with_predictor(Box::new(FixedScore(1.0)));
        assert_eq!(
            engine.evaluate(&history(&[50.0; 6]), &state(4), NOW),
            Decision::NoOp
        );
    }

    // ── Safety ─────────────────────────────────────────────────────

    #[test]
    fn cooldown_blocks_repeat_scale_up() {
        let mut s = state(5);
        s.last_scale_time = NOW - 60;
        s.last_scale_direction = nodefleet_state::ScaleDirection::Up;
        let h = with_latest(history(&[95.0; 6]), |snap| MetricSnapshot {
            pending_workload_count: 20,
            ..snap
        });
        let eval = engine().evaluate_explained(&h, &s, NOW);
        assert_eq!(eval.decision, Decision::NoOp);
        assert!(eval.reason.contains("cooldown"));
    }

    #[test]
    fn in_progress_blocks_everything() {
        let mut s = state(5);
        s.scaling_in_progress = true;
        let h = with_latest(history(&[95.0]), |snap| snap.with_interruption(true));
        assert_eq!(engine().evaluate(&h, &s, NOW), Decision::NoOp);
    }

    #[test]
    fn empty_history_is_noop() {
        let eval = engine().evaluate_explained(&[], &state(4), NOW);
        assert_eq!(eval.decision, Decision::NoOp);
        assert_eq!(eval.reason, "no metric history");
    }

    #[test]
    fn unsorted_history_is_ordered_first() {
        let mut h = history(&[75.0; 6]);
        h.reverse();
        assert_eq!(engine().evaluate(&h, &state(4), NOW), NON_URGENT);
    }
}
