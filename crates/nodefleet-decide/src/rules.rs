//! The ordered rule chain.
//!
//! Each rule inspects a [`RuleContext`] and either returns a verdict or
//! passes. Rules never look at each other's results; precedence lives
//! entirely in the order of [`RULES`].

use nodefleet_core::FleetConfig;
use nodefleet_state::{ClusterState, MetricSnapshot};

use crate::decision::{Decision, Evaluation, Layer};
use crate::predict::Prediction;

/// Everything a rule may look at.
pub struct RuleContext<'a> {
    /// Snapshot history, oldest first.
    pub history: &'a [MetricSnapshot],
    pub state: &'a ClusterState,
    pub config: &'a FleetConfig,
    pub now: u64,
    pub prediction: Option<&'a Prediction>,
}

impl RuleContext<'_> {
    pub fn latest(&self) -> Option<&MetricSnapshot> {
        self.history.last()
    }

    fn sustained_secs(&self) -> u64 {
        self.config.thresholds.sustained_for.as_secs()
    }

    /// Widest spacing between samples that still counts as contiguous:
    /// one tick plus half a tick of jitter.
    fn max_gap(&self) -> u64 {
        let interval = self.config.metrics.interval.as_secs().max(1);
        interval + interval / 2
    }

    fn predicted_score(&self) -> f64 {
        self.prediction.map_or(0.0, |p| p.score)
    }
}

pub type Rule = fn(&RuleContext<'_>) -> Option<Evaluation>;

pub const RULES: &[Rule] = &[
    scaling_in_progress,
    cooldown,
    pending_work,
    below_floor,
    no_metrics,
    cpu_high,
    memory_high,
    queue_backlog,
    sustained_low,
    interruption,
    predicted_spike,
];

/// Run the chain; the first verdict wins.
pub fn first_verdict(ctx: &RuleContext<'_>) -> Evaluation {
    RULES
        .iter()
        .find_map(|rule| rule(ctx))
        .unwrap_or_else(|| Evaluation::noop(Layer::Default, "metrics within range"))
}

/// True when `condition` holds on the latest sample and on every sample of
/// the unbroken run leading up to it, and that run spans at least `window`
/// seconds. Consecutive samples further apart than `max_gap` seconds break
/// the run.
pub fn sustained(
    history: &[MetricSnapshot],
    window: u64,
    max_gap: u64,
    condition: impl Fn(&MetricSnapshot) -> bool,
) -> bool {
    let Some(latest) = history.last() else {
        return false;
    };
    if !condition(latest) {
        return false;
    }
    let mut start = latest.timestamp;
    for snap in history.iter().rev().skip(1) {
        if !condition(snap) || start.saturating_sub(snap.timestamp) > max_gap {
            break;
        }
        start = snap.timestamp;
    }
    latest.timestamp.saturating_sub(start) >= window
}

// ── Safety ────────────────────────────────────────────────────────

fn scaling_in_progress(ctx: &RuleContext<'_>) -> Option<Evaluation> {
    ctx.state
        .scaling_in_progress
        .then(|| Evaluation::noop(Layer::Safety, "scaling already in progress"))
}

fn cooldown(ctx: &RuleContext<'_>) -> Option<Evaluation> {
    let since = ctx.state.secs_since_last_scale(ctx.now);
    let window = ctx.config.cooldown.scale_up.as_secs();
    (since < window).then(|| {
        Evaluation::noop(
            Layer::Safety,
            format!("in cooldown ({since}s < {window}s)"),
        )
    })
}

fn no_metrics(ctx: &RuleContext<'_>) -> Option<Evaluation> {
    ctx.history
        .is_empty()
        .then(|| Evaluation::noop(Layer::Safety, "no metric history"))
}

// ── Reactive ──────────────────────────────────────────────────────

fn pending_work(ctx: &RuleContext<'_>) -> Option<Evaluation> {
    let pending = ctx.latest()?.pending_workload_count;
    (pending > 0).then(|| {
        Evaluation::new(
            Decision::ScaleUp {
                urgent: true,
                preventative: false,
            },
            Layer::Reactive,
            format!("{pending} pending workloads"),
        )
    })
}

fn below_floor(ctx: &RuleContext<'_>) -> Option<Evaluation> {
    let min = ctx.config.cluster.min_nodes;
    (ctx.state.node_count < min).then(|| {
        Evaluation::new(
            Decision::ScaleUp {
                urgent: true,
                preventative: false,
            },
            Layer::Reactive,
            format!("{} nodes is below the floor of {min}", ctx.state.node_count),
        )
    })
}

fn cpu_high(ctx: &RuleContext<'_>) -> Option<Evaluation> {
    let high = ctx.config.thresholds.cpu_high;
    sustained(ctx.history, ctx.sustained_secs(), ctx.max_gap(), |s| {
        s.avg_cpu_utilization > high
    })
    .then(|| {
        Evaluation::new(
            Decision::ScaleUp {
                urgent: false,
                preventative: false,
            },
            Layer::Reactive,
            format!("cpu above {high}% for {}s", ctx.sustained_secs()),
        )
    })
}

fn memory_high(ctx: &RuleContext<'_>) -> Option<Evaluation> {
    let high = ctx.config.thresholds.memory_high;
    sustained(ctx.history, ctx.sustained_secs(), ctx.max_gap(), |s| {
        s.avg_memory_utilization.is_some_and(|m| m > high)
    })
    .then(|| {
        Evaluation::new(
            Decision::ScaleUp {
                urgent: false,
                preventative: false,
            },
            Layer::Reactive,
            format!("memory above {high}% for {}s", ctx.sustained_secs()),
        )
    })
}

fn queue_backlog(ctx: &RuleContext<'_>) -> Option<Evaluation> {
    let limit = ctx.config.thresholds.queue_depth_high?;
    let depth = ctx.latest()?.queue_depth?;
    (depth > limit).then(|| {
        Evaluation::new(
            Decision::ScaleUp {
                urgent: false,
                preventative: false,
            },
            Layer::Reactive,
            format!("queue depth {depth} above {limit}"),
        )
    })
}

fn sustained_low(ctx: &RuleContext<'_>) -> Option<Evaluation> {
    let t = &ctx.config.thresholds;
    let low = sustained(ctx.history, ctx.sustained_secs(), ctx.max_gap(), |s| {
        s.avg_cpu_utilization < t.cpu_low
            && s.avg_memory_utilization.is_none_or(|m| m < t.memory_low)
            && s.pending_workload_count == 0
    });
    if !low {
        return None;
    }
    if ctx.state.node_count <= ctx.config.cluster.min_nodes {
        return None;
    }
    if ctx.state.secs_since_last_scale(ctx.now) < ctx.config.cooldown.scale_down.as_secs() {
        return None;
    }
    // A scale-up further down the chain takes precedence.
    if ctx.latest()?.external_interruption_signal
        || ctx.predicted_score() > ctx.config.predictive.score_threshold
    {
        return None;
    }
    Some(Evaluation::new(
        Decision::ScaleDown,
        Layer::Reactive,
        format!("cpu below {}% for {}s", t.cpu_low, ctx.sustained_secs()),
    ))
}

// ── Predictive ────────────────────────────────────────────────────

fn interruption(ctx: &RuleContext<'_>) -> Option<Evaluation> {
    ctx.latest()?.external_interruption_signal.then(|| {
        Evaluation::new(
            Decision::ScaleUp {
                urgent: true,
                preventative: true,
            },
            Layer::Predictive,
            "capacity interruption notice",
        )
    })
}

fn predicted_spike(ctx: &RuleContext<'_>) -> Option<Evaluation> {
    let prediction = ctx.prediction?;
    (prediction.score > ctx.config.predictive.score_threshold).then(|| {
        Evaluation::new(
            Decision::ScaleUp {
                urgent: false,
                preventative: true,
            },
            Layer::Predictive,
            format!("{} (score {:.2})", prediction.reason, prediction.score),
        )
    })
}
