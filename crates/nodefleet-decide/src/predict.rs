//! Load prediction for the preventative layer.
//!
//! A [`LoadPredictor`] looks at snapshot history and says whether load is
//! likely to spike within the next hour. The engine only consumes the
//! `score`; everything else in [`Prediction`] is for sizing and logs.

use nodefleet_core::config::ThresholdConfig;
use nodefleet_state::MetricSnapshot;
use tracing::debug;

const SECS_PER_HOUR: u64 = 3_600;
const SECS_PER_DAY: u64 = 86_400;

/// Forecast for the next hour.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub predicted_cpu: f64,
    pub predicted_memory: f64,
    pub predicted_pending: u64,
    /// How much the history backs this forecast (0-1).
    pub confidence: f64,
    /// Spike likelihood compared against `score_threshold`. Zero when no
    /// spike is predicted.
    pub score: f64,
    pub reason: String,
}

pub trait LoadPredictor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Forecast from `history` (oldest first) as seen at `now`. `None` when
    /// there is not enough history to say anything.
    fn predict(&self, history: &[MetricSnapshot], now: u64) -> Option<Prediction>;

    /// Node count that would keep the predicted load near 60% CPU, never
    /// fewer than `current_nodes` and at most three more.
    fn recommended_nodes(&self, prediction: &Prediction, current_nodes: u32) -> u32 {
        const TARGET_UTILIZATION: f64 = 60.0;
        let scaled =
            ((prediction.predicted_cpu / TARGET_UTILIZATION) * f64::from(current_nodes)) as u32 + 1;
        current_nodes.max(scaled).min(current_nodes + 3)
    }
}

/// Predictor used when prediction is disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPrediction;

impl LoadPredictor for NoPrediction {
    fn name(&self) -> &'static str {
        "none"
    }

    fn predict(&self, _history: &[MetricSnapshot], _now: u64) -> Option<Prediction> {
        None
    }
}

/// Forecasts the next hour from the same hour of day in past history,
/// adjusted by how busy the current weekday usually is.
#[derive(Debug, Clone)]
pub struct HourlyPatternPredictor {
    cpu_threshold: f64,
    memory_threshold: f64,
}

impl HourlyPatternPredictor {
    const MIN_SAMPLES: usize = 20;
    const MIN_HOUR_SAMPLES: u32 = 3;
    const MIN_CONFIDENCE: f64 = 0.3;
    const LOW_CONFIDENCE: f64 = 0.5;
    const SAFETY_MARGIN: f64 = 1.2;

    pub fn new(cpu_threshold: f64, memory_threshold: f64) -> Self {
        Self {
            cpu_threshold,
            memory_threshold,
        }
    }

    pub fn from_config(thresholds: &ThresholdConfig) -> Self {
        Self::new(thresholds.cpu_high, thresholds.memory_high)
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Bucket {
    samples: u32,
    cpu: f64,
    memory: f64,
    memory_samples: u32,
    pending: u64,
}

impl Bucket {
    fn add(&mut self, snap: &MetricSnapshot) {
        self.samples += 1;
        self.cpu += snap.avg_cpu_utilization;
        if let Some(memory) = snap.avg_memory_utilization {
            self.memory += memory;
            self.memory_samples += 1;
        }
        self.pending += snap.pending_workload_count;
    }

    fn avg_cpu(&self) -> f64 {
        if self.samples == 0 {
            0.0
        } else {
            self.cpu / f64::from(self.samples)
        }
    }

    fn avg_memory(&self) -> f64 {
        if self.memory_samples == 0 {
            0.0
        } else {
            self.memory / f64::from(self.memory_samples)
        }
    }

    fn avg_pending(&self) -> u64 {
        if self.samples == 0 {
            0
        } else {
            self.pending / u64::from(self.samples)
        }
    }
}

impl LoadPredictor for HourlyPatternPredictor {
    fn name(&self) -> &'static str {
        "hourly-pattern"
    }

    fn predict(&self, history: &[MetricSnapshot], now: u64) -> Option<Prediction> {
        if history.len() < Self::MIN_SAMPLES {
            debug!(samples = history.len(), "insufficient history for prediction");
            return None;
        }

        let mut hours = [Bucket::default(); 24];
        let mut weekday = Bucket::default();
        let mut overall = Bucket::default();
        let today = weekday_of(now);
        for snap in history {
            hours[hour_of(snap.timestamp)].add(snap);
            overall.add(snap);
            if weekday_of(snap.timestamp) == today {
                weekday.add(snap);
            }
        }

        let next_hour = (hour_of(now) + 1) % 24;
        let pattern = hours[next_hour];
        let mut prediction = Prediction {
            predicted_cpu: 0.0,
            predicted_memory: 0.0,
            predicted_pending: 0,
            confidence: 0.0,
            score: 0.0,
            reason: String::new(),
        };
        if pattern.samples >= Self::MIN_HOUR_SAMPLES {
            prediction.predicted_cpu = pattern.avg_cpu();
            prediction.predicted_memory = pattern.avg_memory();
            prediction.predicted_pending = pattern.avg_pending();
            prediction.confidence = (f64::from(pattern.samples) / 10.0).min(1.0);
        }

        let overall_cpu = overall.avg_cpu();
        if weekday.samples > 0 && overall_cpu > 0.0 {
            let multiplier = weekday.avg_cpu() / overall_cpu;
            prediction.predicted_cpu *= multiplier;
            prediction.predicted_memory *= multiplier;
        }

        if prediction.confidence < Self::LOW_CONFIDENCE {
            prediction.predicted_cpu *= Self::SAFETY_MARGIN;
            prediction.predicted_memory *= Self::SAFETY_MARGIN;
        }

        let spike = if prediction.confidence < Self::MIN_CONFIDENCE {
            None
        } else if prediction.predicted_cpu > self.cpu_threshold {
            Some(format!(
                "predicted cpu {:.1}% at hour {next_hour}",
                prediction.predicted_cpu
            ))
        } else if prediction.predicted_memory > self.memory_threshold {
            Some(format!(
                "predicted memory {:.1}% at hour {next_hour}",
                prediction.predicted_memory
            ))
        } else if prediction.predicted_pending > 0 {
            Some(format!(
                "predicted {} pending workloads at hour {next_hour}",
                prediction.predicted_pending
            ))
        } else {
            None
        };

        match spike {
            Some(reason) => {
                prediction.score = prediction.confidence;
                prediction.reason = reason;
            }
            None if prediction.confidence < Self::MIN_CONFIDENCE => {
                prediction.reason = "insufficient prediction confidence".to_string();
            }
            None => prediction.reason = "no predicted load spike".to_string(),
        }

        debug!(
            next_hour,
            cpu = prediction.predicted_cpu,
            memory = prediction.predicted_memory,
            confidence = prediction.confidence,
            score = prediction.score,
            "load prediction"
        );
        Some(prediction)
    }
}

/// Hour of day (UTC) for a unix timestamp.
fn hour_of(ts: u64) -> usize {
    ((ts / SECS_PER_HOUR) % 24) as usize
}

/// Day of week (UTC) for a unix timestamp, Monday = 0. 1970-01-01 was a
/// Thursday.
fn weekday_of(ts: u64) -> u64 {
    (ts / SECS_PER_DAY + 3) % 7
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 2023-12-25 00:00:00 UTC, a Monday.
    const WEEK_START: u64 = 1_703_462_400;
    /// 2024-01-01 08:30:00 UTC, the following Monday.
    const MONDAY_0830: u64 = 1_704_097_800;

    fn hourly_history(days: u64, cpu_at: impl Fn(usize) -> f64) -> Vec<MetricSnapshot> {
        (0..days * 24)
            .map(|i| {
                let ts = WEEK_START + i * SECS_PER_HOUR;
                MetricSnapshot::new("c", ts, cpu_at(hour_of(ts)), 0)
            })
            .collect()
    }

    fn predictor() -> HourlyPatternPredictor {
        HourlyPatternPredictor::new(70.0, 75.0)
    }

    #[test]
    fn calendar_helpers() {
        assert_eq!(weekday_of(WEEK_START), 0);
        assert_eq!(weekday_of(MONDAY_0830), 0);
        assert_eq!(weekday_of(0), 3);
        assert_eq!(hour_of(MONDAY_0830), 8);
    }

    #[test]
    fn needs_minimum_history() {
        let history = hourly_history(1, |_| 50.0);
        assert!(predictor().predict(&history[..19], MONDAY_0830).is_none());
        assert!(predictor().predict(&history[..20], MONDAY_0830).is_some());
    }

    #[test]
    fn recurring_spike_scores_confidence() {
        let history = hourly_history(7, |hour| if hour == 9 { 90.0 } else { 20.0 });
        let prediction = predictor().predict(&history, MONDAY_0830).unwrap();
        assert!((prediction.predicted_cpu - 90.0).abs() < 1e-9);
        assert!((prediction.confidence - 0.7).abs() < 1e-9);
        assert!((prediction.score - 0.7).abs() < 1e-9);
    }

    #[test]
    fn from_config_uses_high_watermarks() {
        let thresholds = ThresholdConfig {
            cpu_high: 95.0,
            ..ThresholdConfig::default()
        };
        let history = hourly_history(7, |hour| if hour == 9 { 90.0 } else { 20.0 });
        let prediction = HourlyPatternPredictor::from_config(&thresholds)
            .predict(&history, MONDAY_0830)
            .unwrap();
        assert_eq!(prediction.score, 0.0);
    }

    #[test]
    fn flat_load_scores_zero() {
        let history = hourly_history(7, |_| 20.0);
        let prediction = predictor().predict(&history, MONDAY_0830).unwrap();
        assert_eq!(prediction.score, 0.0);
        assert_eq!(prediction.reason, "no predicted load spike");
    }

    #[test]
    fn low_confidence_adds_safety_margin() {
        let history = hourly_history(3, |hour| if hour == 9 { 60.0 } else { 20.0 });
        let prediction = predictor().predict(&history, WEEK_START + 3 * SECS_PER_DAY + 8 * SECS_PER_HOUR).unwrap();
        assert!((prediction.confidence - 0.3).abs() < 1e-9);
        assert!((prediction.predicted_cpu - 72.0).abs() < 1e-9);
        assert!((prediction.score - 0.3).abs() < 1e-9);
    }

    #[test]
    fn recommended_nodes_bounded() {
        let p = Prediction {
            predicted_cpu: 90.0,
            predicted_memory: 0.0,
            predicted_pending: 0,
            confidence: 1.0,
            score: 1.0,
            reason: String::new(),
        };
        assert_eq!(predictor().recommended_nodes(&p, 4), 7);
        assert_eq!(predictor().recommended_nodes(&p, 10), 13);

        let idle = Prediction {
            predicted_cpu: 10.0,
            ..p
        };
        assert_eq!(predictor().recommended_nodes(&idle, 4), 4);
    }

    #[test]
    fn no_prediction_never_predicts() {
        let history = hourly_history(7, |_| 99.0);
        assert!(NoPrediction.predict(&history, MONDAY_0830).is_none());
    }
}
