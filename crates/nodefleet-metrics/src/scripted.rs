//! ScriptedSource: replays queued readings.
//!
//! Each `snapshot` call pops the next scripted step. Once the queue is
//! drained the last reading repeats, so a test can set a steady load with a
//! single push.

use std::collections::VecDeque;

use nodefleet_state::MetricSnapshot;
use tokio::sync::Mutex;

use crate::error::MetricsError;
use crate::source::{MetricSource, SnapshotFuture};

/// One scripted load sample, without identity or time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reading {
    pub cpu: f64,
    pub memory: Option<f64>,
    pub pending: u64,
    pub queue_depth: Option<u64>,
    pub interruption: bool,
}

impl Reading {
    pub fn cpu(cpu: f64) -> Self {
        Self {
            cpu,
            ..Self::default()
        }
    }

    pub fn with_pending(mut self, pending: u64) -> Self {
        self.pending = pending;
        self
    }

    pub fn with_memory(mut self, memory: f64) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn with_interruption(mut self) -> Self {
        self.interruption = true;
        self
    }

    pub fn to_snapshot(&self, cluster_id: &str, now: u64) -> MetricSnapshot {
        let mut snap = MetricSnapshot::new(cluster_id, now, self.cpu, self.pending)
            .with_interruption(self.interruption);
        if let Some(memory) = self.memory {
            snap = snap.with_memory(memory);
        }
        if let Some(depth) = self.queue_depth {
            snap = snap.with_queue_depth(depth);
        }
        snap
    }
}

#[derive(Debug, Clone)]
enum Step {
    Reading(Reading),
    Unavailable(String),
}

#[derive(Debug, Default)]
struct Script {
    steps: VecDeque<Step>,
    last: Option<Reading>,
    calls: u64,
}

#[derive(Debug, Default)]
pub struct ScriptedSource {
    script: Mutex<Script>,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// A source that reports `reading` forever.
    pub fn steady(reading: Reading) -> Self {
        Self {
            script: Mutex::new(Script {
                last: Some(reading),
                ..Script::default()
            }),
        }
    }

    pub async fn push(&self, reading: Reading) {
        self.script.lock().await.steps.push_back(Step::Reading(reading));
    }

    /// Queue a failed query.
    pub async fn push_unavailable(&self, reason: impl Into<String>) {
        self.script
            .lock()
            .await
            .steps
            .push_back(Step::Unavailable(reason.into()));
    }

    /// Drop anything queued and report `reading` from now on.
    pub async fn set(&self, reading: Reading) {
        let mut script = self.script.lock().await;
        script.steps.clear();
        script.last = Some(reading);
    }

    pub async fn calls(&self) -> u64 {
        self.script.lock().await.calls
    }
}

impl MetricSource for ScriptedSource {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn snapshot<'a>(&'a self, cluster_id: &'a str, now: u64) -> SnapshotFuture<'a> {
        Box::pin(async move {
            let mut script = self.script.lock().await;
            script.calls += 1;
            let reading = match script.steps.pop_front() {
                Some(Step::Reading(reading)) => {
                    script.last = Some(reading.clone());
                    reading
                }
                Some(Step::Unavailable(reason)) => return Err(MetricsError::Unavailable(reason)),
                None => script
                    .last
                    .clone()
                    .ok_or_else(|| MetricsError::Unavailable("no scripted readings".to_string()))?,
            };
            Ok(reading.to_snapshot(cluster_id, now))
        })
    }
}
