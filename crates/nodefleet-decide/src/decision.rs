use std::fmt;

use serde::{Deserialize, Serialize};

/// What the control loop should do this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Decision {
    NoOp,
    ScaleUp { urgent: bool, preventative: bool },
    ScaleDown,
}

impl Decision {
    pub fn is_noop(&self) -> bool {
        matches!(self, Decision::NoOp)
    }

    pub fn is_scale_up(&self) -> bool {
        matches!(self, Decision::ScaleUp { .. })
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::NoOp => write!(f, "no-op"),
            Decision::ScaleUp {
                urgent,
                preventative,
            } => {
                write!(f, "scale-up")?;
                if *urgent {
                    write!(f, " (urgent)")?;
                }
                if *preventative {
                    write!(f, " (preventative)")?;
                }
                Ok(())
            }
            Decision::ScaleDown => write!(f, "scale-down"),
        }
    }
}

/// Which evaluation layer produced a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layer {
    Safety,
    Reactive,
    Predictive,
    Default,
}

/// A decision together with where it came from and how large it is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub decision: Decision,
    pub layer: Layer,
    pub reason: String,
    /// Nodes to add or remove. Zero for `NoOp`.
    pub nodes: u32,
}

impl Evaluation {
    pub(crate) fn new(decision: Decision, layer: Layer, reason: impl Into<String>) -> Self {
        Self {
            decision,
            layer,
            reason: reason.into(),
            nodes: 0,
        }
    }

    pub(crate) fn noop(layer: Layer, reason: impl Into<String>) -> Self {
        Self::new(Decision::NoOp, layer, reason)
    }
}
