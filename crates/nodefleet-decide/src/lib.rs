//! nodefleet-decide: the scaling decision engine.
//!
//! A pure function from snapshot history plus cluster state to a single
//! [`Decision`]. No I/O happens here; the control loop feeds in history
//! from the state store and hands the result to the lifecycle controller.
//!
//! # Evaluation order
//!
//! ```text
//! safety      scaling_in_progress ─┐
//!             cooldown ────────────┤
//! reactive    pending work ────────┤  urgent scale-up
//!             below floor ─────────┤  urgent scale-up
//!             cpu / memory high ───┤  sustained scale-up
//!             queue backlog ───────┤
//!             sustained low ───────┤  scale-down (yields to any scale-up below)
//! predictive  interruption ────────┤  urgent preventative scale-up
//!             predicted spike ─────┤  preventative scale-up
//! default     ─────────────────────┴▶ NoOp
//! ```
//!
//! The first rule with a verdict wins. Two guards run afterwards: a
//! scale-up at `max_nodes` becomes `NoOp`, and so does a scale-down at or
//! below `min_nodes`.

pub mod decision;
pub mod engine;
pub mod predict;
pub mod rules;

pub use decision::{Decision, Evaluation, Layer};
pub use engine::DecisionEngine;
pub use predict::{HourlyPatternPredictor, LoadPredictor, NoPrediction, Prediction};
