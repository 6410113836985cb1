//! nodefleet-metrics: where load snapshots come from.
//!
//! The control loop asks a [`MetricSource`] for one [`MetricSnapshot`] per
//! cycle. A source failure is never papered over with a guess: it surfaces
//! as a [`MetricsError`] and the cycle falls back to doing nothing.
//!
//! # Sources
//!
//! ```text
//! MetricSource
//!   ├── PrometheusSource   instant queries against /api/v1/query
//!   └── ScriptedSource     queued readings (tests, `fleetd simulate`)
//! ```
//!
//! [`MetricSnapshot`]: nodefleet_state::MetricSnapshot

pub mod error;
pub mod prometheus;
pub mod scripted;
pub mod source;

pub use error::{MetricsError, MetricsResult};
pub use prometheus::PrometheusSource;
pub use scripted::{Reading, ScriptedSource};
pub use source::{MetricSource, SnapshotFuture};
