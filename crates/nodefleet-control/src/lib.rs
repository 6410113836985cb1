//! nodefleet-control: the per-tick control cycle.
//!
//! # Architecture
//!
//! ```text
//!  tick ──▶ ControlLoop::run_cycle
//!             │
//!             ├─ LockManager::try_acquire_lock ── AlreadyHeld ──▶ Skipped
//!             ├─ read_state ── scaling_in_progress ──▶ reconcile ──▶ Recovered
//!             ├─ MetricSource::snapshot ── error ──▶ NoAction
//!             ├─ StateStore: put / prune / list history
//!             ├─ DecisionEngine::evaluate_explained
//!             ├─ update_state(scaling_in_progress = true)
//!             ├─ LifecycleController::scale_up / scale_down
//!             ├─ update_state(observed node_count)
//!             └─ release_lock ──▶ CycleEvent ──▶ EventCallback
//! ```
//!
//! The cluster lock is the only thing keeping overlapping cycles apart.
//! Cycles started by [`ControlLoop::run`] are spawned as independent
//! tasks, so a slow cycle never delays the next tick; the late one simply
//! finds the lock held and skips.

pub mod cycle;
pub mod driver;
pub mod error;
pub mod event;

pub use cycle::{ControlLoop, CycleReport, Execution};
pub use error::{CycleError, CycleResult};
pub use event::{BoxFuture, CycleEvent, CycleOutcome, EventCallback};
