//! nodefleet-state: the coordination store behind the control loop.
//!
//! Backed by [redb](https://docs.rs/redb). Holds three kinds of record per
//! cluster: the TTL lock, the versioned cluster state, and the metric
//! snapshot history used for sustained-condition checks and prediction.
//!
//! # Architecture
//!
//! ```text
//! LockManager ──▶ dyn CoordinationStore ──▶ StateStore (redb)
//!   try_acquire_lock    insert_lock_if_vacant      locks     {cluster_id}
//!   release_lock        delete_lock_if_holder      clusters  {cluster_id}
//!   update_state        put_cluster_state_if_version
//! ControlLoop ────────▶ put_snapshot               snapshots {cluster_id}:{ts:020}
//!                       list_snapshots_since
//!                       prune_snapshots_before
//! ```
//!
//! Every conditional write runs inside a single redb write transaction.
//! redb serializes write transactions, so the check and the write are
//! atomic with respect to every other caller sharing the store.

pub mod coord;
pub mod error;
pub mod lock;
pub mod store;
pub mod tables;
pub mod types;

pub use coord::CoordinationStore;
pub use error::{StateError, StateResult};
pub use lock::{LockManager, LockOutcome};
pub use store::StateStore;
pub use types::*;
