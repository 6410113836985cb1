//! The coordination store contract.
//!
//! Two conditional-write primitives carry all cross-invocation safety: a
//! lock insert that fails while a live lock exists, and a state write that
//! fails unless the stored version matches. Any consistent key-value store
//! with compare-and-set semantics can implement this; [`StateStore`] does so
//! on redb. Snapshot history rides on the same store since it is written
//! under the same lock.
//!
//! [`StateStore`]: crate::StateStore

use crate::error::StateResult;
use crate::types::{ClusterState, LockRecord, MetricSnapshot};

pub trait CoordinationStore: Send + Sync {
    /// Insert `record` unless a lock for the same cluster is live at `now`.
    /// Returns `false` when the lock is held by someone else.
    fn insert_lock_if_vacant(&self, record: &LockRecord, now: u64) -> StateResult<bool>;

    /// Delete the cluster's lock only if `holder_id` owns it.
    fn delete_lock_if_holder(&self, cluster_id: &str, holder_id: &str) -> StateResult<bool>;

    fn get_lock(&self, cluster_id: &str) -> StateResult<Option<LockRecord>>;

    fn get_cluster_state(&self, cluster_id: &str) -> StateResult<Option<ClusterState>>;

    /// Store `state` only if the stored version equals `expected_version`
    /// (an absent record has version 0). Returns `false` on mismatch.
    fn put_cluster_state_if_version(
        &self,
        state: &ClusterState,
        expected_version: u64,
    ) -> StateResult<bool>;

    /// Insert a metric snapshot. A second snapshot with the same timestamp
    /// replaces the first.
    fn put_snapshot(&self, snapshot: &MetricSnapshot) -> StateResult<()>;

    /// Snapshots for a cluster with `timestamp >= since`, oldest first.
    fn list_snapshots_since(
        &self,
        cluster_id: &str,
        since: u64,
    ) -> StateResult<Vec<MetricSnapshot>>;

    /// Delete snapshots older than `before`. Returns the number deleted.
    fn prune_snapshots_before(&self, cluster_id: &str, before: u64) -> StateResult<u32>;
}
