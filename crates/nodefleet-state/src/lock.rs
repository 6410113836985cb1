//! LockManager: per-cluster mutual exclusion and optimistic state updates.
//!
//! The lock is a TTL lease held in the coordination store. It is the only
//! arbiter between overlapping control-loop invocations; nothing here
//! relies on in-process locking. Cluster state updates are additionally
//! version-checked so a holder whose lease expired mid-cycle cannot
//! clobber its successor's writes.

use std::sync::Arc;
use std::time::Duration;

use nodefleet_core::Clock;
use tracing::{debug, info, warn};

use crate::coord::CoordinationStore;
use crate::error::{StateError, StateResult};
use crate::types::{ClusterState, LockRecord, ScaleDirection};

/// Result of a lock attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome {
    Acquired,
    AlreadyHeld { holder_id: String, expires_at: u64 },
}

impl LockOutcome {
    pub fn is_acquired(&self) -> bool {
        matches!(self, LockOutcome::Acquired)
    }
}

/// Coordinates lock leases and cluster state for every managed cluster.
#[derive(Clone)]
pub struct LockManager {
    store: Arc<dyn CoordinationStore>,
    clock: Arc<dyn Clock>,
    min_nodes: u32,
}

impl LockManager {
    pub fn new(store: Arc<dyn CoordinationStore>, clock: Arc<dyn Clock>, min_nodes: u32) -> Self {
        Self {
            store,
            clock,
            min_nodes,
        }
    }

    pub fn min_nodes(&self) -> u32 {
        self.min_nodes
    }

    // ── Lock ───────────────────────────────────────────────────────

    /// Try to take the cluster lock for `ttl`. Never blocks: a live lock held
    /// by anyone (including `holder_id` itself) yields `AlreadyHeld`.
    pub fn try_acquire_lock(
        &self,
        cluster_id: &str,
        holder_id: &str,
        ttl: Duration,
    ) -> StateResult<LockOutcome> {
        let now = self.clock.now();
        let record = LockRecord {
            cluster_id: cluster_id.to_string(),
            holder_id: holder_id.to_string(),
            acquired_at: now,
            expires_at: now.saturating_add(ttl.as_secs().max(1)),
        };

        if self.store.insert_lock_if_vacant(&record, now)? {
            debug!(%cluster_id, %holder_id, expires_at = record.expires_at, "lock acquired");
            return Ok(LockOutcome::Acquired);
        }

        // The holder may have released between the failed insert and this
        // read; report it as held anyway and let the next tick retry.
        let current = self.store.get_lock(cluster_id)?;
        let (holder, expires_at) = match current {
            Some(lock) => (lock.holder_id, lock.expires_at),
            None => (String::new(), now),
        };
        debug!(%cluster_id, %holder_id, current_holder = %holder, "lock already held");
        Ok(LockOutcome::AlreadyHeld {
            holder_id: holder,
            expires_at,
        })
    }

    /// Release the lock if `holder_id` still owns it. Returns whether a
    /// record was deleted. Releasing a lock someone else now holds is a
    /// no-op.
    pub fn release_lock(&self, cluster_id: &str, holder_id: &str) -> StateResult<bool> {
        let released = self.store.delete_lock_if_holder(cluster_id, holder_id)?;
        if released {
            debug!(%cluster_id, %holder_id, "lock released");
        } else {
            warn!(%cluster_id, %holder_id, "lock no longer held at release");
        }
        Ok(released)
    }

    /// True only while `holder_id` owns a live lock on the cluster.
    pub fn holds_lock(&self, cluster_id: &str, holder_id: &str) -> StateResult<bool> {
        let now = self.clock.now();
        Ok(self
            .store
            .get_lock(cluster_id)?
            .is_some_and(|lock| lock.holder_id == holder_id && lock.is_live(now)))
    }

    // ── Cluster state ──────────────────────────────────────────────

    /// Current state, or the default state for a cluster never written.
    pub fn read_state(&self, cluster_id: &str) -> StateResult<ClusterState> {
        Ok(self
            .store
            .get_cluster_state(cluster_id)?
            .unwrap_or_else(|| ClusterState::initial(cluster_id, self.min_nodes)))
    }

    /// Apply `mutate` to the state at `expected_version` and store it with
    /// the next version.
    ///
    /// Fails with [`StateError::Conflict`] when another writer got there
    /// first, and with [`StateError::Invariant`] when the mutation would
    /// lower `node_count` below the floor.
    pub fn update_state<F>(
        &self,
        cluster_id: &str,
        expected_version: u64,
        mutate: F,
    ) -> StateResult<ClusterState>
    where
        F: FnOnce(&mut ClusterState),
    {
        let current = self.read_state(cluster_id)?;
        if current.version != expected_version {
            return Err(conflict(cluster_id, expected_version, current.version));
        }

        let mut next = current.clone();
        mutate(&mut next);
        next.cluster_id = cluster_id.to_string();

        if next.node_count < self.min_nodes && next.node_count < current.node_count {
            return Err(StateError::Invariant(format!(
                "{cluster_id}: node_count {} -> {} is below the floor of {}",
                current.node_count, next.node_count, self.min_nodes
            )));
        }
        next.version = expected_version + 1;

        if !self.store.put_cluster_state_if_version(&next, expected_version)? {
            let found = self.read_state(cluster_id)?.version;
            return Err(conflict(cluster_id, expected_version, found));
        }
        debug!(
            %cluster_id,
            version = next.version,
            node_count = next.node_count,
            in_progress = next.scaling_in_progress,
            "cluster state updated"
        );
        Ok(next)
    }

    /// Record the node count actually observed in the cluster, clearing any
    /// in-progress marker. Used by crash recovery, where the observed count
    /// is the truth even when it sits below the floor.
    pub fn record_observed_count(
        &self,
        cluster_id: &str,
        expected_version: u64,
        observed: u32,
    ) -> StateResult<ClusterState> {
        let current = self.read_state(cluster_id)?;
        if current.version != expected_version {
            return Err(conflict(cluster_id, expected_version, current.version));
        }
        let mut next = current;
        if next.node_count != observed {
            info!(
                %cluster_id,
                recorded = next.node_count,
                observed,
                "correcting recorded node count"
            );
        }
        next.node_count = observed;
        next.scaling_in_progress = false;
        next.last_scale_direction = ScaleDirection::None;
        next.version = expected_version + 1;

        if !self.store.put_cluster_state_if_version(&next, expected_version)? {
            let found = self.read_state(cluster_id)?.version;
            return Err(conflict(cluster_id, expected_version, found));
        }
        Ok(next)
    }
}

fn conflict(cluster_id: &str, expected: u64, found: u64) -> StateError {
    StateError::Conflict {
        cluster_id: cluster_id.to_string(),
        expected,
        found,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StateStore;
    use nodefleet_core::ManualClock;

    const TTL: Duration = Duration::from_secs(60);

    fn manager(start: u64) -> (LockManager, Arc<ManualClock>) {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let clock = Arc::new(ManualClock::new(start));
        (LockManager::new(store, clock.clone(), 2), clock)
    }

    #[test]
    fn second_acquire_sees_holder() {
        let (locks, _) = manager(1_000);
        assert_eq!(
            locks.try_acquire_lock("c", "a", TTL).unwrap(),
            LockOutcome::Acquired
        );
        assert_eq!(
            locks.try_acquire_lock("c", "b", TTL).unwrap(),
            LockOutcome::AlreadyHeld {
                holder_id: "a".to_string(),
                expires_at: 1_060
            }
        );
    }

    #[test]
    fn reentrant_acquire_is_refused() {
        let (locks, _) = manager(1_000);
        assert!(locks.try_acquire_lock("c", "a", TTL).unwrap().is_acquired());
        assert!(!locks.try_acquire_lock("c", "a", TTL).unwrap().is_acquired());
    }

    #[test]
    fn concurrent_acquire_has_one_winner() {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let clock = Arc::new(ManualClock::new(5_000));
        let locks = LockManager::new(store, clock, 2);

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let locks = locks.clone();
                std::thread::spawn(move || {
                    locks
                        .try_acquire_lock("c", &format!("holder-{i}"), TTL)
                        .unwrap()
                        .is_acquired()
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|acquired| *acquired)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn expired_lock_is_acquirable() {
        let (locks, clock) = manager(1_000);
        locks.try_acquire_lock("c", "slow", TTL).unwrap();
        clock.advance(60);
        assert!(locks.try_acquire_lock("c", "fresh", TTL).unwrap().is_acquired());
        assert!(!locks.holds_lock("c", "slow").unwrap());
        assert!(locks.holds_lock("c", "fresh").unwrap());
    }

    #[test]
    fn stale_holder_cannot_release_successor() {
        let (locks, clock) = manager(1_000);
        locks.try_acquire_lock("c", "slow", TTL).unwrap();
        clock.advance(120);
        locks.try_acquire_lock("c", "fresh", TTL).unwrap();

        assert!(!locks.release_lock("c", "slow").unwrap());
        assert!(locks.holds_lock("c", "fresh").unwrap());
        assert!(locks.release_lock("c", "fresh").unwrap());
        assert!(locks.try_acquire_lock("c", "next", TTL).unwrap().is_acquired());
    }

    #[test]
    fn holds_lock_false_after_expiry() {
        let (locks, clock) = manager(1_000);
        locks.try_acquire_lock("c", "a", TTL).unwrap();
        assert!(locks.holds_lock("c", "a").unwrap());
        clock.advance(61);
        assert!(!locks.holds_lock("c", "a").unwrap());
    }

    #[test]
    fn read_state_defaults_to_floor() {
        let (locks, _) = manager(0);
        let state = locks.read_state("fresh").unwrap();
        assert_eq!(state.node_count, 2);
        assert_eq!(state.version, 0);
        assert!(!state.scaling_in_progress);
    }

    #[test]
    fn update_bumps_version() {
        let (locks, _) = manager(0);
        let s1 = locks.update_state("c", 0, |s| s.node_count = 4).unwrap();
        assert_eq!(s1.version, 1);
        let s2 = locks
            .update_state("c", 1, |s| s.scaling_in_progress = true)
            .unwrap();
        assert_eq!(s2.version, 2);
        assert_eq!(s2.node_count, 4);
        assert_eq!(locks.read_state("c").unwrap(), s2);
    }

    #[test]
    fn stale_version_conflicts() {
        let (locks, _) = manager(0);
        locks.update_state("c", 0, |s| s.node_count = 3).unwrap();
        let err = locks.update_state("c", 0, |s| s.node_count = 9).unwrap_err();
        assert!(matches!(
            err,
            StateError::Conflict {
                expected: 0,
                found: 1,
                ..
            }
        ));
        assert_eq!(locks.read_state("c").unwrap().node_count, 3);
    }

    #[test]
    fn write_below_floor_is_rejected() {
        let (locks, _) = manager(0);
        locks.update_state("c", 0, |s| s.node_count = 3).unwrap();
        locks.update_state("c", 1, |s| s.node_count = 2).unwrap();
        let err = locks.update_state("c", 2, |s| s.node_count = 1).unwrap_err();
        assert!(matches!(err, StateError::Invariant(_)));
        assert_eq!(locks.read_state("c").unwrap().node_count, 2);
    }

    #[test]
    fn observed_count_overrides_floor() {
        let (locks, _) = manager(0);
        locks
            .update_state("c", 0, |s| s.scaling_in_progress = true)
            .unwrap();
        let state = locks.record_observed_count("c", 1, 1).unwrap();
        assert_eq!(state.node_count, 1);
        assert!(!state.scaling_in_progress);
        assert_eq!(state.version, 2);
    }
}
