//! StateStore: redb-backed coordination store.
//!
//! Provides the conditional writes behind [`CoordinationStore`] plus the
//! snapshot history. All values are JSON-serialized into redb's `&[u8]`
//! value columns. The store supports both on-disk and in-memory backends
//! (the latter for testing and simulation).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::coord::CoordinationStore;
use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store.
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(LOCKS).map_err(map_err!(Table))?;
        txn.open_table(CLUSTERS).map_err(map_err!(Table))?;
        txn.open_table(SNAPSHOTS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get_json<T: DeserializeOwned>(
        &self,
        table_def: redb::TableDefinition<&str, &[u8]>,
        key: &str,
    ) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table_def).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value: T =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }
}

impl CoordinationStore for StateStore {
    fn insert_lock_if_vacant(&self, record: &LockRecord, now: u64) -> StateResult<bool> {
        let value = to_json(record)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(LOCKS).map_err(map_err!(Table))?;
            let existing: Option<LockRecord> = match table
                .get(record.cluster_id.as_str())
                .map_err(map_err!(Read))?
            {
                Some(guard) => {
                    Some(serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?)
                }
                None => None,
            };
            if let Some(current) = existing
                && current.is_live(now)
            {
                debug!(
                    cluster_id = %record.cluster_id,
                    holder = %current.holder_id,
                    expires_at = current.expires_at,
                    "lock is held"
                );
                // Dropping the transaction aborts it.
                return Ok(false);
            }
            table
                .insert(record.cluster_id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(true)
    }

    fn delete_lock_if_holder(&self, cluster_id: &str, holder_id: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(LOCKS).map_err(map_err!(Table))?;
            let current: Option<LockRecord> =
                match table.get(cluster_id).map_err(map_err!(Read))? {
                    Some(guard) => Some(
                        serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?,
                    ),
                    None => None,
                };
            match current {
                Some(lock) if lock.holder_id == holder_id => {
                    table.remove(cluster_id).map_err(map_err!(Write))?;
                }
                _ => return Ok(false),
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(true)
    }

    fn get_lock(&self, cluster_id: &str) -> StateResult<Option<LockRecord>> {
        self.get_json(LOCKS, cluster_id)
    }

    fn get_cluster_state(&self, cluster_id: &str) -> StateResult<Option<ClusterState>> {
        self.get_json(CLUSTERS, cluster_id)
    }

    fn put_cluster_state_if_version(
        &self,
        state: &ClusterState,
        expected_version: u64,
    ) -> StateResult<bool> {
        let value = to_json(state)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(CLUSTERS).map_err(map_err!(Table))?;
            let stored_version = match table
                .get(state.cluster_id.as_str())
                .map_err(map_err!(Read))?
            {
                Some(guard) => {
                    let current: ClusterState =
                        serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                    current.version
                }
                None => 0,
            };
            if stored_version != expected_version {
                return Ok(false);
            }
            table
                .insert(state.cluster_id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(cluster_id = %state.cluster_id, version = state.version, "cluster state stored");
        Ok(true)
    }

    // ── Snapshots ──────────────────────────────────────────────────

    fn put_snapshot(&self, snapshot: &MetricSnapshot) -> StateResult<()> {
        let key = snapshot.table_key();
        let value = to_json(snapshot)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(SNAPSHOTS).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn list_snapshots_since(
        &self,
        cluster_id: &str,
        since: u64,
    ) -> StateResult<Vec<MetricSnapshot>> {
        let start = snapshot_key(cluster_id, since);
        let end = cluster_key_end(cluster_id);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SNAPSHOTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table
            .range(start.as_str()..end.as_str())
            .map_err(map_err!(Read))?
        {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let snapshot: MetricSnapshot =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            // Guard against cluster ids that share a textual prefix.
            if snapshot.cluster_id == cluster_id {
                results.push(snapshot);
            }
        }
        Ok(results)
    }

    fn prune_snapshots_before(&self, cluster_id: &str, before: u64) -> StateResult<u32> {
        let start = snapshot_key(cluster_id, 0);
        let end = snapshot_key(cluster_id, before);
        // Collect keys in a read transaction first.
        let keys: Vec<String> = {
            let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
            let table = txn.open_table(SNAPSHOTS).map_err(map_err!(Table))?;
            table
                .range(start.as_str()..end.as_str())
                .map_err(map_err!(Read))?
                .filter_map(|entry| {
                    let (key, _) = entry.ok()?;
                    Some(key.value().to_string())
                })
                .collect()
        };
        // Delete in a write transaction.
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let count = keys.len() as u32;
        {
            let mut table = txn.open_table(SNAPSHOTS).map_err(map_err!(Table))?;
            for key in &keys {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        if count > 0 {
            debug!(%cluster_id, count, before, "pruned snapshots");
        }
        Ok(count)
    }
}

fn to_json<T: Serialize>(value: &T) -> StateResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(map_err!(Serialize))
}

/// Exclusive upper bound for every `{cluster_id}:…` key (`;` follows `:`).
fn cluster_key_end(cluster_id: &str) -> String {
    format!("{cluster_id};")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lock(cluster: &str, holder: &str, acquired_at: u64, ttl: u64) -> LockRecord {
        LockRecord {
            cluster_id: cluster.to_string(),
            holder_id: holder.to_string(),
            acquired_at,
            expires_at: acquired_at + ttl,
        }
    }

    // ── Locks ──────────────────────────────────────────────────────

    #[test]
    fn lock_insert_when_vacant() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.insert_lock_if_vacant(&lock("c", "a", 100, 60), 100).unwrap());
        assert_eq!(store.get_lock("c").unwrap().unwrap().holder_id, "a");
    }

    #[test]
    fn lock_insert_rejected_while_live() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.insert_lock_if_vacant(&lock("c", "a", 100, 60), 100).unwrap());
        assert!(!store.insert_lock_if_vacant(&lock("c", "b", 130, 60), 130).unwrap());
        // The original holder is untouched.
        assert_eq!(store.get_lock("c").unwrap().unwrap().holder_id, "a");
    }

    #[test]
    fn lock_insert_replaces_expired() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.insert_lock_if_vacant(&lock("c", "a", 100, 60), 100).unwrap());
        assert!(store.insert_lock_if_vacant(&lock("c", "b", 160, 60), 160).unwrap());
        assert_eq!(store.get_lock("c").unwrap().unwrap().holder_id, "b");
    }

    #[test]
    fn locks_are_per_cluster() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.insert_lock_if_vacant(&lock("c1", "a", 100, 60), 100).unwrap());
        assert!(store.insert_lock_if_vacant(&lock("c2", "b", 100, 60), 100).unwrap());
    }

    #[test]
    fn lock_delete_requires_holder() {
        let store = StateStore::open_in_memory().unwrap();
        store.insert_lock_if_vacant(&lock("c", "a", 100, 60), 100).unwrap();

        assert!(!store.delete_lock_if_holder("c", "b").unwrap());
        assert!(store.get_lock("c").unwrap().is_some());

        assert!(store.delete_lock_if_holder("c", "a").unwrap());
        assert!(store.get_lock("c").unwrap().is_none());
        assert!(!store.delete_lock_if_holder("c", "a").unwrap());
    }

    // ── Cluster state ──────────────────────────────────────────────

    #[test]
    fn state_first_write_expects_version_zero() {
        let store = StateStore::open_in_memory().unwrap();
        let mut state = ClusterState::initial("c", 2);
        state.version = 1;

        assert!(!store.put_cluster_state_if_version(&state, 5).unwrap());
        assert!(store.put_cluster_state_if_version(&state, 0).unwrap());
        assert_eq!(store.get_cluster_state("c").unwrap(), Some(state));
    }

    #[test]
    fn state_write_with_stale_version_is_rejected() {
        let store = StateStore::open_in_memory().unwrap();
        let mut state = ClusterState::initial("c", 2);
        state.version = 1;
        store.put_cluster_state_if_version(&state, 0).unwrap();

        let mut next = state.clone();
        next.node_count = 3;
        next.version = 2;
        assert!(store.put_cluster_state_if_version(&next, 1).unwrap());

        // A writer still holding version 1 loses.
        let mut stale = state.clone();
        stale.node_count = 9;
        stale.version = 2;
        assert!(!store.put_cluster_state_if_version(&stale, 1).unwrap());
        assert_eq!(store.get_cluster_state("c").unwrap().unwrap().node_count, 3);
    }

    // ── Snapshots ──────────────────────────────────────────────────

    #[test]
    fn snapshots_listed_in_time_order_since() {
        let store = StateStore::open_in_memory().unwrap();
        for ts in [1120u64, 1000, 1060, 999] {
            store
                .put_snapshot(&MetricSnapshot::new("c", ts, 50.0, 0))
                .unwrap();
        }
        store
            .put_snapshot(&MetricSnapshot::new("other", 1100, 10.0, 0))
            .unwrap();

        let since = store.list_snapshots_since("c", 1000).unwrap();
        let stamps: Vec<u64> = since.iter().map(|s| s.timestamp).collect();
        assert_eq!(stamps, vec![1000, 1060, 1120]);
    }

    #[test]
    fn prefix_sharing_cluster_ids_do_not_mix() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_snapshot(&MetricSnapshot::new("a", 10, 1.0, 0)).unwrap();
        store.put_snapshot(&MetricSnapshot::new("a:b", 20, 2.0, 0)).unwrap();

        let a = store.list_snapshots_since("a", 0).unwrap();
        assert_eq!(a.len(), 1);
        assert_eq!(a[0].cluster_id, "a");
    }

    #[test]
    fn prune_removes_only_older_snapshots() {
        let store = StateStore::open_in_memory().unwrap();
        for ts in [100u64, 200, 300] {
            store.put_snapshot(&MetricSnapshot::new("c", ts, 5.0, 0)).unwrap();
        }
        assert_eq!(store.prune_snapshots_before("c", 250).unwrap(), 2);
        let left = store.list_snapshots_since("c", 0).unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].timestamp, 300);
    }

    // ── Persistence (on-disk) ──────────────────────────────────────

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("fleet.redb");

        {
            let store = StateStore::open(&db_path).unwrap();
            let mut state = ClusterState::initial("prod", 4);
            state.version = 1;
            store.put_cluster_state_if_version(&state, 0).unwrap();
            store
                .insert_lock_if_vacant(&lock("prod", "crashed", 100, 600), 100)
                .unwrap();
        }

        // Reopen the same database file: state and the orphaned lock survive.
        let store = StateStore::open(&db_path).unwrap();
        assert_eq!(store.get_cluster_state("prod").unwrap().unwrap().node_count, 4);
        assert_eq!(store.get_lock("prod").unwrap().unwrap().holder_id, "crashed");
    }

    #[test]
    fn empty_store_operations() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.get_lock("any").unwrap().is_none());
        assert!(store.get_cluster_state("any").unwrap().is_none());
        assert!(store.list_snapshots_since("any", 0).unwrap().is_empty());
        assert_eq!(store.prune_snapshots_before("any", u64::MAX).unwrap(), 0);
    }
}
