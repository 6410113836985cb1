//! redb table definitions for the coordination store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// Lock records keyed by `{cluster_id}`.
pub const LOCKS: TableDefinition<&str, &[u8]> = TableDefinition::new("locks");

/// Versioned cluster state keyed by `{cluster_id}`.
pub const CLUSTERS: TableDefinition<&str, &[u8]> = TableDefinition::new("clusters");

/// Metric snapshots keyed by `{cluster_id}:{timestamp:020}` so that key
/// order is chronological within a cluster.
pub const SNAPSHOTS: TableDefinition<&str, &[u8]> = TableDefinition::new("snapshots");
