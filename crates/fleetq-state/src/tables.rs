//! redb table definitions for the fleetq state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// Clusters keyed by `{cluster_id}`.
pub const CLUSTERS: TableDefinition<&str, &[u8]> = TableDefinition::new("clusters");

/// Deployments keyed by `{deployment_id}`.
pub const DEPLOYMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("deployments");

/// Queue entries keyed by `{deployment_id}` (at most one per deployment).
pub const QUEUE: TableDefinition<&str, &[u8]> = TableDefinition::new("queue");

/// Monotonic counters keyed by sequence name.
pub const META: TableDefinition<&str, u64> = TableDefinition::new("meta");
