//! redb table definitions for the Convoy object store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// Service instances (proposals) keyed by `{service}/{instance}`.
pub const INSTANCES: TableDefinition<&str, &[u8]> = TableDefinition::new("instances");

/// Nodes keyed by node name.
pub const NODES: TableDefinition<&str, &[u8]> = TableDefinition::new("nodes");

/// Roles keyed by role name.
pub const ROLES: TableDefinition<&str, &[u8]> = TableDefinition::new("roles");

/// Singleton rows; the proposal queue lives under [`QUEUE_KEY`].
pub const META: TableDefinition<&str, &[u8]> = TableDefinition::new("meta");

pub const QUEUE_KEY: &str = "proposal_queue";
