//! StateStore — redb-backed object store for Convoy.
//!
//! Provides typed CRUD operations over service instances, nodes, roles and
//! the proposal queue snapshot. All values are JSON-serialized into redb's
//! `&[u8]` value columns. The store supports both on-disk and in-memory
//! backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type Table = TableDefinition<'static, &'static str, &'static [u8]>;

/// Thread-safe object store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent store at the given path.
    ///
    /// Fails with [`StateError::Busy`] while another process has it open.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(|e| match e {
            redb::DatabaseError::DatabaseAlreadyOpen => StateError::Busy,
            other => StateError::Open(other.to_string()),
        })?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
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
        txn.open_table(INSTANCES).map_err(map_err!(Table))?;
        txn.open_table(NODES).map_err(map_err!(Table))?;
        txn.open_table(ROLES).map_err(map_err!(Table))?;
        txn.open_table(META).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic row access ─────────────────────────────────────────

    fn put_row<T: Serialize>(&self, table: Table, key: &str, value: &T) -> StateResult<()> {
        let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            t.insert(key, bytes.as_slice()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get_row<T: DeserializeOwned>(&self, table: Table, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        match t.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value: T =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn list_rows<T: DeserializeOwned>(&self, table: Table, prefix: &str) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in t.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(prefix) {
                let row: T =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(row);
            }
        }
        Ok(results)
    }

    fn delete_row(&self, table: Table, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            existed = t.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    // ── Service instances ──────────────────────────────────────────

    /// Insert or update a service instance.
    pub fn put_instance(&self, instance: &ServiceInstance) -> StateResult<()> {
        let key = instance.table_key();
        self.put_row(INSTANCES, &key, instance)?;
        debug!(%key, "instance stored");
        Ok(())
    }

    pub fn get_instance(
        &self,
        service: &str,
        instance: &str,
    ) -> StateResult<Option<ServiceInstance>> {
        self.get_row(INSTANCES, &instance_key(service, instance))
    }

    /// List every instance of a service.
    pub fn list_instances(&self, service: &str) -> StateResult<Vec<ServiceInstance>> {
        self.list_rows(INSTANCES, &format!("{service}/"))
    }

    /// Delete an instance. Returns true if it existed.
    pub fn delete_instance(&self, service: &str, instance: &str) -> StateResult<bool> {
        let key = instance_key(service, instance);
        let existed = self.delete_row(INSTANCES, &key)?;
        debug!(%key, existed, "instance deleted");
        Ok(existed)
    }

    // ── Nodes ──────────────────────────────────────────────────────

    pub fn put_node(&self, node: &Node) -> StateResult<()> {
        self.put_row(NODES, &node.name, node)
    }

    pub fn get_node(&self, name: &str) -> StateResult<Option<Node>> {
        self.get_row(NODES, name)
    }

    pub fn list_nodes(&self) -> StateResult<Vec<Node>> {
        self.list_rows(NODES, "")
    }

    // ── Roles ──────────────────────────────────────────────────────

    pub fn put_role(&self, role: &Role) -> StateResult<()> {
        self.put_row(ROLES, &role.name, role)?;
        debug!(role = %role.name, "role stored");
        Ok(())
    }

    pub fn get_role(&self, name: &str) -> StateResult<Option<Role>> {
        self.get_row(ROLES, name)
    }

    /// List roles whose name starts with `prefix`.
    pub fn list_roles(&self, prefix: &str) -> StateResult<Vec<Role>> {
        self.list_rows(ROLES, prefix)
    }

    pub fn delete_role(&self, name: &str) -> StateResult<bool> {
        let existed = self.delete_row(ROLES, name)?;
        debug!(role = %name, existed, "role deleted");
        Ok(existed)
    }

    // ── Proposal queue ─────────────────────────────────────────────

    /// The persisted queue, or `None` if it was never written.
    pub fn get_queue(&self) -> StateResult<Option<Vec<QueueEntry>>> {
        self.get_row(META, QUEUE_KEY)
    }

    pub fn put_queue(&self, queue: &[QueueEntry]) -> StateResult<()> {
        self.put_row(META, QUEUE_KEY, &queue)?;
        debug!(entries = queue.len(), "proposal queue stored");
        Ok(())
    }
}
