//! StateStore: redb-backed persistence for fleetq.
//!
//! Provides typed reads over clusters, deployments, and queue entries, and
//! a single write path: [`Persistence::commit`] applies a [`WriteBatch`] in
//! one redb write transaction. The store supports both on-disk and
//! in-memory backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::batch::{WriteBatch, WriteOp};
use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// The durable-storage collaborator consumed by the scheduler.
///
/// Implementations must apply a committed batch atomically: after `commit`
/// returns an error, none of the batch's operations may be visible.
pub trait Persistence: Send + Sync {
    fn load_clusters(&self) -> StateResult<Vec<Cluster>>;

    fn load_deployments(&self) -> StateResult<Vec<Deployment>>;

    fn load_queue(&self) -> StateResult<Vec<QueueEntry>>;

    /// Return the next value of a named monotonic counter (starting at 1).
    fn next_sequence(&self, name: &str) -> StateResult<u64>;

    fn commit(&self, batch: &WriteBatch) -> StateResult<()>;
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

    /// Create an ephemeral in-memory state store (for testing).
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
        txn.open_table(CLUSTERS).map_err(map_err!(Table))?;
        txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
        txn.open_table(QUEUE).map_err(map_err!(Table))?;
        txn.open_table(META).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Reads ──────────────────────────────────────────────────────

    pub fn get_cluster(&self, id: &str) -> StateResult<Option<Cluster>> {
        self.get_record(CLUSTERS, id)
    }

    pub fn list_clusters(&self) -> StateResult<Vec<Cluster>> {
        self.list_records(CLUSTERS)
    }

    pub fn get_deployment(&self, id: &str) -> StateResult<Option<Deployment>> {
        self.get_record(DEPLOYMENTS, id)
    }

    pub fn list_deployments(&self) -> StateResult<Vec<Deployment>> {
        self.list_records(DEPLOYMENTS)
    }

    pub fn get_queue_entry(&self, deployment_id: &str) -> StateResult<Option<QueueEntry>> {
        self.get_record(QUEUE, deployment_id)
    }

    pub fn list_queue(&self) -> StateResult<Vec<QueueEntry>> {
        self.list_records(QUEUE)
    }

    fn get_record<T: DeserializeOwned>(
        &self,
        def: TableDefinition<'static, &'static str, &'static [u8]>,
        key: &str,
    ) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let record: T =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    fn list_records<T: DeserializeOwned>(
        &self,
        def: TableDefinition<'static, &'static str, &'static [u8]>,
    ) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let record: T =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(record);
        }
        Ok(results)
    }
}

impl Persistence for StateStore {
    fn load_clusters(&self) -> StateResult<Vec<Cluster>> {
        self.list_clusters()
    }

    fn load_deployments(&self) -> StateResult<Vec<Deployment>> {
        self.list_deployments()
    }

    fn load_queue(&self) -> StateResult<Vec<QueueEntry>> {
        self.list_queue()
    }

    fn next_sequence(&self, name: &str) -> StateResult<u64> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let next;
        {
            let mut table = txn.open_table(META).map_err(map_err!(Table))?;
            let current = table
                .get(name)
                .map_err(map_err!(Read))?
                .map(|guard| guard.value())
                .unwrap_or(0);
            next = current + 1;
            table.insert(name, next).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(next)
    }

    fn commit(&self, batch: &WriteBatch) -> StateResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut clusters = txn.open_table(CLUSTERS).map_err(map_err!(Table))?;
            let mut deployments = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
            let mut queue = txn.open_table(QUEUE).map_err(map_err!(Table))?;

            for op in batch.ops() {
                match op {
                    WriteOp::PutCluster(c) => {
                        let value = serde_json::to_vec(c).map_err(map_err!(Serialize))?;
                        clusters
                            .insert(c.id.as_str(), value.as_slice())
                            .map_err(map_err!(Write))?;
                    }
                    WriteOp::DeleteCluster(id) => {
                        clusters.remove(id.as_str()).map_err(map_err!(Write))?;
                    }
                    WriteOp::PutDeployment(d) => {
                        let value = serde_json::to_vec(d).map_err(map_err!(Serialize))?;
                        deployments
                            .insert(d.id.as_str(), value.as_slice())
                            .map_err(map_err!(Write))?;
                    }
                    WriteOp::DeleteDeployment(id) => {
                        deployments.remove(id.as_str()).map_err(map_err!(Write))?;
                    }
                    WriteOp::PutQueueEntry(e) => {
                        let value = serde_json::to_vec(e).map_err(map_err!(Serialize))?;
                        queue
                            .insert(e.deployment_id.as_str(), value.as_slice())
                            .map_err(map_err!(Write))?;
                    }
                    WriteOp::DeleteQueueEntry(id) => {
                        queue.remove(id.as_str()).map_err(map_err!(Write))?;
                    }
                }
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(ops = batch.len(), "batch committed");
        Ok(())
    }
}
