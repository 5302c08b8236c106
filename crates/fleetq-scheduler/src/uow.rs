//! Unit of work: staged mutations with a durable commit and exact undo.
//!
//! Every mutation of a cluster's pool or deployments made during one
//! admission, preemption, or cancellation goes through a `UnitOfWork`.
//! It records an undo step for each change and stages the matching record
//! writes in a [`WriteBatch`]. `commit` persists the batch; if persistence
//! fails, or the caller aborts, `rollback` replays the undo log in reverse
//! so the cluster is exactly as it was before the unit began.

use fleetq_state::{Deployment, DeploymentStatus, Persistence, Resources, WriteBatch};
use tracing::{debug, error};

use crate::cluster::ClusterState;
use crate::error::{SchedulerError, SchedulerResult};

enum Undo {
    Allocated(Resources),
    Released(Resources),
    Restore(Box<Deployment>),
}

#[must_use = "a unit of work must be committed or rolled back"]
pub(crate) struct UnitOfWork {
    batch: WriteBatch,
    undo: Vec<Undo>,
}

impl UnitOfWork {
    pub fn new() -> Self {
        Self {
            batch: WriteBatch::new(),
            undo: Vec::new(),
        }
    }

    pub fn batch_mut(&mut self) -> &mut WriteBatch {
        &mut self.batch
    }

    pub fn allocate(&mut self, state: &mut ClusterState, request: &Resources) -> SchedulerResult<()> {
        state.pool.allocate(request)?;
        self.undo.push(Undo::Allocated(*request));
        Ok(())
    }

    pub fn release(&mut self, state: &mut ClusterState, amount: &Resources) -> Resources {
        let credited = state.pool.release(amount);
        self.undo.push(Undo::Released(credited));
        credited
    }

    /// Mutate a deployment, remembering its previous value and staging the write.
    pub fn update<F>(&mut self, state: &mut ClusterState, id: &str, f: F) -> SchedulerResult<Deployment>
    where
        F: FnOnce(&mut Deployment),
    {
        let dep = state
            .deployments
            .get_mut(id)
            .ok_or_else(|| SchedulerError::DeploymentNotFound(id.to_string()))?;
        self.undo.push(Undo::Restore(Box::new(dep.clone())));
        f(dep);
        self.batch.put_deployment(dep);
        Ok(dep.clone())
    }

    /// Admission: debit the claim, mark running, and drop the queue entry.
    pub fn admit(&mut self, state: &mut ClusterState, id: &str, now: u64) -> SchedulerResult<()> {
        let (status, resources) = state
            .deployments
            .get(id)
            .map(|d| (d.status, d.resources))
            .ok_or_else(|| SchedulerError::DeploymentNotFound(id.to_string()))?;
        if status != DeploymentStatus::Pending {
            return Err(SchedulerError::NotPending {
                id: id.to_string(),
                status,
            });
        }
        self.allocate(state, &resources)?;
        self.update(state, id, |d| {
            d.status = DeploymentStatus::Running;
            d.started_at = Some(now);
            d.updated_at = now;
        })?;
        self.batch.delete_queue_entry(id);
        Ok(())
    }

    /// Move a running deployment to a terminal status and credit its claim.
    ///
    /// Returns the amount actually credited to the pool.
    pub fn retire(
        &mut self,
        state: &mut ClusterState,
        id: &str,
        status: DeploymentStatus,
        now: u64,
    ) -> SchedulerResult<Resources> {
        let (current, resources) = state
            .deployments
            .get(id)
            .map(|d| (d.status, d.resources))
            .ok_or_else(|| SchedulerError::DeploymentNotFound(id.to_string()))?;
        if current != DeploymentStatus::Running {
            return Err(SchedulerError::NotRunning {
                id: id.to_string(),
                status: current,
            });
        }
        let credited = self.release(state, &resources);
        self.update(state, id, |d| {
            d.status = status;
            d.completed_at = Some(now);
            d.updated_at = now;
        })?;
        Ok(credited)
    }

    /// Persist the staged writes together with the cluster record.
    ///
    /// On failure the in-memory changes are reverted before returning.
    pub fn commit(mut self, store: &dyn Persistence, state: &mut ClusterState) -> SchedulerResult<()> {
        self.batch.put_cluster(&state.record());
        match store.commit(&self.batch) {
            Ok(()) => {
                debug!(cluster = %state.id, ops = self.batch.len(), "unit of work committed");
                Ok(())
            }
            Err(e) => {
                error!(cluster = %state.id, error = %e, "commit failed, rolling back");
                self.rollback(state);
                Err(SchedulerError::Persistence(e))
            }
        }
    }

    /// Revert every in-memory change, newest first.
    pub fn rollback(self, state: &mut ClusterState) {
        let steps = self.undo.len();
        for step in self.undo.into_iter().rev() {
            match step {
                Undo::Allocated(r) => state.pool.undo_allocate(&r),
                Undo::Released(r) => state.pool.undo_release(&r),
                Undo::Restore(dep) => {
                    state.deployments.insert(dep.id.clone(), *dep);
                }
            }
        }
        debug!(cluster = %state.id, steps, "unit of work rolled back");
    }
}
