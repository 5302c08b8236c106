//! Scheduler error types.

use fleetq_state::{DeploymentStatus, Resources, StateError};
use thiserror::Error;

/// Errors that can occur during scheduling operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Malformed or out-of-bound request; never enters the queue.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("deployment not found: {0}")]
    DeploymentNotFound(String),

    #[error("cluster not found: {0}")]
    ClusterNotFound(String),

    #[error("cluster already exists: {0}")]
    ClusterExists(String),

    #[error("cluster {cluster_id} is busy: {reason}")]
    ClusterBusy { cluster_id: String, reason: String },

    #[error("insufficient resources on cluster {cluster_id}: requested {requested}, available {available}")]
    InsufficientResources {
        cluster_id: String,
        requested: Resources,
        available: Resources,
    },

    #[error("cluster is not active: {0}")]
    ClusterInactive(String),

    /// The commit was rolled back; in-memory state is unchanged.
    #[error("persistence failure: {0}")]
    Persistence(#[from] StateError),

    #[error("preemption infeasible for {deployment_id}: deficit {deficit}, could free {freed}")]
    PreemptionInfeasible {
        deployment_id: String,
        deficit: Resources,
        freed: Resources,
    },

    #[error("deployment already queued: {0}")]
    DuplicateEntry(String),

    #[error("deployment {id} is {status}, not pending")]
    NotPending { id: String, status: DeploymentStatus },

    #[error("deployment {id} is {status}, not running")]
    NotRunning { id: String, status: DeploymentStatus },

    #[error("deployment {id} is already {status}")]
    Terminal { id: String, status: DeploymentStatus },

    #[error("queue is full ({0} entries)")]
    QueueFull(usize),

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_resources() {
        let err = SchedulerError::InsufficientResources {
            cluster_id: "east".into(),
            requested: Resources::new(2048, 1000, 0),
            available: Resources::new(1024, 1000, 0),
        };
        let msg = err.to_string();
        assert!(msg.contains("ram=2048MB"));
        assert!(msg.contains("east"));
    }
}
