//! Scheduler events for external observers.

use fleetq_state::{DeploymentId, DeploymentStatus, Resources};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

const EVENT_CAPACITY: usize = 1024;

/// Why an admission attempt did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    InsufficientResources,
    PreemptionInfeasible,
    PersistenceFailure,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SchedulerEvent {
    Submitted {
        deployment_id: DeploymentId,
        cluster_id: String,
        priority: u8,
    },
    Admitted {
        deployment_id: DeploymentId,
        cluster_id: String,
        /// Deployments evicted to make room, empty for a greedy admission.
        preempted: Vec<DeploymentId>,
    },
    Rejected {
        deployment_id: DeploymentId,
        cluster_id: String,
        reason: RejectReason,
    },
    Preempted {
        victim: DeploymentId,
        beneficiary: DeploymentId,
        cluster_id: String,
    },
    Cancelled {
        deployment_id: DeploymentId,
        cluster_id: String,
        released: Resources,
    },
    Finished {
        deployment_id: DeploymentId,
        cluster_id: String,
        status: DeploymentStatus,
    },
}

/// Fan-out of scheduler events. Publishing never blocks and never fails;
/// slow subscribers see `RecvError::Lagged`.
pub(crate) struct EventBus {
    sender: broadcast::Sender<SchedulerEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }

    pub fn publish(&self, event: SchedulerEvent) {
        debug!(?event, "scheduler event");
        // No receivers is fine.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.sender.subscribe()
    }
}
