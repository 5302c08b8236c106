//! In-memory state of one cluster: its pool and its deployments.
//!
//! A `ClusterState` lives behind the cluster's `tokio::sync::Mutex`; holding
//! that lock is the critical section for admission, preemption, cancellation
//! and every other mutation scoped to the cluster.

use std::collections::HashMap;

use fleetq_state::{Cluster, ClusterStatus, Deployment, DeploymentId, DeploymentStatus, Resources};

use crate::pool::{ClusterUtilization, ResourcePool};

#[derive(Debug)]
pub(crate) struct ClusterState {
    pub id: String,
    pub name: String,
    pub status: ClusterStatus,
    pub created_at: u64,
    pub updated_at: u64,
    pub pool: ResourcePool,
    pub deployments: HashMap<DeploymentId, Deployment>,
}

impl ClusterState {
    /// Build from a stored record. Available counters are taken as stored;
    /// callers reconcile them against running claims afterwards.
    pub fn from_record(cluster: Cluster) -> Self {
        Self {
            pool: ResourcePool::with_available(cluster.id.clone(), cluster.total, cluster.available),
            id: cluster.id,
            name: cluster.name,
            status: cluster.status,
            created_at: cluster.created_at,
            updated_at: cluster.updated_at,
            deployments: HashMap::new(),
        }
    }

    pub fn record(&self) -> Cluster {
        Cluster {
            id: self.id.clone(),
            name: self.name.clone(),
            total: self.pool.total(),
            available: self.pool.available(),
            status: self.status,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == ClusterStatus::Active
    }

    pub fn running(&self) -> impl Iterator<Item = &Deployment> {
        self.deployments
            .values()
            .filter(|d| d.status == DeploymentStatus::Running)
    }

    /// Sum of resources claimed by running deployments.
    pub fn running_claims(&self) -> Resources {
        self.running().map(|d| d.resources).sum()
    }

    /// Recompute available counters from running claims.
    pub fn reconcile(&mut self) -> Option<Resources> {
        let claims = self.running_claims();
        self.pool.reconcile(&claims)
    }

    pub fn utilization(&self) -> ClusterUtilization {
        self.pool.utilization(self.status, self.running().count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deployment(id: &str, status: DeploymentStatus, resources: Resources) -> Deployment {
        Deployment {
            id: id.to_string(),
            name: id.to_string(),
            image: "img".to_string(),
            cluster_id: "east".to_string(),
            resources,
            priority: 1,
            status,
            environment: HashMap::new(),
            created_at: 0,
            started_at: None,
            completed_at: None,
            updated_at: 0,
        }
    }

    #[test]
    fn record_round_trip_and_reconcile() {
        let total = Resources::new(16 * 1024, 8000, 2);
        let mut state = ClusterState::from_record(Cluster {
            id: "east".to_string(),
            name: "East".to_string(),
            total,
            available: Resources::ZERO,
            status: ClusterStatus::Active,
            created_at: 1,
            updated_at: 1,
        });
        for (id, status) in [
            ("run", DeploymentStatus::Running),
            ("pend", DeploymentStatus::Pending),
            ("done", DeploymentStatus::Stopped),
        ] {
            state
                .deployments
                .insert(id.to_string(), deployment(id, status, Resources::new(1024, 1000, 1)));
        }

        assert_eq!(state.running_claims(), Resources::new(1024, 1000, 1));
        assert_eq!(state.reconcile(), Some(Resources::ZERO));
        assert_eq!(state.record().available, Resources::new(15 * 1024, 7000, 1));
        assert_eq!(state.utilization().running_deployments, 1);
    }
}
