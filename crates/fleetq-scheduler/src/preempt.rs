//! Preemption: evict lower-priority running deployments to admit a
//! higher-priority pending one on the same cluster.
//!
//! All evictions and the final admission are staged in the caller's
//! [`UnitOfWork`]. On any error the caller rolls the unit back, so a
//! partial eviction set is never committed.

use fleetq_state::{DeploymentId, DeploymentStatus, Resources};
use tracing::debug;

use crate::cluster::ClusterState;
use crate::error::{SchedulerError, SchedulerResult};
use crate::uow::UnitOfWork;

/// True if any running deployment on the cluster ranks strictly below `priority`.
pub(crate) fn has_lower_priority_running(state: &ClusterState, priority: u8) -> bool {
    state.running().any(|d| d.priority < priority)
}

/// Eviction order: lowest priority first, then most recently started,
/// then id for determinism.
pub(crate) fn candidates(state: &ClusterState, priority: u8) -> Vec<DeploymentId> {
    let mut victims: Vec<_> = state.running().filter(|d| d.priority < priority).collect();
    victims.sort_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then_with(|| b.started_at.cmp(&a.started_at))
            .then_with(|| a.id.cmp(&b.id))
    });
    victims.into_iter().map(|d| d.id.clone()).collect()
}

/// Evict candidates until the target's deficit is covered, then admit it.
///
/// Returns the evicted deployment ids in eviction order.
pub(crate) fn run(
    state: &mut ClusterState,
    uow: &mut UnitOfWork,
    target_id: &str,
    now: u64,
) -> SchedulerResult<Vec<DeploymentId>> {
    let (priority, request) = state
        .deployments
        .get(target_id)
        .map(|d| (d.priority, d.resources))
        .ok_or_else(|| SchedulerError::DeploymentNotFound(target_id.to_string()))?;

    let deficit = state.pool.deficit(&request);
    let mut freed = Resources::ZERO;
    let mut evicted = Vec::new();

    for victim in candidates(state, priority) {
        if freed.covers(&deficit) {
            break;
        }
        let credited = uow.retire(state, &victim, DeploymentStatus::Cancelled, now)?;
        debug!(cluster = %state.id, %victim, beneficiary = %target_id, %credited, "staged eviction");
        freed += credited;
        evicted.push(victim);
    }

    if !freed.covers(&deficit) {
        return Err(SchedulerError::PreemptionInfeasible {
            deployment_id: target_id.to_string(),
            deficit,
            freed,
        });
    }

    uow.admit(state, target_id, now)?;
    Ok(evicted)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use fleetq_state::{Cluster, ClusterStatus, Deployment};

    use super::*;

    const GB: u64 = 1024;

    fn cluster(total_ram_gb: u64) -> ClusterState {
        let total = Resources::new(total_ram_gb * GB, 16_000, 4);
        ClusterState::from_record(Cluster {
            id: "east".into(),
            name: "East".into(),
            total,
            available: total,
            status: ClusterStatus::Active,
            created_at: 0,
            updated_at: 0,
        })
    }

    fn add(
        state: &mut ClusterState,
        id: &str,
        priority: u8,
        ram_gb: u64,
        status: DeploymentStatus,
        started_at: Option<u64>,
    ) {
        state.deployments.insert(
            id.to_string(),
            Deployment {
                id: id.to_string(),
                name: id.to_string(),
                image: "img".into(),
                cluster_id: "east".into(),
                resources: Resources::new(ram_gb * GB, 1000, 0),
                priority,
                status,
                environment: HashMap::new(),
                created_at: 0,
                started_at,
                completed_at: None,
                updated_at: 0,
            },
        );
        state.reconcile();
    }

    #[test]
    fn candidate_order() {
        let mut state = cluster(64);
        add(&mut state, "p2-old", 2, 1, DeploymentStatus::Running, Some(10));
        add(&mut state, "p1", 1, 1, DeploymentStatus::Running, Some(5));
        add(&mut state, "p2-new", 2, 1, DeploymentStatus::Running, Some(20));
        add(&mut state, "p4", 4, 1, DeploymentStatus::Running, Some(1));
        add(&mut state, "p1-pending", 1, 1, DeploymentStatus::Pending, None);

        assert_eq!(candidates(&state, 4), vec!["p1", "p2-new", "p2-old"]);
        assert!(has_lower_priority_running(&state, 2));
        assert!(!has_lower_priority_running(&state, 1));
    }

    #[test]
    fn stops_once_deficit_is_covered() {
        let mut state = cluster(16);
        add(&mut state, "a", 1, 6, DeploymentStatus::Running, Some(1));
        add(&mut state, "b", 1, 6, DeploymentStatus::Running, Some(2));
        add(&mut state, "c", 2, 4, DeploymentStatus::Running, Some(3));
        add(&mut state, "target", 5, 8, DeploymentStatus::Pending, None);

        let mut uow = UnitOfWork::new();
        let evicted = run(&mut state, &mut uow, "target", 100).unwrap();

        // b started after a so it goes first; 6GB alone leaves the 8GB deficit uncovered.
        assert_eq!(evicted, vec!["b", "a"]);
        assert_eq!(state.deployments["c"].status, DeploymentStatus::Running);
        assert_eq!(state.deployments["target"].status, DeploymentStatus::Running);
        assert_eq!(state.pool.available().ram_mb, 4 * GB);

        uow.rollback(&mut state);
        assert_eq!(state.deployments["a"].status, DeploymentStatus::Running);
        assert_eq!(state.deployments["target"].status, DeploymentStatus::Pending);
        assert_eq!(state.pool.available().ram_mb, 0);
    }

    #[test]
    fn infeasible_when_candidates_run_out() {
        let mut state = cluster(16);
        add(&mut state, "a", 1, 16, DeploymentStatus::Running, Some(1));
        add(&mut state, "target", 5, 20, DeploymentStatus::Pending, None);

        let mut uow = UnitOfWork::new();
        let err = run(&mut state, &mut uow, "target", 100).unwrap_err();
        uow.rollback(&mut state);

        assert!(matches!(err, SchedulerError::PreemptionInfeasible { .. }));
        assert_eq!(state.deployments["a"].status, DeploymentStatus::Running);
        assert_eq!(state.deployments["target"].status, DeploymentStatus::Pending);
        assert_eq!(state.pool.available().ram_mb, 0);
    }
}
