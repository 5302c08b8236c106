//! Scheduler: admits queued deployments onto cluster resource pools.
//!
//! The `Scheduler` owns:
//! - one `ClusterState` per cluster, each behind its own `tokio::sync::Mutex`
//! - the deployment queue, ranked by priority then arrival
//! - a locator from deployment id to owning cluster
//!
//! Lock order is cluster map, then one cluster mutex, then queue, then
//! locator. A cluster mutex is held for exactly one admission, preemption,
//! cancellation or cluster update, never for a whole pass.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::sync::{Mutex, Notify, RwLock, broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use fleetq_state::*;

use crate::cluster::ClusterState;
use crate::config::SchedulerConfig;
use crate::error::{SchedulerError, SchedulerResult};
use crate::events::{EventBus, RejectReason, SchedulerEvent};
use crate::pool::ClusterUtilization;
use crate::preempt;
use crate::queue::{DeploymentQueue, QueueCursor};
use crate::uow::UnitOfWork;
use crate::validate::{ClusterSpec, DeploymentRequest, validate_cluster, validate_priority, validate_request};

/// Sequence counter that numbers deployments and breaks queue ties.
const DEPLOYMENT_SEQ: &str = "deployments";

type SharedCluster = Arc<Mutex<ClusterState>>;

/// Result of one successful admission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Admission {
    pub deployment_id: DeploymentId,
    pub cluster_id: ClusterId,
    /// Deployments cancelled to make room, in eviction order.
    pub preempted: Vec<DeploymentId>,
}

/// Summary of one scheduling pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassReport {
    pub admitted: Vec<DeploymentId>,
    pub preempted: Vec<DeploymentId>,
    /// Entries that did not fit and could not preempt.
    pub deferred: usize,
    pub skipped_inactive: usize,
    /// Entries skipped because their cluster hit the per-pass cap.
    pub capped: usize,
    /// Entries whose commit failed and was rolled back.
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueuePosition {
    pub deployment_id: DeploymentId,
    pub cluster_id: ClusterId,
    pub priority: u8,
    pub queued_at: u64,
    pub rank: usize,
    /// Heuristic only: `now + eta_step * (rank - 1)`.
    pub estimated_start: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CancelOutcome {
    /// Was pending; its queue entry is gone.
    Dequeued,
    /// Was running; its claim went back to the pool.
    Stopped { released: Resources },
    /// Already terminal, nothing changed.
    AlreadyTerminal { status: DeploymentStatus },
}

/// Counter correction made by [`Scheduler::reconcile`] or at load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Correction {
    pub cluster_id: ClusterId,
    pub previous: Resources,
    pub available: Resources,
}

pub struct Scheduler {
    /// Validated scheduler configuration.
    config: SchedulerConfig,
    /// Durable state; every mutation is committed here before it is applied in memory.
    store: Arc<dyn Persistence>,
    /// Per-cluster state, each behind its own critical section.
    clusters: RwLock<HashMap<ClusterId, SharedCluster>>,
    /// Owning cluster of every known deployment.
    locator: RwLock<HashMap<DeploymentId, ClusterId>>,
    /// Pending deployments in ranking order.
    queue: RwLock<DeploymentQueue>,
    /// Broadcast channel for scheduler events.
    events: EventBus,
    /// Wakes the control loop; pending wake-ups coalesce.
    wake: Notify,
}

impl Scheduler {
    /// Build a scheduler from persisted state.
    ///
    /// Available counters are recomputed from running claims, and the queue
    /// is repaired so that exactly the pending deployments have an entry.
    /// Corrections are persisted in one batch before the scheduler is returned.
    pub fn load(store: Arc<dyn Persistence>, config: SchedulerConfig) -> SchedulerResult<Self> {
        config.validate()?;

        let mut clusters: HashMap<ClusterId, ClusterState> = store
            .load_clusters()?
            .into_iter()
            .map(|c| (c.id.clone(), ClusterState::from_record(c)))
            .collect();
        let mut locator = HashMap::new();
        let mut batch = WriteBatch::new();

        for dep in store.load_deployments()? {
            match clusters.get_mut(&dep.cluster_id) {
                Some(state) => {
                    locator.insert(dep.id.clone(), dep.cluster_id.clone());
                    state.deployments.insert(dep.id.clone(), dep);
                }
                None => {
                    warn!(deployment_id = %dep.id, cluster = %dep.cluster_id, "dropping deployment of unknown cluster");
                    batch.delete_deployment(&dep.id).delete_queue_entry(&dep.id);
                }
            }
        }

        for state in clusters.values_mut() {
            if let Some(previous) = state.reconcile() {
                warn!(
                    cluster = %state.id,
                    stored = %previous,
                    reconciled = %state.pool.available(),
                    "available counters disagreed with running claims"
                );
                batch.put_cluster(&state.record());
            }
        }

        let mut queue = DeploymentQueue::new();
        for mut entry in store.load_queue()? {
            let pending = locator
                .get(&entry.deployment_id)
                .and_then(|c| clusters.get(c))
                .and_then(|s| s.deployments.get(&entry.deployment_id))
                .filter(|d| d.status == DeploymentStatus::Pending);
            let Some(dep) = pending else {
                warn!(deployment_id = %entry.deployment_id, "dropping queue entry of non-pending deployment");
                batch.delete_queue_entry(&entry.deployment_id);
                continue;
            };
            if entry.priority != dep.priority {
                entry.priority = dep.priority;
                batch.put_queue_entry(&entry);
            }
            queue.enqueue(entry)?;
        }

        let mut orphans: Vec<&Deployment> = clusters
            .values()
            .flat_map(|s| s.deployments.values())
            .filter(|d| d.status == DeploymentStatus::Pending && !queue.contains(&d.id))
            .collect();
        orphans.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        for dep in orphans {
            let entry = QueueEntry {
                deployment_id: dep.id.clone(),
                priority: dep.priority,
                queued_at: dep.created_at,
                seq: store.next_sequence(DEPLOYMENT_SEQ)?,
            };
            warn!(deployment_id = %dep.id, "re-queueing pending deployment without an entry");
            batch.put_queue_entry(&entry);
            queue.enqueue(entry)?;
        }

        if !batch.is_empty() {
            store.commit(&batch)?;
        }
        info!(
            clusters = clusters.len(),
            deployments = locator.len(),
            queued = queue.len(),
            corrections = batch.len(),
            "scheduler state loaded"
        );

        Ok(Self {
            config,
            store,
            clusters: RwLock::new(
                clusters
                    .into_iter()
                    .map(|(id, state)| (id, Arc::new(Mutex::new(state))))
                    .collect(),
            ),
            locator: RwLock::new(locator),
            queue: RwLock::new(queue),
            events: EventBus::new(),
            wake: Notify::new(),
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.events.subscribe()
    }

    /// Ask the control loop for a pass without waiting for it.
    ///
    /// Requests made while a pass is already pending coalesce into one.
    pub fn request_pass(&self) {
        self.wake.notify_one();
    }

    /// Spawn the control loop. It runs a pass on every tick and on every
    /// [`request_pass`](Self::request_pass), until `shutdown` changes.
    pub fn start(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(scheduler.config.tick_interval());
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_secs = scheduler.config.tick_interval_secs, "scheduler started");

            loop {
                tokio::select! {
                    _ = tick.tick() => {}
                    _ = scheduler.wake.notified() => {}
                    _ = shutdown.changed() => {
                        info!("scheduler shutting down");
                        break;
                    }
                }
                scheduler.run_scheduling_pass().await;
            }
        })
    }

    // ── Submission ─────────────────────────────────────────────

    /// Validate a request and persist it as a pending deployment with its
    /// queue entry. Admission happens on a later pass.
    pub async fn submit(&self, request: DeploymentRequest) -> SchedulerResult<DeploymentId> {
        let valid = validate_request(&request, &self.config)?;
        let cluster = self.cluster(&request.cluster_id).await?;
        let mut state = cluster.lock().await;

        let queued = self.queue.read().await.len();
        if queued >= self.config.max_queue_size {
            return Err(SchedulerError::QueueFull(queued));
        }
        if !valid.resources.fits_within(&state.pool.total()) {
            warn!(
                cluster = %state.id,
                requested = %valid.resources,
                total = %state.pool.total(),
                "request exceeds cluster capacity and will stay pending"
            );
        }

        let seq = self.store.next_sequence(DEPLOYMENT_SEQ)?;
        let now = epoch_secs();
        let id = format!("dep-{seq}");
        let deployment = Deployment {
            id: id.clone(),
            name: request.name,
            image: request.image,
            cluster_id: state.id.clone(),
            resources: valid.resources,
            priority: valid.priority,
            status: DeploymentStatus::Pending,
            environment: request.environment,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        };
        let entry = QueueEntry {
            deployment_id: id.clone(),
            priority: valid.priority,
            queued_at: now,
            seq,
        };

        let mut batch = WriteBatch::new();
        batch.put_deployment(&deployment).put_queue_entry(&entry);
        self.store.commit(&batch)?;

        state.deployments.insert(id.clone(), deployment);
        self.queue.write().await.enqueue(entry)?;
        self.locator.write().await.insert(id.clone(), state.id.clone());
        let cluster_id = state.id.clone();
        drop(state);

        info!(deployment_id = %id, cluster = %cluster_id, priority = valid.priority, "deployment submitted");
        self.events.publish(SchedulerEvent::Submitted {
            deployment_id: id.clone(),
            cluster_id,
            priority: valid.priority,
        });
        self.request_pass();
        Ok(id)
    }

    // ── Admission ──────────────────────────────────────────────

    /// Walk the live queue once and try to admit every entry.
    ///
    /// Entries that cannot be admitted stay queued and never block later
    /// entries. Each admission commits on its own.
    pub async fn run_scheduling_pass(&self) -> PassReport {
        let mut report = PassReport::default();
        if self.queue.read().await.is_empty() {
            return report;
        }
        let mut admitted_per_cluster: HashMap<ClusterId, u32> = HashMap::new();
        let mut cursor = QueueCursor::default();

        loop {
            let next = self.queue.read().await.next_after(&mut cursor);
            let Some(entry) = next else { break };
            let Some(cluster_id) = self.locator.read().await.get(&entry.deployment_id).cloned() else {
                continue;
            };
            let admitted = admitted_per_cluster.entry(cluster_id).or_default();

            match self.attempt(&entry.deployment_id, Some(*admitted)).await {
                Ok(admission) => {
                    *admitted += 1;
                    report.admitted.push(admission.deployment_id);
                    report.preempted.extend(admission.preempted);
                }
                Err(SchedulerError::ClusterInactive(_)) => report.skipped_inactive += 1,
                Err(SchedulerError::ClusterBusy { .. }) => report.capped += 1,
                Err(SchedulerError::InsufficientResources { .. })
                | Err(SchedulerError::PreemptionInfeasible { .. }) => report.deferred += 1,
                Err(SchedulerError::Persistence(_)) => report.failed += 1,
                Err(e) => {
                    debug!(deployment_id = %entry.deployment_id, error = %e, "queue entry no longer schedulable");
                }
            }
        }

        if !report.admitted.is_empty() || report.failed > 0 {
            info!(
                admitted = report.admitted.len(),
                preempted = report.preempted.len(),
                deferred = report.deferred,
                capped = report.capped,
                failed = report.failed,
                "scheduling pass complete"
            );
        } else {
            debug!(deferred = report.deferred, skipped_inactive = report.skipped_inactive, "scheduling pass complete");
        }
        report
    }

    /// Try to admit one pending deployment now, reporting why not if it fails.
    pub async fn schedule_one(&self, deployment_id: &str) -> SchedulerResult<Admission> {
        self.attempt(deployment_id, None).await
    }

    /// One admission attempt under the cluster's critical section.
    ///
    /// `admitted_this_pass` is the cluster's admission count in the current
    /// pass, or `None` for a manual attempt.
    async fn attempt(&self, deployment_id: &str, admitted_this_pass: Option<u32>) -> SchedulerResult<Admission> {
        let (cluster_id, cluster) = self.cluster_of(deployment_id).await?;
        let mut guard = cluster.lock().await;
        let state = &mut *guard;

        let (status, priority, request) = state
            .deployments
            .get(deployment_id)
            .map(|d| (d.status, d.priority, d.resources))
            .ok_or_else(|| SchedulerError::DeploymentNotFound(deployment_id.to_string()))?;
        if status != DeploymentStatus::Pending {
            return Err(SchedulerError::NotPending {
                id: deployment_id.to_string(),
                status,
            });
        }
        if !state.is_active() {
            return Err(SchedulerError::ClusterInactive(cluster_id));
        }
        let cap = self.config.max_concurrent_per_cluster;
        if admitted_this_pass.is_some_and(|n| n >= cap) {
            return Err(SchedulerError::ClusterBusy {
                cluster_id,
                reason: format!("admitted {cap} deployments this pass"),
            });
        }

        let now = epoch_secs();
        let mut uow = UnitOfWork::new();
        let staged = if state.pool.can_accommodate(&request) {
            uow.admit(state, deployment_id, now).map(|()| Vec::new())
        } else if self.config.preemption_enabled && preempt::has_lower_priority_running(state, priority) {
            preempt::run(state, &mut uow, deployment_id, now)
        } else {
            Err(SchedulerError::InsufficientResources {
                cluster_id: cluster_id.clone(),
                requested: request,
                available: state.pool.available(),
            })
        };

        let preempted = match staged {
            Ok(preempted) => preempted,
            Err(e) => {
                uow.rollback(state);
                self.reject(&cluster_id, deployment_id, &e);
                return Err(e);
            }
        };
        if let Err(e) = uow.commit(self.store.as_ref(), state) {
            self.reject(&cluster_id, deployment_id, &e);
            return Err(e);
        }
        self.queue.write().await.remove(deployment_id);
        drop(guard);

        for victim in &preempted {
            info!(%victim, beneficiary = %deployment_id, cluster = %cluster_id, "deployment preempted");
            self.events.publish(SchedulerEvent::Preempted {
                victim: victim.clone(),
                beneficiary: deployment_id.to_string(),
                cluster_id: cluster_id.clone(),
            });
        }
        info!(%deployment_id, cluster = %cluster_id, priority, evicted = preempted.len(), "deployment admitted");
        self.events.publish(SchedulerEvent::Admitted {
            deployment_id: deployment_id.to_string(),
            cluster_id: cluster_id.clone(),
            preempted: preempted.clone(),
        });

        Ok(Admission {
            deployment_id: deployment_id.to_string(),
            cluster_id,
            preempted,
        })
    }

    fn reject(&self, cluster_id: &str, deployment_id: &str, err: &SchedulerError) {
        let reason = match err {
            SchedulerError::InsufficientResources { .. } => RejectReason::InsufficientResources,
            SchedulerError::PreemptionInfeasible { .. } => RejectReason::PreemptionInfeasible,
            SchedulerError::Persistence(_) => RejectReason::PersistenceFailure,
            _ => return,
        };
        debug!(%deployment_id, cluster = %cluster_id, error = %err, "admission deferred");
        self.events.publish(SchedulerEvent::Rejected {
            deployment_id: deployment_id.to_string(),
            cluster_id: cluster_id.to_string(),
            reason,
        });
    }

    // ── Deployment lifecycle ───────────────────────────────────

    /// Change a deployment's priority and trigger a pass.
    ///
    /// A queued deployment keeps its arrival standing among its new peers.
    pub async fn notify_priority_change(&self, deployment_id: &str, priority: u8) -> SchedulerResult<Deployment> {
        validate_priority(priority)?;
        let (_, cluster) = self.cluster_of(deployment_id).await?;
        let mut state = cluster.lock().await;
        let current = state
            .deployments
            .get(deployment_id)
            .cloned()
            .ok_or_else(|| SchedulerError::DeploymentNotFound(deployment_id.to_string()))?;
        if current.status.is_terminal() {
            return Err(SchedulerError::Terminal {
                id: deployment_id.to_string(),
                status: current.status,
            });
        }
        if current.priority == priority {
            return Ok(current);
        }

        let mut updated = current.clone();
        updated.priority = priority;
        updated.updated_at = epoch_secs();

        let mut batch = WriteBatch::new();
        batch.put_deployment(&updated);
        // A cluster's queue entries only change under its mutex, which is held here.
        let queued = self.queue.read().await.get(deployment_id).cloned();
        let requeued = queued.map(|mut entry| {
            entry.priority = priority;
            entry
        });
        if let Some(entry) = &requeued {
            batch.put_queue_entry(entry);
        }
        self.store.commit(&batch)?;

        state.deployments.insert(deployment_id.to_string(), updated.clone());
        if requeued.is_some() {
            self.queue.write().await.reprioritize(deployment_id, priority);
        }
        drop(state);

        info!(%deployment_id, from = current.priority, to = priority, "priority changed");
        self.request_pass();
        Ok(updated)
    }

    /// Cancel a deployment. Cancelling a terminal deployment is a no-op.
    pub async fn cancel(&self, deployment_id: &str) -> SchedulerResult<CancelOutcome> {
        let (cluster_id, cluster) = self.cluster_of(deployment_id).await?;
        let mut guard = cluster.lock().await;
        let state = &mut *guard;
        let status = state
            .deployments
            .get(deployment_id)
            .map(|d| d.status)
            .ok_or_else(|| SchedulerError::DeploymentNotFound(deployment_id.to_string()))?;
        let now = epoch_secs();

        let outcome = match status {
            s if s.is_terminal() => {
                debug!(%deployment_id, status = %s, "cancel of terminal deployment ignored");
                return Ok(CancelOutcome::AlreadyTerminal { status: s });
            }
            DeploymentStatus::Running => {
                let mut uow = UnitOfWork::new();
                let released = match uow.retire(state, deployment_id, DeploymentStatus::Cancelled, now) {
                    Ok(released) => released,
                    Err(e) => {
                        uow.rollback(state);
                        return Err(e);
                    }
                };
                uow.commit(self.store.as_ref(), state)?;
                CancelOutcome::Stopped { released }
            }
            _ => {
                let mut uow = UnitOfWork::new();
                let staged = uow.update(state, deployment_id, |d| {
                    d.status = DeploymentStatus::Cancelled;
                    d.completed_at = Some(now);
                    d.updated_at = now;
                });
                if let Err(e) = staged {
                    uow.rollback(state);
                    return Err(e);
                }
                uow.batch_mut().delete_queue_entry(deployment_id);
                uow.commit(self.store.as_ref(), state)?;
                self.queue.write().await.remove(deployment_id);
                CancelOutcome::Dequeued
            }
        };
        drop(guard);

        let released = match outcome {
            CancelOutcome::Stopped { released } => released,
            _ => Resources::ZERO,
        };
        info!(%deployment_id, cluster = %cluster_id, %released, "deployment cancelled");
        self.events.publish(SchedulerEvent::Cancelled {
            deployment_id: deployment_id.to_string(),
            cluster_id,
            released,
        });
        if !released.is_zero() {
            self.request_pass();
        }
        Ok(outcome)
    }

    /// Record that a running deployment exited, releasing its claim.
    pub async fn finish(&self, deployment_id: &str, success: bool) -> SchedulerResult<Deployment> {
        let status = if success {
            DeploymentStatus::Stopped
        } else {
            DeploymentStatus::Failed
        };
        let (cluster_id, cluster) = self.cluster_of(deployment_id).await?;
        let mut guard = cluster.lock().await;
        let state = &mut *guard;

        let mut uow = UnitOfWork::new();
        if let Err(e) = uow.retire(state, deployment_id, status, epoch_secs()) {
            uow.rollback(state);
            return Err(e);
        }
        uow.commit(self.store.as_ref(), state)?;
        let finished = state
            .deployments
            .get(deployment_id)
            .cloned()
            .ok_or_else(|| SchedulerError::DeploymentNotFound(deployment_id.to_string()))?;
        drop(guard);

        info!(%deployment_id, cluster = %cluster_id, %status, "deployment finished");
        self.events.publish(SchedulerEvent::Finished {
            deployment_id: deployment_id.to_string(),
            cluster_id,
            status,
        });
        self.request_pass();
        Ok(finished)
    }

    /// Remove a deployment record. A running deployment's claim is released
    /// and a pending one's queue entry dropped in the same commit.
    pub async fn delete(&self, deployment_id: &str) -> SchedulerResult<()> {
        let (cluster_id, cluster) = self.cluster_of(deployment_id).await?;
        let mut guard = cluster.lock().await;
        let state = &mut *guard;
        let (status, resources) = state
            .deployments
            .get(deployment_id)
            .map(|d| (d.status, d.resources))
            .ok_or_else(|| SchedulerError::DeploymentNotFound(deployment_id.to_string()))?;

        let mut uow = UnitOfWork::new();
        if status == DeploymentStatus::Running {
            uow.release(state, &resources);
        }
        uow.batch_mut()
            .delete_deployment(deployment_id)
            .delete_queue_entry(deployment_id);
        uow.commit(self.store.as_ref(), state)?;

        state.deployments.remove(deployment_id);
        self.queue.write().await.remove(deployment_id);
        self.locator.write().await.remove(deployment_id);
        drop(guard);

        info!(%deployment_id, cluster = %cluster_id, %status, "deployment deleted");
        if status == DeploymentStatus::Running {
            self.request_pass();
        }
        Ok(())
    }

    pub async fn deployment(&self, deployment_id: &str) -> SchedulerResult<Deployment> {
        let (_, cluster) = self.cluster_of(deployment_id).await?;
        let state = cluster.lock().await;
        state
            .deployments
            .get(deployment_id)
            .cloned()
            .ok_or_else(|| SchedulerError::DeploymentNotFound(deployment_id.to_string()))
    }

    /// Every deployment, oldest first.
    pub async fn list_deployments(&self) -> Vec<Deployment> {
        let clusters = self.clusters.read().await;
        let mut all = Vec::new();
        for cluster in clusters.values() {
            all.extend(cluster.lock().await.deployments.values().cloned());
        }
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        all
    }

    // ── Queue reporting ────────────────────────────────────────

    /// The live queue in ranking order.
    pub async fn queue_status(&self) -> Vec<QueuePosition> {
        let now = epoch_secs();
        let step = self.config.eta_step();
        let queue = self.queue.read().await;
        let locator = self.locator.read().await;
        queue
            .ordered_view()
            .into_iter()
            .enumerate()
            .map(|(i, entry)| QueuePosition {
                cluster_id: locator.get(&entry.deployment_id).cloned().unwrap_or_default(),
                deployment_id: entry.deployment_id,
                priority: entry.priority,
                queued_at: entry.queued_at,
                rank: i + 1,
                estimated_start: estimated_start(now, step, i),
            })
            .collect()
    }

    pub async fn queue_position(&self, deployment_id: &str) -> SchedulerResult<QueuePosition> {
        let found = {
            let queue = self.queue.read().await;
            queue
                .get(deployment_id)
                .cloned()
                .zip(queue.rank(deployment_id))
        };
        let Some((entry, rank)) = found else {
            let dep = self.deployment(deployment_id).await?;
            return Err(SchedulerError::NotPending {
                id: dep.id,
                status: dep.status,
            });
        };
        let cluster_id = self
            .locator
            .read()
            .await
            .get(deployment_id)
            .cloned()
            .unwrap_or_default();
        Ok(QueuePosition {
            deployment_id: entry.deployment_id,
            cluster_id,
            priority: entry.priority,
            queued_at: entry.queued_at,
            rank,
            estimated_start: estimated_start(epoch_secs(), self.config.eta_step(), rank - 1),
        })
    }

    // ── Clusters ───────────────────────────────────────────────

    pub async fn cluster_utilization(&self, cluster_id: &str) -> SchedulerResult<ClusterUtilization> {
        let cluster = self.cluster(cluster_id).await?;
        let state = cluster.lock().await;
        Ok(state.utilization())
    }

    /// Register a cluster with all of its capacity available.
    pub async fn add_cluster(&self, spec: ClusterSpec) -> SchedulerResult<Cluster> {
        let total = validate_cluster(&spec)?;
        let mut clusters = self.clusters.write().await;
        if clusters.contains_key(&spec.id) {
            return Err(SchedulerError::ClusterExists(spec.id));
        }
        let now = epoch_secs();
        let record = Cluster {
            id: spec.id.clone(),
            name: spec.name,
            total,
            available: total,
            status: ClusterStatus::Active,
            created_at: now,
            updated_at: now,
        };
        let mut batch = WriteBatch::new();
        batch.put_cluster(&record);
        self.store.commit(&batch)?;

        clusters.insert(
            record.id.clone(),
            Arc::new(Mutex::new(ClusterState::from_record(record.clone()))),
        );
        info!(cluster = %record.id, %total, "cluster added");
        Ok(record)
    }

    /// Change a cluster's status. Returning to active triggers a pass.
    pub async fn set_cluster_status(&self, cluster_id: &str, status: ClusterStatus) -> SchedulerResult<Cluster> {
        let cluster = self.cluster(cluster_id).await?;
        let mut state = cluster.lock().await;
        let previous = state.status;
        if previous == status {
            return Ok(state.record());
        }

        let mut record = state.record();
        record.status = status;
        record.updated_at = epoch_secs();
        let mut batch = WriteBatch::new();
        batch.put_cluster(&record);
        self.store.commit(&batch)?;
        state.status = status;
        state.updated_at = record.updated_at;
        drop(state);

        info!(cluster = %cluster_id, from = %previous, to = %status, "cluster status changed");
        if status == ClusterStatus::Active {
            self.request_pass();
        }
        Ok(record)
    }

    /// Replace a cluster's total capacity, keeping running claims.
    pub async fn resize_cluster(&self, cluster_id: &str, total: Resources) -> SchedulerResult<Cluster> {
        if total.ram_mb == 0 || total.cpu_millis == 0 {
            return Err(SchedulerError::Validation(
                "cluster ram and cpu must be greater than 0".to_string(),
            ));
        }
        let cluster = self.cluster(cluster_id).await?;
        let mut state = cluster.lock().await;
        let claims = state.running_claims();
        let previous = state.pool.clone();
        let previous_updated = state.updated_at;

        state.pool.resize(total, &claims)?;
        state.updated_at = epoch_secs();
        let mut batch = WriteBatch::new();
        batch.put_cluster(&state.record());
        if let Err(e) = self.store.commit(&batch) {
            error!(cluster = %cluster_id, error = %e, "resize commit failed");
            state.pool = previous;
            state.updated_at = previous_updated;
            return Err(e.into());
        }
        let record = state.record();
        drop(state);

        info!(cluster = %cluster_id, %total, available = %record.available, "cluster resized");
        self.request_pass();
        Ok(record)
    }

    /// Remove a cluster and every non-running deployment on it.
    pub async fn remove_cluster(&self, cluster_id: &str) -> SchedulerResult<()> {
        let mut clusters = self.clusters.write().await;
        let cluster = clusters
            .get(cluster_id)
            .cloned()
            .ok_or_else(|| SchedulerError::ClusterNotFound(cluster_id.to_string()))?;
        let state = cluster.lock().await;
        let running = state.running().count();
        if running > 0 {
            return Err(SchedulerError::ClusterBusy {
                cluster_id: cluster_id.to_string(),
                reason: format!("{running} deployments still running"),
            });
        }

        let mut batch = WriteBatch::new();
        batch.delete_cluster(cluster_id);
        for id in state.deployments.keys() {
            batch.delete_deployment(id).delete_queue_entry(id);
        }
        self.store.commit(&batch)?;

        let mut queue = self.queue.write().await;
        let mut locator = self.locator.write().await;
        for id in state.deployments.keys() {
            queue.remove(id);
            locator.remove(id);
        }
        let removed = state.deployments.len();
        drop(state);
        clusters.remove(cluster_id);

        info!(cluster = %cluster_id, deployments = removed, "cluster removed");
        Ok(())
    }

    /// All clusters, sorted by id.
    pub async fn list_clusters(&self) -> Vec<Cluster> {
        let clusters = self.clusters.read().await;
        let mut records = Vec::with_capacity(clusters.len());
        for cluster in clusters.values() {
            records.push(cluster.lock().await.record());
        }
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    /// Recompute every cluster's available counters from running claims.
    pub async fn reconcile(&self) -> SchedulerResult<Vec<Correction>> {
        let clusters: Vec<SharedCluster> = self.clusters.read().await.values().cloned().collect();
        let mut corrections = Vec::new();
        for cluster in clusters {
            let mut state = cluster.lock().await;
            let Some(previous) = state.reconcile() else {
                continue;
            };
            let mut batch = WriteBatch::new();
            batch.put_cluster(&state.record());
            self.store.commit(&batch)?;
            warn!(cluster = %state.id, stored = %previous, reconciled = %state.pool.available(), "available counters corrected");
            corrections.push(Correction {
                cluster_id: state.id.clone(),
                previous,
                available: state.pool.available(),
            });
        }
        corrections.sort_by(|a, b| a.cluster_id.cmp(&b.cluster_id));
        Ok(corrections)
    }

    // ── Internal helpers ───────────────────────────────────────

    async fn cluster(&self, cluster_id: &str) -> SchedulerResult<SharedCluster> {
        self.clusters
            .read()
            .await
            .get(cluster_id)
            .cloned()
            .ok_or_else(|| SchedulerError::ClusterNotFound(cluster_id.to_string()))
    }

    async fn cluster_of(&self, deployment_id: &str) -> SchedulerResult<(ClusterId, SharedCluster)> {
        let cluster_id = self
            .locator
            .read()
            .await
            .get(deployment_id)
            .cloned()
            .ok_or_else(|| SchedulerError::DeploymentNotFound(deployment_id.to_string()))?;
        let cluster = self.cluster(&cluster_id).await?;
        Ok((cluster_id, cluster))
    }
}

/// ETA heuristic for an entry with `ahead` entries ranked before it.
fn estimated_start(now: u64, step: Duration, ahead: usize) -> u64 {
    now.saturating_add(step.as_secs().saturating_mul(ahead as u64))
}

/// Current Unix epoch in seconds.
fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn scheduler_with(config: SchedulerConfig) -> Scheduler {
        let store = StateStore::open_in_memory().unwrap();
        Scheduler::load(Arc::new(store), config).unwrap()
    }

    fn cluster_spec(id: &str, ram_gb: f64) -> ClusterSpec {
        ClusterSpec {
            id: id.to_string(),
            name: id.to_uppercase(),
            ram_gb,
            cpu_cores: 16.0,
            gpu_count: 2,
        }
    }

    fn request(cluster: &str, ram_gb: f64, priority: u8) -> DeploymentRequest {
        DeploymentRequest {
            name: "job".to_string(),
            image: "registry.local/job:1".to_string(),
            cluster_id: cluster.to_string(),
            ram_gb,
            cpu_cores: 1.0,
            gpu_count: 0,
            priority: Some(priority),
            environment: HashMap::new(),
        }
    }

    async fn setup() -> Scheduler {
        let s = scheduler_with(SchedulerConfig::default());
        s.add_cluster(cluster_spec("east", 16.0)).await.unwrap();
        s
    }

    #[tokio::test]
    async fn submit_creates_pending_with_entry() {
        let s = setup().await;
        let id = s.submit(request("east", 4.0, 3)).await.unwrap();

        let dep = s.deployment(&id).await.unwrap();
        assert_eq!(dep.status, DeploymentStatus::Pending);
        assert_eq!(dep.started_at, None);
        let status = s.queue_status().await;
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].deployment_id, id);
        assert_eq!(status[0].cluster_id, "east");
        assert_eq!(status[0].rank, 1);
    }

    #[tokio::test]
    async fn submit_to_unknown_cluster_fails() {
        let s = setup().await;
        let err = s.submit(request("west", 4.0, 3)).await.unwrap_err();
        assert!(matches!(err, SchedulerError::ClusterNotFound(_)));
        assert!(s.queue_status().await.is_empty());
    }

    #[tokio::test]
    async fn submit_rejects_invalid_request() {
        let s = setup().await;
        let err = s.submit(request("east", 4.0, 9)).await.unwrap_err();
        assert!(matches!(err, SchedulerError::Validation(_)));
        assert!(s.list_deployments().await.is_empty());
    }

    #[tokio::test]
    async fn queue_full_is_enforced() {
        let s = scheduler_with(SchedulerConfig {
            max_queue_size: 2,
            ..SchedulerConfig::default()
        });
        s.add_cluster(cluster_spec("east", 16.0)).await.unwrap();
        s.submit(request("east", 1.0, 1)).await.unwrap();
        s.submit(request("east", 1.0, 1)).await.unwrap();
        let err = s.submit(request("east", 1.0, 1)).await.unwrap_err();
        assert!(matches!(err, SchedulerError::QueueFull(2)));
    }

    #[tokio::test]
    async fn schedule_one_admits_and_reports() {
        let s = setup().await;
        let id = s.submit(request("east", 4.0, 3)).await.unwrap();

        let admission = s.schedule_one(&id).await.unwrap();
        assert_eq!(admission.cluster_id, "east");
        assert!(admission.preempted.is_empty());
        let dep = s.deployment(&id).await.unwrap();
        assert_eq!(dep.status, DeploymentStatus::Running);
        assert!(dep.started_at.is_some());
        assert!(s.queue_status().await.is_empty());

        let err = s.schedule_one(&id).await.unwrap_err();
        assert!(matches!(err, SchedulerError::NotPending { .. }));
    }

    #[tokio::test]
    async fn schedule_one_on_inactive_cluster() {
        let s = setup().await;
        let id = s.submit(request("east", 4.0, 3)).await.unwrap();
        s.set_cluster_status("east", ClusterStatus::Maintenance).await.unwrap();

        let err = s.schedule_one(&id).await.unwrap_err();
        assert!(matches!(err, SchedulerError::ClusterInactive(_)));
        let report = s.run_scheduling_pass().await;
        assert_eq!(report.skipped_inactive, 1);
        assert_eq!(s.queue_position(&id).await.unwrap().rank, 1);

        s.set_cluster_status("east", ClusterStatus::Active).await.unwrap();
        let report = s.run_scheduling_pass().await;
        assert_eq!(report.admitted, vec![id]);
    }

    #[tokio::test]
    async fn oversized_request_is_deferred_without_blocking() {
        let s = setup().await;
        let big = s.submit(request("east", 20.0, 5)).await.unwrap();
        let small = s.submit(request("east", 2.0, 1)).await.unwrap();

        let report = s.run_scheduling_pass().await;
        assert_eq!(report.admitted, vec![small]);
        assert_eq!(report.deferred, 1);
        assert_eq!(s.deployment(&big).await.unwrap().status, DeploymentStatus::Pending);
    }

    #[tokio::test]
    async fn priority_change_reorders_queue() {
        let s = setup().await;
        let a = s.submit(request("east", 1.0, 2)).await.unwrap();
        let b = s.submit(request("east", 1.0, 2)).await.unwrap();
        assert_eq!(s.queue_position(&b).await.unwrap().rank, 2);

        let updated = s.notify_priority_change(&b, 4).await.unwrap();
        assert_eq!(updated.priority, 4);
        assert_eq!(s.queue_position(&b).await.unwrap().rank, 1);
        assert_eq!(s.queue_position(&a).await.unwrap().rank, 2);

        let err = s.notify_priority_change(&a, 0).await.unwrap_err();
        assert!(matches!(err, SchedulerError::Validation(_)));
    }

    #[tokio::test]
    async fn priority_change_on_terminal_is_rejected() {
        let s = setup().await;
        let id = s.submit(request("east", 1.0, 2)).await.unwrap();
        s.cancel(&id).await.unwrap();
        let err = s.notify_priority_change(&id, 5).await.unwrap_err();
        assert!(matches!(err, SchedulerError::Terminal { .. }));
    }

    #[tokio::test]
    async fn eta_grows_with_rank() {
        let s = setup().await;
        let a = s.submit(request("east", 1.0, 3)).await.unwrap();
        let b = s.submit(request("east", 1.0, 1)).await.unwrap();
        let first = s.queue_position(&a).await.unwrap();
        let second = s.queue_position(&b).await.unwrap();
        assert!(second.estimated_start >= first.estimated_start + s.config().eta_step_secs);
    }

    #[tokio::test]
    async fn eta_saturates_with_huge_step() {
        let s = scheduler_with(SchedulerConfig {
            eta_step_secs: i64::MAX as u64,
            ..SchedulerConfig::default()
        });
        s.add_cluster(cluster_spec("east", 16.0)).await.unwrap();
        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(s.submit(request("east", 20.0, 2)).await.unwrap());
        }

        let status = s.queue_status().await;
        assert_eq!(status.len(), 3);
        assert_eq!(status[2].estimated_start, u64::MAX);
        assert!(status[0].estimated_start < status[1].estimated_start);
        assert_eq!(s.queue_position(&ids[2]).await.unwrap().estimated_start, u64::MAX);
    }

    #[tokio::test]
    async fn add_cluster_rejects_capacity_that_rounds_to_zero() {
        let s = scheduler_with(SchedulerConfig::default());
        let err = s.add_cluster(cluster_spec("tiny", 0.0001)).await.unwrap_err();
        assert!(matches!(err, SchedulerError::Validation(_)));
        assert!(s.list_clusters().await.is_empty());
    }

    #[tokio::test]
    async fn queue_position_of_running_deployment() {
        let s = setup().await;
        let id = s.submit(request("east", 1.0, 3)).await.unwrap();
        s.schedule_one(&id).await.unwrap();
        let err = s.queue_position(&id).await.unwrap_err();
        assert!(matches!(err, SchedulerError::NotPending { .. }));
    }

    #[tokio::test]
    async fn cancel_pending_and_running() {
        let s = setup().await;
        let pending = s.submit(request("east", 20.0, 1)).await.unwrap();
        let running = s.submit(request("east", 4.0, 1)).await.unwrap();
        s.schedule_one(&running).await.unwrap();

        assert_eq!(s.cancel(&pending).await.unwrap(), CancelOutcome::Dequeued);
        assert!(s.queue_status().await.is_empty());

        let outcome = s.cancel(&running).await.unwrap();
        assert_eq!(
            outcome,
            CancelOutcome::Stopped {
                released: Resources::new(4 * 1024, 1000, 0)
            }
        );
        let util = s.cluster_utilization("east").await.unwrap();
        assert_eq!(util.ram_gb.available, 16.0);

        let again = s.cancel(&running).await.unwrap();
        assert_eq!(
            again,
            CancelOutcome::AlreadyTerminal {
                status: DeploymentStatus::Cancelled
            }
        );
        assert!(matches!(
            s.cancel("dep-404").await.unwrap_err(),
            SchedulerError::DeploymentNotFound(_)
        ));
    }

    #[tokio::test]
    async fn finish_releases_resources() {
        let s = setup().await;
        let ok = s.submit(request("east", 4.0, 1)).await.unwrap();
        let bad = s.submit(request("east", 4.0, 1)).await.unwrap();
        s.run_scheduling_pass().await;

        assert_eq!(s.finish(&ok, true).await.unwrap().status, DeploymentStatus::Stopped);
        let failed = s.finish(&bad, false).await.unwrap();
        assert_eq!(failed.status, DeploymentStatus::Failed);
        assert!(failed.completed_at.is_some());
        assert_eq!(s.cluster_utilization("east").await.unwrap().ram_gb.used, 0.0);

        let err = s.finish(&ok, true).await.unwrap_err();
        assert!(matches!(err, SchedulerError::NotRunning { .. }));
    }

    #[tokio::test]
    async fn delete_running_releases_claim() {
        let s = setup().await;
        let id = s.submit(request("east", 8.0, 1)).await.unwrap();
        let queued = s.submit(request("east", 20.0, 1)).await.unwrap();
        s.schedule_one(&id).await.unwrap();

        s.delete(&id).await.unwrap();
        s.delete(&queued).await.unwrap();
        assert!(s.list_deployments().await.is_empty());
        assert!(s.queue_status().await.is_empty());
        assert_eq!(s.cluster_utilization("east").await.unwrap().ram_gb.available, 16.0);
        assert!(matches!(
            s.deployment(&id).await.unwrap_err(),
            SchedulerError::DeploymentNotFound(_)
        ));
    }

    #[tokio::test]
    async fn cluster_lifecycle() {
        let s = setup().await;
        let err = s.add_cluster(cluster_spec("east", 8.0)).await.unwrap_err();
        assert!(matches!(err, SchedulerError::ClusterExists(_)));

        let id = s.submit(request("east", 8.0, 1)).await.unwrap();
        s.schedule_one(&id).await.unwrap();

        let err = s
            .resize_cluster("east", Resources::new(4 * 1024, 16_000, 2))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::ClusterBusy { .. }));
        let resized = s
            .resize_cluster("east", Resources::new(32 * 1024, 16_000, 2))
            .await
            .unwrap();
        assert_eq!(resized.available.ram_mb, 24 * 1024);

        let err = s.remove_cluster("east").await.unwrap_err();
        assert!(matches!(err, SchedulerError::ClusterBusy { .. }));

        s.finish(&id, true).await.unwrap();
        s.remove_cluster("east").await.unwrap();
        assert!(s.list_clusters().await.is_empty());
        assert!(s.list_deployments().await.is_empty());
    }

    #[tokio::test]
    async fn control_loop_admits_on_submit() {
        let s = Arc::new(scheduler_with(SchedulerConfig {
            tick_interval_secs: 3600,
            ..SchedulerConfig::default()
        }));
        s.add_cluster(cluster_spec("east", 16.0)).await.unwrap();
        let mut events = s.subscribe();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = s.start(shutdown_rx);

        let id = s.submit(request("east", 4.0, 3)).await.unwrap();
        let admitted = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(SchedulerEvent::Admitted { deployment_id, .. }) = events.recv().await {
                    break deployment_id;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(admitted, id);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
