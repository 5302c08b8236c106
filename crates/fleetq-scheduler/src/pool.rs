//! Resource pool: per-cluster RAM / CPU / GPU accounting.
//!
//! A pool is owned by its cluster's state and only touched while that
//! cluster's critical section is held. Allocation debits all three
//! dimensions together or none of them; release credits them back,
//! clamped at the pool total so a double release cannot inflate capacity.

use fleetq_state::{ClusterStatus, Resources};
use serde::Serialize;

use crate::error::{SchedulerError, SchedulerResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourcePool {
    cluster_id: String,
    total: Resources,
    available: Resources,
}

impl ResourcePool {
    pub fn new(cluster_id: impl Into<String>, total: Resources) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            total,
            available: total,
        }
    }

    /// Rebuild a pool from stored counters, clamping `available` to `total`.
    pub fn with_available(cluster_id: impl Into<String>, total: Resources, available: Resources) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            total,
            available: available.min(&total),
        }
    }

    pub fn total(&self) -> Resources {
        self.total
    }

    pub fn available(&self) -> Resources {
        self.available
    }

    pub fn used(&self) -> Resources {
        self.total.saturating_sub(&self.available)
    }

    pub fn can_accommodate(&self, request: &Resources) -> bool {
        request.fits_within(&self.available)
    }

    /// Per-dimension shortfall of `request` against what is available now.
    pub fn deficit(&self, request: &Resources) -> Resources {
        request.saturating_sub(&self.available)
    }

    pub fn allocate(&mut self, request: &Resources) -> SchedulerResult<()> {
        match self.available.checked_sub(request) {
            Some(remaining) => {
                self.available = remaining;
                Ok(())
            }
            None => Err(SchedulerError::InsufficientResources {
                cluster_id: self.cluster_id.clone(),
                requested: *request,
                available: self.available,
            }),
        }
    }

    /// Credit resources back. Returns the amount actually credited, which is
    /// less than `amount` only when the pool would otherwise exceed its total.
    pub fn release(&mut self, amount: &Resources) -> Resources {
        let before = self.available;
        self.available = (self.available + *amount).min(&self.total);
        self.available.saturating_sub(&before)
    }

    /// Reverse an earlier successful `allocate`.
    pub(crate) fn undo_allocate(&mut self, amount: &Resources) {
        self.available = (self.available + *amount).min(&self.total);
    }

    /// Reverse an earlier `release` using the amount it reported.
    pub(crate) fn undo_release(&mut self, credited: &Resources) {
        self.available = self.available.saturating_sub(credited);
    }

    /// Recompute `available` as `total - claims`.
    ///
    /// Returns the previous available counters when they disagreed.
    pub fn reconcile(&mut self, running_claims: &Resources) -> Option<Resources> {
        let expected = self.total.saturating_sub(running_claims);
        if expected == self.available {
            return None;
        }
        let previous = self.available;
        self.available = expected;
        Some(previous)
    }

    /// Replace the total, keeping existing claims. Fails if the claims no
    /// longer fit.
    pub fn resize(&mut self, total: Resources, running_claims: &Resources) -> SchedulerResult<()> {
        let available = total.checked_sub(running_claims).ok_or_else(|| SchedulerError::ClusterBusy {
            cluster_id: self.cluster_id.clone(),
            reason: format!("running deployments claim {running_claims}, above new total {total}"),
        })?;
        self.total = total;
        self.available = available;
        Ok(())
    }

    pub fn utilization(&self, status: ClusterStatus, running_deployments: usize) -> ClusterUtilization {
        let used = self.used();
        ClusterUtilization {
            cluster_id: self.cluster_id.clone(),
            status,
            ram_gb: ResourceUsage::new(self.total.ram_gb(), used.ram_gb(), self.available.ram_gb()),
            cpu_cores: ResourceUsage::new(
                self.total.cpu_cores(),
                used.cpu_cores(),
                self.available.cpu_cores(),
            ),
            gpu_count: ResourceUsage::new(
                f64::from(self.total.gpu_count),
                f64::from(used.gpu_count),
                f64::from(self.available.gpu_count),
            ),
            running_deployments,
        }
    }
}

/// Total / used / available for one resource dimension.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceUsage {
    pub total: f64,
    pub used: f64,
    pub available: f64,
    /// Percentage of `total` in use (0 when total is 0).
    pub utilization: f64,
}

impl ResourceUsage {
    fn new(total: f64, used: f64, available: f64) -> Self {
        let utilization = if total > 0.0 { used / total * 100.0 } else { 0.0 };
        Self {
            total,
            used,
            available,
            utilization,
        }
    }
}

/// Utilization report for one cluster.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterUtilization {
    pub cluster_id: String,
    pub status: ClusterStatus,
    pub ram_gb: ResourceUsage,
    pub cpu_cores: ResourceUsage,
    pub gpu_count: ResourceUsage,
    pub running_deployments: usize,
}
