//! Domain types for the fleetq state store.
//!
//! These types represent the persisted state of clusters, deployments,
//! and queue entries. All types are serializable to/from JSON for storage
//! in redb tables.

use std::collections::HashMap;
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign};

use serde::{Deserialize, Serialize};

/// Unique identifier for a cluster.
pub type ClusterId = String;

/// Unique identifier for a deployment.
pub type DeploymentId = String;

/// Lowest admissible priority.
pub const MIN_PRIORITY: u8 = 1;

/// Highest admissible priority.
pub const MAX_PRIORITY: u8 = 5;

// ── Resources ─────────────────────────────────────────────────────

/// A RAM / CPU / GPU quantity.
///
/// Held as integers (mebibytes, millicores, whole GPUs) so that debits and
/// credits cancel exactly and the conservation invariant is an equality.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resources {
    pub ram_mb: u64,
    pub cpu_millis: u64,
    pub gpu_count: u32,
}

impl Resources {
    pub const ZERO: Resources = Resources {
        ram_mb: 0,
        cpu_millis: 0,
        gpu_count: 0,
    };

    pub const fn new(ram_mb: u64, cpu_millis: u64, gpu_count: u32) -> Self {
        Self {
            ram_mb,
            cpu_millis,
            gpu_count,
        }
    }

    /// Build from human units: GB of RAM and (fractional) CPU cores.
    ///
    /// Negative or non-finite inputs collapse to zero; validation of the
    /// original request happens before conversion.
    pub fn from_units(ram_gb: f64, cpu_cores: f64, gpu_count: u32) -> Self {
        Self {
            ram_mb: to_fixed(ram_gb, 1024.0),
            cpu_millis: to_fixed(cpu_cores, 1000.0),
            gpu_count,
        }
    }

    pub fn ram_gb(&self) -> f64 {
        self.ram_mb as f64 / 1024.0
    }

    pub fn cpu_cores(&self) -> f64 {
        self.cpu_millis as f64 / 1000.0
    }

    /// True iff every dimension of `self` is ≤ the same dimension of `other`.
    pub fn fits_within(&self, other: &Resources) -> bool {
        self.ram_mb <= other.ram_mb
            && self.cpu_millis <= other.cpu_millis
            && self.gpu_count <= other.gpu_count
    }

    /// True iff every dimension of `self` is ≥ the same dimension of `other`.
    pub fn covers(&self, other: &Resources) -> bool {
        other.fits_within(self)
    }

    /// Per-dimension subtraction clamped at zero.
    pub fn saturating_sub(&self, other: &Resources) -> Resources {
        Resources {
            ram_mb: self.ram_mb.saturating_sub(other.ram_mb),
            cpu_millis: self.cpu_millis.saturating_sub(other.cpu_millis),
            gpu_count: self.gpu_count.saturating_sub(other.gpu_count),
        }
    }

    /// Per-dimension subtraction, `None` if any dimension would underflow.
    pub fn checked_sub(&self, other: &Resources) -> Option<Resources> {
        Some(Resources {
            ram_mb: self.ram_mb.checked_sub(other.ram_mb)?,
            cpu_millis: self.cpu_millis.checked_sub(other.cpu_millis)?,
            gpu_count: self.gpu_count.checked_sub(other.gpu_count)?,
        })
    }

    /// Per-dimension minimum.
    pub fn min(&self, other: &Resources) -> Resources {
        Resources {
            ram_mb: self.ram_mb.min(other.ram_mb),
            cpu_millis: self.cpu_millis.min(other.cpu_millis),
            gpu_count: self.gpu_count.min(other.gpu_count),
        }
    }

    pub fn is_zero(&self) -> bool {
        *self == Resources::ZERO
    }
}

fn to_fixed(value: f64, scale: f64) -> u64 {
    if value.is_finite() && value > 0.0 {
        (value * scale).round() as u64
    } else {
        0
    }
}

impl Add for Resources {
    type Output = Resources;

    fn add(self, rhs: Resources) -> Resources {
        Resources {
            ram_mb: self.ram_mb.saturating_add(rhs.ram_mb),
            cpu_millis: self.cpu_millis.saturating_add(rhs.cpu_millis),
            gpu_count: self.gpu_count.saturating_add(rhs.gpu_count),
        }
    }
}

impl AddAssign for Resources {
    fn add_assign(&mut self, rhs: Resources) {
        *self = *self + rhs;
    }
}

impl Sum for Resources {
    fn sum<I: Iterator<Item = Resources>>(iter: I) -> Resources {
        iter.fold(Resources::ZERO, |acc, r| acc + r)
    }
}

impl<'a> Sum<&'a Resources> for Resources {
    fn sum<I: Iterator<Item = &'a Resources>>(iter: I) -> Resources {
        iter.fold(Resources::ZERO, |acc, r| acc + *r)
    }
}

impl fmt::Display for Resources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ram={}MB cpu={}m gpu={}",
            self.ram_mb, self.cpu_millis, self.gpu_count
        )
    }
}

// ── Cluster ───────────────────────────────────────────────────────

/// A pool of compute capacity that deployments are admitted against.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Cluster {
    pub id: ClusterId,
    pub name: String,
    pub total: Resources,
    /// Capacity not claimed by running deployments.
    ///
    /// Persisted for reporting only; on load it is recomputed from the
    /// running deployments' claims.
    pub available: Resources,
    pub status: ClusterStatus,
    pub created_at: u64,
    pub updated_at: u64,
}

/// Operational state of a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterStatus {
    Active,
    Maintenance,
    Offline,
}

impl fmt::Display for ClusterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ClusterStatus::Active => "active",
            ClusterStatus::Maintenance => "maintenance",
            ClusterStatus::Offline => "offline",
        })
    }
}

impl std::str::FromStr for ClusterStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(ClusterStatus::Active),
            "maintenance" => Ok(ClusterStatus::Maintenance),
            "offline" => Ok(ClusterStatus::Offline),
            other => Err(format!("unknown cluster status: {other}")),
        }
    }
}

// ── Deployment ────────────────────────────────────────────────────

/// A compute workload requesting a fixed slice of one cluster.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Deployment {
    pub id: DeploymentId,
    pub name: String,
    /// Container image reference.
    pub image: String,
    pub cluster_id: ClusterId,
    /// The one resource claim used for admission, preemption, and release.
    pub resources: Resources,
    /// 1 (lowest) to 5 (highest).
    pub priority: u8,
    pub status: DeploymentStatus,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    /// Unix timestamp (seconds) when this deployment was submitted.
    pub created_at: u64,
    /// Set only on admission.
    pub started_at: Option<u64>,
    pub completed_at: Option<u64>,
    pub updated_at: u64,
}

/// Lifecycle status of a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Pending,
    Running,
    Stopped,
    Failed,
    Cancelled,
}

impl DeploymentStatus {
    /// Stopped, failed, and cancelled deployments never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeploymentStatus::Stopped | DeploymentStatus::Failed | DeploymentStatus::Cancelled
        )
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DeploymentStatus::Pending => "pending",
            DeploymentStatus::Running => "running",
            DeploymentStatus::Stopped => "stopped",
            DeploymentStatus::Failed => "failed",
            DeploymentStatus::Cancelled => "cancelled",
        })
    }
}

// ── Queue ─────────────────────────────────────────────────────────

/// A pending deployment's standing in the admission queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueEntry {
    pub deployment_id: DeploymentId,
    pub priority: u8,
    /// Unix timestamp (seconds) of arrival.
    pub queued_at: u64,
    /// Arrival sequence number; breaks ties between equal `queued_at`.
    pub seq: u64,
}
