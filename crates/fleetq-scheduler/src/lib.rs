//! fleetq-scheduler: priority-ordered admission of deployments onto
//! per-cluster RAM / CPU / GPU pools.
//!
//! A [`Scheduler`] walks the [`DeploymentQueue`] in priority order and
//! admits each entry whose cluster's [`ResourcePool`] can hold it. When a
//! higher-priority request does not fit, lower-priority running
//! deployments on the same cluster are evicted, and the evictions plus the
//! admission commit as one unit or not at all.

mod cluster;
pub mod config;
pub mod error;
pub mod events;
pub mod pool;
mod preempt;
pub mod queue;
pub mod scheduler;
mod uow;
pub mod validate;

pub use config::{DeploymentLimits, SchedulerConfig};
pub use error::{SchedulerError, SchedulerResult};
pub use events::{RejectReason, SchedulerEvent};
pub use pool::{ClusterUtilization, ResourcePool, ResourceUsage};
pub use queue::{DeploymentQueue, QueueCursor};
pub use scheduler::{Admission, CancelOutcome, Correction, PassReport, QueuePosition, Scheduler};
pub use validate::{ClusterSpec, DeploymentRequest, validate_priority};
