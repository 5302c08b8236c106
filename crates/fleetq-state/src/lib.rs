//! fleetq-state: durable records for the fleetq scheduler.
//!
//! Backed by [redb](https://docs.rs/redb), stores clusters, deployments,
//! and queue entries. The scheduler treats this crate as its persistence
//! collaborator: every admission, preemption, or cancellation is written
//! as a single [`WriteBatch`] and committed in one redb write transaction,
//! so either all of its records land or none do.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns
//! keyed by their string identifiers. The [`StateStore`] is `Clone` +
//! `Send` + `Sync` (backed by `Arc<Database>`) and can be shared across
//! async tasks. The [`Persistence`] trait is the seam the scheduler
//! consumes, so tests can substitute a store that fails on demand.

pub mod batch;
pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use batch::{WriteBatch, WriteOp};
pub use error::{StateError, StateResult};
pub use store::{Persistence, StateStore};
pub use types::*;
