//! Deployment queue: pending admissions ranked by priority, then arrival.
//!
//! Entries are ordered by `(priority desc, queued_at asc, seq asc)`. The
//! arrival sequence number makes the order total even when two entries
//! share a timestamp.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};

use fleetq_state::{DeploymentId, QueueEntry};

use crate::error::{SchedulerError, SchedulerResult};

/// Sort key for one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct RankKey {
    priority: Reverse<u8>,
    queued_at: u64,
    seq: u64,
}

impl RankKey {
    fn of(entry: &QueueEntry) -> Self {
        Self {
            priority: Reverse(entry.priority),
            queued_at: entry.queued_at,
            seq: entry.seq,
        }
    }
}

/// Position marker for walking the live queue one entry at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueCursor(Option<RankKey>);

#[derive(Debug, Default)]
pub struct DeploymentQueue {
    order: BTreeMap<RankKey, DeploymentId>,
    entries: HashMap<DeploymentId, QueueEntry>,
}

impl DeploymentQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, entry: QueueEntry) -> SchedulerResult<()> {
        if self.entries.contains_key(&entry.deployment_id) {
            return Err(SchedulerError::DuplicateEntry(entry.deployment_id));
        }
        self.order
            .insert(RankKey::of(&entry), entry.deployment_id.clone());
        self.entries.insert(entry.deployment_id.clone(), entry);
        Ok(())
    }

    /// Remove an entry. Absent ids are a no-op.
    pub fn remove(&mut self, deployment_id: &str) -> Option<QueueEntry> {
        let entry = self.entries.remove(deployment_id)?;
        self.order.remove(&RankKey::of(&entry));
        Some(entry)
    }

    /// Change an entry's priority, keeping its arrival standing.
    pub fn reprioritize(&mut self, deployment_id: &str, priority: u8) -> Option<QueueEntry> {
        let entry = self.entries.get_mut(deployment_id)?;
        self.order.remove(&RankKey::of(entry));
        entry.priority = priority;
        self.order
            .insert(RankKey::of(entry), deployment_id.to_string());
        Some(entry.clone())
    }

    /// 1-based rank: one plus the number of entries ordered ahead.
    pub fn rank(&self, deployment_id: &str) -> Option<usize> {
        let entry = self.entries.get(deployment_id)?;
        Some(self.order.range(..RankKey::of(entry)).count() + 1)
    }

    pub fn get(&self, deployment_id: &str) -> Option<&QueueEntry> {
        self.entries.get(deployment_id)
    }

    pub fn contains(&self, deployment_id: &str) -> bool {
        self.entries.contains_key(deployment_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All entries in ranking order, as of now.
    pub fn ordered_view(&self) -> Vec<QueueEntry> {
        self.order
            .values()
            .filter_map(|id| self.entries.get(id).cloned())
            .collect()
    }

    /// The first live entry ranked after `cursor`, advancing the cursor.
    ///
    /// Entries added or re-ranked ahead of the cursor since the last call
    /// are not revisited; entries behind it are seen.
    pub fn next_after(&self, cursor: &mut QueueCursor) -> Option<QueueEntry> {
        let mut range = match cursor.0 {
            Some(key) => self
                .order
                .range((std::ops::Bound::Excluded(key), std::ops::Bound::Unbounded)),
            None => self.order.range(..),
        };
        let (key, id) = range.next()?;
        cursor.0 = Some(*key);
        self.entries.get(id).cloned()
    }
}
