// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Work-Item Partitioning
//!
//! Deterministic assignment of enabled work items to the live agents of one
//! capability: an agent only attempts items whose hash lands on its slot in a
//! sorted snapshot of the live set.
//!
//! - [`owns`] — the hash rule itself.
//! - [`PartitionView`] — the sorted snapshot plus this agent's slot.
//! - [`PartitionRefresher`] — decides when the snapshot is re-read.
//!
//! The partition is *soft*. Two agents holding snapshots taken on either side
//! of a membership change may both consider an item theirs, or neither may.
//! Exclusivity comes from the engine's atomic checkout; the partition only
//! keeps agents from piling onto the same item. Gaps are closed by the orphan
//! rule in [`PartitionView::should_attempt`].

use bazaar_core::domain::agent::{AgentId, Capability};
use bazaar_core::domain::engine::{WorkItemId, WorkItemRecord};
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Stable 64-bit hash of a work item id (first eight bytes of its BLAKE3 digest).
pub fn partition_hash(work_item_id: &WorkItemId) -> u64 {
    let digest = blake3::hash(work_item_id.as_str().as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_le_bytes(prefix)
}

/// `hash(work_item_id) mod total == agent_index`. An empty live set owns nothing.
pub fn owns(work_item_id: &WorkItemId, agent_index: usize, total: usize) -> bool {
    if total == 0 || agent_index >= total {
        return false;
    }
    (partition_hash(work_item_id) % total as u64) as usize == agent_index
}

/// A sorted snapshot of the live agents advertising one capability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionView {
    capability: Capability,
    members: Vec<AgentId>,
    self_index: Option<usize>,
    refreshed_at: DateTime<Utc>,
}

impl PartitionView {
    /// Build a view from any ordering of member ids; duplicates are collapsed.
    /// `self_id` need not be a member (it may not have been indexed yet), in
    /// which case the view owns nothing until the next refresh.
    pub fn new(capability: Capability, self_id: &AgentId, members: impl IntoIterator<Item = AgentId>) -> Self {
        let mut members: Vec<AgentId> = members.into_iter().collect();
        members.sort();
        members.dedup();
        let self_index = members.binary_search(self_id).ok();
        Self {
            capability,
            members,
            self_index,
            refreshed_at: Utc::now(),
        }
    }

    pub fn empty(capability: Capability) -> Self {
        Self {
            capability,
            members: Vec::new(),
            self_index: None,
            refreshed_at: Utc::now(),
        }
    }

    pub fn capability(&self) -> &Capability {
        &self.capability
    }

    pub fn members(&self) -> &[AgentId] {
        &self.members
    }

    pub fn total(&self) -> usize {
        self.members.len()
    }

    pub fn self_index(&self) -> Option<usize> {
        self.self_index
    }

    pub fn refreshed_at(&self) -> DateTime<Utc> {
        self.refreshed_at
    }

    pub fn owns(&self, work_item_id: &WorkItemId) -> bool {
        match self.self_index {
            Some(index) => owns(work_item_id, index, self.total()),
            None => false,
        }
    }

    /// The member this view assigns the item to.
    pub fn owner_of(&self, work_item_id: &WorkItemId) -> Option<&AgentId> {
        if self.members.is_empty() {
            return None;
        }
        let slot = (partition_hash(work_item_id) % self.total() as u64) as usize;
        self.members.get(slot)
    }

    /// Whether this agent should try to check the item out: either the hash
    /// assigns it here, or it has sat enabled for longer than `orphan_after`
    /// (its assigned owner is gone or the views disagree).
    pub fn should_attempt(&self, item: &WorkItemRecord, now: DateTime<Utc>, orphan_after: Duration) -> bool {
        if self.owns(&item.work_item_id) {
            return true;
        }
        is_orphaned(item, now, orphan_after)
    }
}

pub fn is_orphaned(item: &WorkItemRecord, now: DateTime<Utc>, orphan_after: Duration) -> bool {
    match chrono::Duration::from_std(orphan_after) {
        Ok(after) => now - item.enabled_at >= after,
        Err(_) => false,
    }
}

/// Counts discovery cycles and reports when the partition snapshot is due for
/// a refresh. The first cycle always refreshes.
#[derive(Debug, Clone)]
pub struct PartitionRefresher {
    every: u32,
    since_refresh: Option<u32>,
}

impl PartitionRefresher {
    pub fn new(every: u32) -> Self {
        Self {
            every: every.max(1),
            since_refresh: None,
        }
    }

    /// Advance one cycle; `true` means refresh before filtering this cycle.
    pub fn tick(&mut self) -> bool {
        match self.since_refresh {
            Some(cycles) if cycles + 1 < self.every => {
                self.since_refresh = Some(cycles + 1);
                false
            }
            _ => {
                self.since_refresh = Some(0);
                true
            }
        }
    }

    /// Force a refresh on the next tick (e.g. after a lost checkout race).
    pub fn invalidate(&mut self) {
        self.since_refresh = None;
    }

    pub fn cadence(&self) -> u32 {
        self.every
    }
}
