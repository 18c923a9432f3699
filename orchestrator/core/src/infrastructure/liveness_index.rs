// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Liveness Index
//!
//! Read-optimised cache of live agents, maintained incrementally from the
//! LeaseStore watch stream and sharded by capability so that discovery reads
//! one partition and never the whole population.
//!
//! ## Ordering
//!
//! Every mutation is applied last-write-wins on the store [`Revision`]. Deleted
//! agents leave a tombstone so that an older Put (for example a late `touch`
//! from the renew path) cannot resurrect them.
//!
//! ## Failure Mode
//!
//! When the watch stream ends or errors the index flags itself degraded (pages
//! are served with `stale = true`), waits, performs a batched resynchronisation
//! gated by a rate limiter, and resumes watching from the resync revision.
//! The resync is the only full read of the key range.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::StreamExt;
use governor::clock::{Clock, DefaultClock};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashSet};
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::agent::{AgentId, AgentRecord, Capability};
use crate::domain::events::RegistryEvent;
use crate::domain::lease::{DeleteCause, LeaseStore, LeaseStoreError, Revision, WatchEvent, WatchEventKind};
use crate::domain::node_config::LivenessConfig;
use crate::infrastructure::event_bus::EventBus;

const TOMBSTONE_RETENTION: Duration = Duration::from_secs(600);

#[derive(Debug, Clone)]
pub struct LiveEntry {
    pub record: AgentRecord,
    pub revision: Revision,
    pub refreshed_at: DateTime<Utc>,
}

struct Tombstone {
    revision: Revision,
    recorded_at: Instant,
}

pub struct LivenessIndex {
    key_prefix: String,
    config: LivenessConfig,
    entries: DashMap<AgentId, LiveEntry>,
    partitions: DashMap<Capability, RwLock<BTreeSet<AgentId>>>,
    tombstones: DashMap<AgentId, Tombstone>,
    applied: AtomicI64,
    degraded: AtomicBool,
    resyncs: AtomicU64,
    limiter: DefaultDirectRateLimiter,
    clock: DefaultClock,
    events: EventBus,
}

impl LivenessIndex {
    pub fn new(key_prefix: impl Into<String>, config: LivenessConfig, events: EventBus) -> Self {
        let per_minute = NonZeroU32::new(config.resync_per_minute).unwrap_or(NonZeroU32::MIN);
        Self {
            key_prefix: key_prefix.into(),
            entries: DashMap::new(),
            partitions: DashMap::new(),
            tombstones: DashMap::new(),
            applied: AtomicI64::new(0),
            // Cold start counts as degraded until the first resync lands.
            degraded: AtomicBool::new(true),
            resyncs: AtomicU64::new(0),
            limiter: RateLimiter::direct(Quota::per_minute(per_minute)),
            clock: DefaultClock::default(),
            config,
            events,
        }
    }

    pub fn key_for(&self, agent_id: &AgentId) -> String {
        format!("{}{}", self.key_prefix, agent_id)
    }

    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// One page of the capability partition plus the partition size.
    /// Cost is O(offset + limit) regardless of the total population.
    pub fn page(&self, capability: &Capability, limit: usize, offset: usize) -> (Vec<AgentRecord>, usize) {
        let Some(partition) = self.partitions.get(capability) else {
            return (Vec::new(), 0);
        };
        let members = partition.read();
        let records = members
            .iter()
            .skip(offset)
            .take(limit)
            .filter_map(|id| self.entries.get(id).map(|entry| entry.record.clone()))
            .collect();
        (records, members.len())
    }

    pub fn get(&self, agent_id: &AgentId) -> Option<LiveEntry> {
        self.entries.get(agent_id).map(|entry| entry.clone())
    }

    pub fn contains(&self, agent_id: &AgentId) -> bool {
        self.entries.contains_key(agent_id)
    }

    pub fn live_count(&self) -> usize {
        self.entries.len()
    }

    pub fn partition_len(&self, capability: &Capability) -> usize {
        match self.partitions.get(capability) {
            Some(partition) => {
                let members = partition.read();
                members.len()
            }
            None => 0,
        }
    }

    /// Sorted ids of live agents advertising `capability`.
    pub fn members(&self, capability: &Capability) -> Vec<AgentId> {
        match self.partitions.get(capability) {
            Some(partition) => {
                let members = partition.read();
                members.iter().cloned().collect()
            }
            None => Vec::new(),
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    pub fn resync_count(&self) -> u64 {
        self.resyncs.load(Ordering::SeqCst)
    }

    /// Highest revision applied from the watch stream or a resync.
    pub fn applied_revision(&self) -> Revision {
        Revision(self.applied.load(Ordering::SeqCst))
    }

    // ========================================================================
    // Writes (last-write-wins on revision)
    // ========================================================================

    /// Insert or replace an agent entry. Returns false if the write was stale.
    pub fn upsert(&self, record: AgentRecord, revision: Revision) -> bool {
        let agent_id = record.agent_id.clone();
        // Holding the tombstone slot serialises writes for this agent against `remove`.
        let slot = self.tombstones.entry(agent_id.clone());
        if let Entry::Occupied(tombstone) = &slot {
            if tombstone.get().revision >= revision {
                debug!(agent_id = %agent_id, %revision, "Ignoring put older than tombstone");
                return false;
            }
        }

        let previous_caps = match self.entries.get(&agent_id) {
            Some(existing) if existing.revision > revision => return false,
            Some(existing) => Some(existing.record.capabilities.clone()),
            None => None,
        };

        let capabilities = record.capabilities.clone();
        self.entries.insert(
            agent_id.clone(),
            LiveEntry {
                record,
                revision,
                refreshed_at: Utc::now(),
            },
        );

        if let Some(previous) = previous_caps {
            for capability in previous.difference(&capabilities) {
                if let Some(partition) = self.partitions.get(capability) {
                    partition.write().remove(&agent_id);
                }
            }
        }
        for capability in capabilities {
            self.partitions
                .entry(capability)
                .or_default()
                .write()
                .insert(agent_id.clone());
        }
        self.publish_gauge();

        // Only reached when the tombstone is older than this write.
        if let Entry::Occupied(tombstone) = slot {
            tombstone.remove();
        }
        true
    }

    /// Renew path: refresh the entry timestamp, inserting it if absent.
    pub fn touch(&self, record: AgentRecord, revision: Revision) -> bool {
        if let Some(mut entry) = self.entries.get_mut(&record.agent_id) {
            if entry.revision >= revision {
                entry.refreshed_at = Utc::now();
                return true;
            }
        }
        self.upsert(record, revision)
    }

    /// Remove an agent. Returns false if a newer entry superseded the delete.
    pub fn remove(&self, agent_id: &AgentId, revision: Revision) -> bool {
        let slot = self.tombstones.entry(agent_id.clone());
        if let Some(existing) = self.entries.get(agent_id) {
            if existing.revision > revision {
                return false;
            }
        }

        let _tombstone = match slot {
            Entry::Occupied(mut occupied) => {
                let tombstone = occupied.get_mut();
                if tombstone.revision < revision {
                    tombstone.revision = revision;
                    tombstone.recorded_at = Instant::now();
                }
                occupied.into_ref()
            }
            Entry::Vacant(vacant) => vacant.insert(Tombstone {
                revision,
                recorded_at: Instant::now(),
            }),
        };

        let Some((_, entry)) = self.entries.remove(agent_id) else {
            return false;
        };
        for capability in &entry.record.capabilities {
            if let Some(partition) = self.partitions.get(capability) {
                partition.write().remove(agent_id);
            }
        }
        self.publish_gauge();
        true
    }

    /// Apply one watch event.
    pub fn apply(&self, event: &WatchEvent) {
        let Some(raw_id) = event.kv.key.strip_prefix(&self.key_prefix) else {
            return;
        };
        let agent_id = AgentId::new(raw_id);

        match event.kind {
            WatchEventKind::Put => match serde_json::from_slice::<AgentRecord>(&event.kv.value) {
                Ok(record) => {
                    self.upsert(record, event.kv.mod_revision);
                }
                Err(e) => warn!(key = %event.kv.key, "Skipping undecodable agent record: {}", e),
            },
            WatchEventKind::Delete => {
                let removed = self.remove(&agent_id, event.revision);
                if removed && event.cause == Some(DeleteCause::LeaseExpired) {
                    info!(agent_id = %agent_id, revision = %event.revision, "Agent lease expired");
                    self.events.publish_registry_event(RegistryEvent::AgentExpired {
                        agent_id,
                        revision: event.revision,
                        expired_at: Utc::now(),
                    });
                }
            }
        }
        self.applied.fetch_max(event.revision.0, Ordering::SeqCst);
    }

    /// Drop tombstones older than the retention window.
    pub fn prune_tombstones(&self) -> usize {
        let before = self.tombstones.len();
        self.tombstones
            .retain(|_, tombstone| tombstone.recorded_at.elapsed() < TOMBSTONE_RETENTION);
        before - self.tombstones.len()
    }

    fn publish_gauge(&self) {
        metrics::gauge!("bazaar_live_agents").set(self.entries.len() as f64);
    }

    fn mark_degraded(&self, reason: &str) {
        if !self.degraded.swap(true, Ordering::SeqCst) {
            warn!(reason, "Liveness index degraded; serving stale data");
            metrics::gauge!("bazaar_index_degraded").set(1.0);
            self.events.publish_registry_event(RegistryEvent::IndexDegraded {
                reason: reason.to_string(),
                degraded_at: Utc::now(),
            });
        }
    }

    fn mark_healthy(&self) {
        if self.degraded.swap(false, Ordering::SeqCst) {
            metrics::gauge!("bazaar_index_degraded").set(0.0);
        }
    }

    // ========================================================================
    // Resynchronisation
    // ========================================================================

    /// Wait for a resync permit. Returns false if cancelled first.
    async fn acquire_resync_permit(&self, cancel: &CancellationToken) -> bool {
        loop {
            let wait = match self.limiter.check() {
                Ok(()) => return true,
                Err(not_until) => not_until.wait_time_from(self.clock.now()),
            };
            debug!(?wait, "Resync rate limited");
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = cancel.cancelled() => return false,
            }
        }
    }

    /// Batched full read of the key range. Returns the revision the watch
    /// should resume after.
    pub async fn resync(&self, store: &dyn LeaseStore) -> Result<Revision, LeaseStoreError> {
        let batch = self.config.resync_batch_size.max(1);
        let mut seen: HashSet<AgentId> = HashSet::new();
        let mut start_after: Option<String> = None;
        let mut snapshot_revision: Option<Revision> = None;
        self.tombstones.clear();

        loop {
            let page = store.range(&self.key_prefix, start_after.as_deref(), batch).await?;
            snapshot_revision.get_or_insert(page.revision);
            for kv in &page.kvs {
                match serde_json::from_slice::<AgentRecord>(&kv.value) {
                    Ok(record) => {
                        seen.insert(record.agent_id.clone());
                        self.upsert(record, kv.mod_revision);
                    }
                    Err(e) => warn!(key = %kv.key, "Skipping undecodable agent record: {}", e),
                }
            }
            start_after = page.kvs.last().map(|kv| kv.key.clone());
            if !page.more || start_after.is_none() {
                break;
            }
        }

        let revision = snapshot_revision.unwrap_or_default();
        let vanished: Vec<(AgentId, Revision)> = self
            .entries
            .iter()
            .filter(|entry| !seen.contains(entry.key()) && entry.revision <= revision)
            .map(|entry| (entry.key().clone(), entry.revision))
            .collect();
        for (agent_id, _) in &vanished {
            self.remove(agent_id, revision);
        }

        self.applied.fetch_max(revision.0, Ordering::SeqCst);
        self.resyncs.fetch_add(1, Ordering::SeqCst);
        metrics::counter!("bazaar_index_resyncs_total").increment(1);
        info!(
            live_agents = self.entries.len(),
            removed = vanished.len(),
            %revision,
            "Liveness index resynchronised"
        );
        self.events.publish_registry_event(RegistryEvent::IndexResynced {
            live_agents: self.entries.len(),
            revision,
            resynced_at: Utc::now(),
        });
        Ok(revision)
    }

    /// Drive the index from the store until `cancel` fires: resync, watch,
    /// and on every disconnect degrade, wait, and start over.
    pub async fn run(self: Arc<Self>, store: Arc<dyn LeaseStore>, cancel: CancellationToken) {
        info!(prefix = %self.key_prefix, "Starting liveness index");
        let mut prune = tokio::time::interval(TOMBSTONE_RETENTION);
        prune.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        'outer: loop {
            if !self.acquire_resync_permit(&cancel).await {
                break;
            }

            let watch = match self.resync(store.as_ref()).await {
                Ok(revision) => store
                    .watch(&self.key_prefix, revision.next())
                    .await
                    .map(|stream| (stream, revision)),
                Err(e) => Err(e),
            };

            match watch {
                Ok((mut stream, revision)) => {
                    self.mark_healthy();
                    debug!(%revision, "Watching lease store");
                    loop {
                        tokio::select! {
                            _ = cancel.cancelled() => break 'outer,
                            _ = prune.tick() => {
                                self.prune_tombstones();
                            }
                            item = stream.next() => match item {
                                Some(Ok(event)) => self.apply(&event),
                                Some(Err(e)) => {
                                    self.mark_degraded(&format!("watch error: {}", e));
                                    break;
                                }
                                None => {
                                    self.mark_degraded("watch stream closed");
                                    break;
                                }
                            }
                        }
                    }
                }
                Err(e) => self.mark_degraded(&format!("resync failed: {}", e)),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
                _ = cancel.cancelled() => break,
            }
        }

        info!("Liveness index stopped");
    }

    /// Spawn [`LivenessIndex::run`] on the runtime.
    pub fn spawn(
        self: &Arc<Self>,
        store: Arc<dyn LeaseStore>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(Arc::clone(self).run(store, cancel))
    }
}
