// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// In-Memory LeaseStore
//
// Single-process implementation of the LeaseStore port with etcd v3 semantics:
// store-wide revisions, TTL leases that own keys, prefix ranges and
// revision-ordered watches with bounded replay history.
//
// Lease deadlines use tokio's clock so tests can drive expiry with a paused
// runtime. Leases are also ordered by deadline, so expiry (lazily on every
// call and eagerly by the reaper) only visits the leases that are due.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::lease::{
    DeleteCause, KeyValue, LeaseGrant, LeaseId, LeaseStore, LeaseStoreError, RangePage, Revision, WatchEvent,
    WatchEventKind, WatchStream,
};
use crate::domain::node_config::LeaseStoreConfig;

struct LeaseEntry {
    ttl: Duration,
    deadline: Instant,
    keys: BTreeSet<String>,
}

struct Watcher {
    prefix: String,
    tx: mpsc::Sender<Result<WatchEvent, LeaseStoreError>>,
}

#[derive(Default)]
struct StoreState {
    revision: Revision,
    kvs: BTreeMap<String, KeyValue>,
    leases: HashMap<LeaseId, LeaseEntry>,
    deadlines: BTreeSet<(Instant, LeaseId)>,
    history: VecDeque<WatchEvent>,
    /// Highest revision dropped from `history`.
    compacted: Revision,
    watchers: Vec<Watcher>,
}

pub struct InMemoryLeaseStore {
    state: Mutex<StoreState>,
    next_lease: AtomicI64,
    available: AtomicBool,
    history_limit: usize,
    watch_buffer: usize,
}

impl InMemoryLeaseStore {
    pub fn new(config: &LeaseStoreConfig) -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            next_lease: AtomicI64::new(1),
            available: AtomicBool::new(true),
            history_limit: config.history_limit.max(1),
            watch_buffer: config.watch_buffer.max(1),
        }
    }

    /// Simulate a store outage: every call fails with `Unavailable` until restored.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
        if !available {
            self.sever_watches();
        }
    }

    /// Close every open watch stream. Consumers observe end-of-stream.
    pub fn sever_watches(&self) {
        let mut state = self.state.lock();
        let severed = state.watchers.len();
        state.watchers.clear();
        debug!(severed, "Severed lease store watches");
    }

    pub fn watcher_count(&self) -> usize {
        self.state.lock().watchers.len()
    }

    pub fn lease_count(&self) -> usize {
        self.state.lock().leases.len()
    }

    /// Number of leases tracked in the deadline order. Always equals `lease_count`.
    pub fn scheduled_count(&self) -> usize {
        self.state.lock().deadlines.len()
    }

    /// Expire every lease whose deadline has passed. Returns the number expired.
    pub fn expire_due(&self) -> usize {
        let mut state = self.state.lock();
        self.expire_due_locked(&mut state, Instant::now())
    }

    /// Periodically expire overdue leases until `cancel` fires.
    pub fn spawn_reaper(self: Arc<Self>, period: Duration, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let expired = self.expire_due();
                        if expired > 0 {
                            debug!(expired, "Lease reaper expired leases");
                        }
                    }
                    _ = cancel.cancelled() => {
                        info!("Lease reaper stopped");
                        break;
                    }
                }
            }
        })
    }

    fn check_available(&self) -> Result<(), LeaseStoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(LeaseStoreError::Unavailable("lease store offline".to_string()))
        }
    }

    fn expire_due_locked(&self, state: &mut StoreState, now: Instant) -> usize {
        let mut expired = 0;
        while state.deadlines.first().is_some_and(|(deadline, _)| *deadline <= now) {
            let Some((_, id)) = state.deadlines.pop_first() else {
                break;
            };
            self.drop_lease_locked(state, id, DeleteCause::LeaseExpired);
            expired += 1;
        }
        if expired > 0 {
            metrics::counter!("bazaar_lease_expired_total").increment(expired as u64);
        }
        expired
    }

    /// Remove a lease and delete its keys under a single revision.
    fn drop_lease_locked(&self, state: &mut StoreState, id: LeaseId, cause: DeleteCause) {
        let Some(lease) = state.leases.remove(&id) else {
            return;
        };
        state.deadlines.remove(&(lease.deadline, id));
        if lease.keys.is_empty() {
            return;
        }
        let revision = state.revision.next();
        state.revision = revision;
        for key in lease.keys {
            if let Some(kv) = state.kvs.remove(&key) {
                self.emit_locked(state, tombstone(kv, revision), revision, Some(cause));
            }
        }
    }

    fn emit_locked(&self, state: &mut StoreState, kv: KeyValue, revision: Revision, cause: Option<DeleteCause>) {
        let kind = if cause.is_some() {
            WatchEventKind::Delete
        } else {
            WatchEventKind::Put
        };
        let event = WatchEvent {
            kind,
            kv,
            revision,
            cause,
        };

        state.watchers.retain(|watcher| {
            if !event.kv.key.starts_with(&watcher.prefix) {
                return !watcher.tx.is_closed();
            }
            match watcher.tx.try_send(Ok(event.clone())) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(prefix = %watcher.prefix, "Watcher fell behind; disconnecting");
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });

        state.history.push_back(event);
        while state.history.len() > self.history_limit {
            if let Some(dropped) = state.history.pop_front() {
                state.compacted = dropped.revision;
            }
        }
    }

    fn live_lease<'a>(
        state: &'a mut StoreState,
        id: LeaseId,
    ) -> Result<&'a mut LeaseEntry, LeaseStoreError> {
        state.leases.get_mut(&id).ok_or(LeaseStoreError::LeaseNotFound(id))
    }

    fn write_locked(
        &self,
        state: &mut StoreState,
        key: &str,
        value: Vec<u8>,
        lease: Option<LeaseId>,
    ) -> Result<Revision, LeaseStoreError> {
        if key.is_empty() {
            return Err(LeaseStoreError::InvalidRequest("empty key".to_string()));
        }
        if let Some(id) = lease {
            Self::live_lease(state, id)?.keys.insert(key.to_string());
        }

        let revision = state.revision.next();
        state.revision = revision;

        let previous = state.kvs.get(key).cloned();
        if let Some(old_lease) = previous.as_ref().and_then(|kv| kv.lease) {
            if Some(old_lease) != lease {
                if let Some(entry) = state.leases.get_mut(&old_lease) {
                    entry.keys.remove(key);
                }
            }
        }

        let kv = KeyValue {
            key: key.to_string(),
            value,
            create_revision: previous.map(|kv| kv.create_revision).unwrap_or(revision),
            mod_revision: revision,
            lease,
        };
        state.kvs.insert(key.to_string(), kv.clone());
        self.emit_locked(state, kv, revision, None);
        Ok(revision)
    }
}

fn tombstone(kv: KeyValue, revision: Revision) -> KeyValue {
    KeyValue {
        value: Vec::new(),
        mod_revision: revision,
        ..kv
    }
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn grant(&self, ttl: Duration) -> Result<LeaseGrant, LeaseStoreError> {
        self.check_available()?;
        if ttl.is_zero() {
            return Err(LeaseStoreError::InvalidRequest("lease ttl must be positive".to_string()));
        }
        let id = LeaseId(self.next_lease.fetch_add(1, Ordering::SeqCst));
        let deadline = Instant::now() + ttl;
        let mut state = self.state.lock();
        state.leases.insert(
            id,
            LeaseEntry {
                ttl,
                deadline,
                keys: BTreeSet::new(),
            },
        );
        state.deadlines.insert((deadline, id));
        Ok(LeaseGrant { id, ttl })
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<LeaseGrant, LeaseStoreError> {
        self.check_available()?;
        let mut state = self.state.lock();
        let now = Instant::now();
        self.expire_due_locked(&mut state, now);
        let entry = Self::live_lease(&mut state, lease)?;
        let previous = entry.deadline;
        let ttl = entry.ttl;
        entry.deadline = now + ttl;
        state.deadlines.remove(&(previous, lease));
        state.deadlines.insert((now + ttl, lease));
        Ok(LeaseGrant { id: lease, ttl })
    }

    async fn revoke(&self, lease: LeaseId) -> Result<(), LeaseStoreError> {
        self.check_available()?;
        let mut state = self.state.lock();
        self.drop_lease_locked(&mut state, lease, DeleteCause::LeaseRevoked);
        Ok(())
    }

    async fn time_to_live(&self, lease: LeaseId) -> Result<Option<Duration>, LeaseStoreError> {
        self.check_available()?;
        let mut state = self.state.lock();
        let now = Instant::now();
        self.expire_due_locked(&mut state, now);
        Ok(state
            .leases
            .get(&lease)
            .map(|entry| entry.deadline.saturating_duration_since(now)))
    }

    async fn create(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> Result<Revision, LeaseStoreError> {
        self.check_available()?;
        let mut state = self.state.lock();
        self.expire_due_locked(&mut state, Instant::now());
        if state.kvs.contains_key(key) {
            return Err(LeaseStoreError::KeyExists(key.to_string()));
        }
        self.write_locked(&mut state, key, value, lease)
    }

    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> Result<Revision, LeaseStoreError> {
        self.check_available()?;
        let mut state = self.state.lock();
        self.expire_due_locked(&mut state, Instant::now());
        self.write_locked(&mut state, key, value, lease)
    }

    async fn get(&self, key: &str) -> Result<Option<KeyValue>, LeaseStoreError> {
        self.check_available()?;
        let mut state = self.state.lock();
        self.expire_due_locked(&mut state, Instant::now());
        Ok(state.kvs.get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<Option<Revision>, LeaseStoreError> {
        self.check_available()?;
        let mut state = self.state.lock();
        self.expire_due_locked(&mut state, Instant::now());
        let Some(kv) = state.kvs.remove(key) else {
            return Ok(None);
        };
        if let Some(entry) = kv.lease.and_then(|id| state.leases.get_mut(&id)) {
            entry.keys.remove(key);
        }
        let revision = state.revision.next();
        state.revision = revision;
        self.emit_locked(&mut state, tombstone(kv, revision), revision, Some(DeleteCause::Deleted));
        Ok(Some(revision))
    }

    async fn range(&self, prefix: &str, start_after: Option<&str>, limit: usize) -> Result<RangePage, LeaseStoreError> {
        self.check_available()?;
        if limit == 0 {
            return Err(LeaseStoreError::InvalidRequest("range limit must be positive".to_string()));
        }
        let mut state = self.state.lock();
        self.expire_due_locked(&mut state, Instant::now());

        let lower = match start_after {
            Some(after) if after >= prefix => Bound::Excluded(after),
            _ => Bound::Included(prefix),
        };
        let mut kvs: Vec<KeyValue> = state
            .kvs
            .range::<str, _>((lower, Bound::Unbounded))
            .take_while(|(key, _)| key.starts_with(prefix))
            .take(limit + 1)
            .map(|(_, kv)| kv.clone())
            .collect();
        let more = kvs.len() > limit;
        kvs.truncate(limit);

        Ok(RangePage {
            kvs,
            more,
            revision: state.revision,
        })
    }

    async fn watch(&self, prefix: &str, start_revision: Revision) -> Result<WatchStream, LeaseStoreError> {
        self.check_available()?;
        let mut state = self.state.lock();
        if start_revision > Revision::ZERO && start_revision <= state.compacted {
            return Err(LeaseStoreError::Compacted {
                requested: start_revision,
                oldest: state.compacted.next(),
            });
        }

        let (tx, rx) = mpsc::channel(self.watch_buffer);
        if start_revision > Revision::ZERO {
            for event in state
                .history
                .iter()
                .filter(|e| e.revision >= start_revision && e.kv.key.starts_with(prefix))
            {
                if tx.try_send(Ok(event.clone())).is_err() {
                    return Err(LeaseStoreError::WatchLagged);
                }
            }
        }
        state.watchers.push(Watcher {
            prefix: prefix.to_string(),
            tx,
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn current_revision(&self) -> Result<Revision, LeaseStoreError> {
        self.check_available()?;
        Ok(self.state.lock().revision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn store() -> InMemoryLeaseStore {
        InMemoryLeaseStore::new(&LeaseStoreConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_expiry_deletes_keys() {
        let store = store();
        let grant = store.grant(Duration::from_secs(10)).await.unwrap();
        store.create("/a/1", b"x".to_vec(), Some(grant.id)).await.unwrap();

        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(store.get("/a/1").await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(store.get("/a/1").await.unwrap().is_none());
        assert_eq!(
            store.keep_alive(grant.id).await,
            Err(LeaseStoreError::LeaseNotFound(grant.id))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_alive_extends_deadline() {
        let store = store();
        let grant = store.grant(Duration::from_secs(10)).await.unwrap();
        store.put("/a/1", b"x".to_vec(), Some(grant.id)).await.unwrap();

        tokio::time::advance(Duration::from_secs(8)).await;
        store.keep_alive(grant.id).await.unwrap();
        tokio::time::advance(Duration::from_secs(8)).await;

        assert!(store.get("/a/1").await.unwrap().is_some());
        assert_eq!(
            store.time_to_live(grant.id).await.unwrap(),
            Some(Duration::from_secs(2))
        );
    }

    #[tokio::test]
    async fn test_create_is_exclusive() {
        let store = store();
        store.create("/a/1", b"x".to_vec(), None).await.unwrap();
        assert_eq!(
            store.create("/a/1", b"y".to_vec(), None).await,
            Err(LeaseStoreError::KeyExists("/a/1".to_string()))
        );
    }

    #[tokio::test]
    async fn test_range_pages_in_key_order() {
        let store = store();
        for i in 0..5 {
            store.put(&format!("/a/{i}"), vec![], None).await.unwrap();
        }
        store.put("/b/0", vec![], None).await.unwrap();

        let first = store.range("/a/", None, 3).await.unwrap();
        assert!(first.more);
        assert_eq!(first.kvs.len(), 3);
        let last_key = first.kvs.last().unwrap().key.clone();

        let second = store.range("/a/", Some(&last_key), 3).await.unwrap();
        assert!(!second.more);
        let keys: Vec<_> = second.kvs.iter().map(|kv| kv.key.as_str()).collect();
        assert_eq!(keys, vec!["/a/3", "/a/4"]);
    }

    #[tokio::test]
    async fn test_revoke_emits_delete_per_key() {
        let store = store();
        let mut watch = store.watch("/a/", Revision::ZERO).await.unwrap();
        let grant = store.grant(Duration::from_secs(30)).await.unwrap();
        store.put("/a/1", vec![1], Some(grant.id)).await.unwrap();
        store.put("/a/2", vec![2], Some(grant.id)).await.unwrap();
        store.revoke(grant.id).await.unwrap();

        let mut kinds = Vec::new();
        for _ in 0..4 {
            let event = watch.next().await.unwrap().unwrap();
            kinds.push((event.kind, event.cause));
        }
        assert_eq!(kinds[0].0, WatchEventKind::Put);
        assert_eq!(kinds[2], (WatchEventKind::Delete, Some(DeleteCause::LeaseRevoked)));
        assert_eq!(kinds[3], (WatchEventKind::Delete, Some(DeleteCause::LeaseRevoked)));
    }

    #[tokio::test]
    async fn test_watch_replays_from_revision() {
        let store = store();
        let r1 = store.put("/a/1", vec![1], None).await.unwrap();
        store.put("/a/2", vec![2], None).await.unwrap();

        let mut watch = store.watch("/a/", r1).await.unwrap();
        assert_eq!(watch.next().await.unwrap().unwrap().kv.key, "/a/1");
        assert_eq!(watch.next().await.unwrap().unwrap().kv.key, "/a/2");
    }

    #[tokio::test]
    async fn test_watch_compacted() {
        let config = LeaseStoreConfig {
            history_limit: 2,
            ..LeaseStoreConfig::default()
        };
        let store = InMemoryLeaseStore::new(&config);
        for i in 0..5 {
            store.put(&format!("/a/{i}"), vec![], None).await.unwrap();
        }
        assert!(matches!(
            store.watch("/a/", Revision(1)).await,
            Err(LeaseStoreError::Compacted { .. })
        ));
        assert!(store.watch("/a/", Revision(4)).await.is_ok());
    }

    #[tokio::test]
    async fn test_slow_watcher_is_disconnected() {
        let config = LeaseStoreConfig {
            watch_buffer: 2,
            ..LeaseStoreConfig::default()
        };
        let store = InMemoryLeaseStore::new(&config);
        let mut watch = store.watch("/a/", Revision::ZERO).await.unwrap();
        for i in 0..4 {
            store.put(&format!("/a/{i}"), vec![], None).await.unwrap();
        }
        assert_eq!(store.watcher_count(), 0);

        assert!(watch.next().await.is_some());
        assert!(watch.next().await.is_some());
        assert!(watch.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_order_tracks_every_lease() {
        let store = store();
        let short = store.grant(Duration::from_secs(5)).await.unwrap();
        let long = store.grant(Duration::from_secs(20)).await.unwrap();
        let revoked = store.grant(Duration::from_secs(20)).await.unwrap();
        store.put("/a/short", vec![], Some(short.id)).await.unwrap();
        store.put("/a/long", vec![], Some(long.id)).await.unwrap();
        assert_eq!(store.scheduled_count(), 3);

        store.revoke(revoked.id).await.unwrap();
        assert_eq!(store.scheduled_count(), 2);

        // Renewing moves the lease later in the order without duplicating it
        tokio::time::advance(Duration::from_secs(4)).await;
        store.keep_alive(short.id).await.unwrap();
        store.keep_alive(short.id).await.unwrap();
        assert_eq!(store.scheduled_count(), 2);

        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(store.expire_due(), 0);
        assert!(store.get("/a/short").await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(store.expire_due(), 1);
        assert!(store.get("/a/short").await.unwrap().is_none());
        assert!(store.get("/a/long").await.unwrap().is_some());
        assert_eq!(store.lease_count(), 1);
        assert_eq!(store.scheduled_count(), 1);
    }

    #[tokio::test]
    async fn test_unavailable_store() {
        let store = store();
        store.set_available(false);
        assert!(matches!(
            store.grant(Duration::from_secs(5)).await,
            Err(LeaseStoreError::Unavailable(_))
        ));
        store.set_available(true);
        assert!(store.grant(Duration::from_secs(5)).await.is_ok());
    }
}
