// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Integration tests for the lease store, liveness index and marketplace
//! running together under a paused tokio clock.
//!
//! Covers:
//! - liveness tracking a heartbeating agent and dropping it after lease expiry
//! - degraded mode and batched resynchronisation after a lost watch
//! - rate-limited resynchronisation
//! - discovery cost independent of unrelated population
//! - renew cost independent of unrelated lease population
//! - a lease expiry racing an older renew never leaves the agent live

use bazaar_core::application::AgentMarketplace;
use bazaar_core::domain::agent::{AgentId, AgentRecord, Capability, CapabilitySchema, DiscoveryQuery, PublishRequest};
use bazaar_core::domain::lease::{LeaseId, LeaseStore, Revision};
use bazaar_core::domain::node_config::{LeaseStoreConfig, LivenessConfig, RegistryConfig};
use bazaar_core::infrastructure::event_bus::EventBus;
use bazaar_core::infrastructure::lease_store::InMemoryLeaseStore;
use bazaar_core::infrastructure::liveness_index::LivenessIndex;
use chrono::Utc;
use std::sync::{Arc, Barrier};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const PREFIX: &str = "/bazaar/agents/";

struct Harness {
    store: Arc<InMemoryLeaseStore>,
    index: Arc<LivenessIndex>,
    marketplace: AgentMarketplace,
    cancel: CancellationToken,
}

impl Harness {
    fn start(liveness: LivenessConfig) -> Self {
        let store = Arc::new(InMemoryLeaseStore::new(&LeaseStoreConfig::default()));
        let events = EventBus::new(256);
        let index = Arc::new(LivenessIndex::new(PREFIX, liveness, events.clone()));
        let cancel = CancellationToken::new();

        store.clone().spawn_reaper(Duration::from_millis(500), cancel.clone());
        let dyn_store: Arc<dyn LeaseStore> = store.clone();
        index.spawn(dyn_store, cancel.clone());

        let marketplace = AgentMarketplace::new(
            store.clone(),
            index.clone(),
            CapabilitySchema::new(["invoice", "shipping"]).unwrap(),
            RegistryConfig::default(),
            events,
        );
        Self {
            store,
            index,
            marketplace,
            cancel,
        }
    }

    async fn wait_healthy(&self) {
        for _ in 0..100 {
            if !self.index.is_degraded() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("liveness index never became healthy");
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[tokio::test(start_paused = true)]
async fn test_heartbeating_agent_stays_live_then_expires() {
    let harness = Harness::start(LivenessConfig::default());
    harness.wait_healthy().await;
    let a1 = AgentId::new("a1");

    let lease = harness
        .marketplace
        .publish(PublishRequest::new("a1", ["invoice"], "http://a1:9000").with_ttl(60))
        .await
        .unwrap();

    // Heartbeat every 20s for five minutes
    for _ in 0..15 {
        tokio::time::sleep(Duration::from_secs(20)).await;
        harness.marketplace.renew(&a1, lease).await.unwrap();
        assert!(harness.index.contains(&a1));
    }

    // Stop heartbeating: still live just before the TTL
    tokio::time::sleep(Duration::from_secs(59)).await;
    assert!(harness.index.contains(&a1));

    // Gone within TTL plus one watch interval
    let mut absent_after = None;
    for second in 60..=65 {
        tokio::time::sleep(Duration::from_secs(1)).await;
        if !harness.index.contains(&a1) {
            absent_after = Some(second);
            break;
        }
    }
    assert!(absent_after.is_some(), "a1 still listed 65s after its last heartbeat");

    let page = harness.marketplace.discover(DiscoveryQuery::new("invoice")).await.unwrap();
    assert_eq!(page.total, 0);
}

#[tokio::test(start_paused = true)]
async fn test_resync_after_watch_loss() {
    let harness = Harness::start(LivenessConfig::default());
    harness.wait_healthy().await;
    for id in ["a1", "a2", "a3"] {
        harness
            .marketplace
            .publish(PublishRequest::new(id, ["invoice"], format!("http://{id}")))
            .await
            .unwrap();
    }
    assert_eq!(harness.index.resync_count(), 1);

    harness.store.sever_watches();
    // Missed while disconnected
    harness.store.delete(&format!("{PREFIX}a2")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(harness.index.is_degraded());
    let stale = harness.marketplace.discover(DiscoveryQuery::new("invoice")).await.unwrap();
    assert!(stale.stale);
    assert_eq!(stale.total, 3);

    tokio::time::sleep(Duration::from_secs(2)).await;
    harness.wait_healthy().await;

    assert_eq!(harness.index.resync_count(), 2);
    let fresh = harness.marketplace.discover(DiscoveryQuery::new("invoice")).await.unwrap();
    assert!(!fresh.stale);
    assert_eq!(fresh.total, 2);
    assert!(!harness.index.contains(&AgentId::new("a2")));
}

#[tokio::test(start_paused = true)]
async fn test_resync_batches_cover_every_key() {
    let liveness = LivenessConfig {
        resync_batch_size: 7,
        ..LivenessConfig::default()
    };
    let harness = Harness::start(liveness);
    harness.wait_healthy().await;
    for i in 0..50 {
        harness
            .marketplace
            .publish(PublishRequest::new(format!("agent-{i:03}"), ["shipping"], "http://x"))
            .await
            .unwrap();
    }

    harness.store.sever_watches();
    tokio::time::sleep(Duration::from_secs(2)).await;
    harness.wait_healthy().await;

    assert_eq!(harness.index.resync_count(), 2);
    assert_eq!(harness.index.partition_len(&"shipping".into()), 50);
}

#[tokio::test(start_paused = true)]
async fn test_resync_is_rate_limited() {
    let liveness = LivenessConfig {
        resync_per_minute: 1,
        ..LivenessConfig::default()
    };
    let harness = Harness::start(liveness);
    harness.wait_healthy().await;

    harness.store.sever_watches();
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(harness.index.resync_count(), 1);
    assert!(harness.index.is_degraded());
}

#[tokio::test(start_paused = true)]
async fn test_store_outage_degrades_index() {
    let harness = Harness::start(LivenessConfig::default());
    harness.wait_healthy().await;

    harness.store.set_available(false);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(harness.index.is_degraded());

    harness.store.set_available(true);
    tokio::time::sleep(Duration::from_secs(2)).await;
    harness.wait_healthy().await;
    assert!(harness.index.resync_count() >= 2);
}

#[tokio::test]
async fn test_discovery_total_ignores_unrelated_population() {
    let harness = Harness::start(LivenessConfig::default());
    for i in 0..5 {
        harness
            .marketplace
            .publish(PublishRequest::new(format!("inv-{i}"), ["invoice"], "http://x"))
            .await
            .unwrap();
    }
    let before = harness
        .marketplace
        .discover(DiscoveryQuery::new("invoice").page(100, 0))
        .await
        .unwrap();

    for i in 0..2_000 {
        harness
            .marketplace
            .publish(PublishRequest::new(format!("ship-{i}"), ["shipping"], "http://x"))
            .await
            .unwrap();
    }
    let after = harness
        .marketplace
        .discover(DiscoveryQuery::new("invoice").page(100, 0))
        .await
        .unwrap();

    assert_eq!(before.total, 5);
    assert_eq!(after.total, 5);
    assert_eq!(after.agents.len(), 5);
    assert_eq!(harness.index.partition_len(&"shipping".into()), 2_000);
    assert!(after.agents.iter().all(|a| a.agent_id.as_str().starts_with("inv-")));
}

/// Time `renewals` keep-alives of one lease in a store holding `population` leases.
async fn time_renewals(population: usize, renewals: usize) -> Duration {
    let store = InMemoryLeaseStore::new(&LeaseStoreConfig::default());
    for _ in 0..population {
        store.grant(Duration::from_secs(3600)).await.unwrap();
    }
    let grant = store.grant(Duration::from_secs(3600)).await.unwrap();
    store.put("/bazaar/agents/renewer", vec![], Some(grant.id)).await.unwrap();

    let mut best = Duration::MAX;
    for _ in 0..3 {
        let started = std::time::Instant::now();
        for _ in 0..renewals {
            store.keep_alive(grant.id).await.unwrap();
        }
        best = best.min(started.elapsed());
    }
    assert_eq!(store.scheduled_count(), population + 1);
    best
}

#[tokio::test]
async fn test_renew_cost_ignores_unrelated_lease_population() {
    let small = time_renewals(1_000, 5_000).await;
    let large = time_renewals(100_000, 5_000).await;

    // A scan per renewal would make the large store ~100x slower.
    let ratio = large.as_secs_f64() / small.as_secs_f64().max(1e-6);
    assert!(
        ratio < 20.0,
        "renewal cost grew with population: 1k={small:?} 100k={large:?} ratio={ratio:.1}"
    );
}

fn invoice_record(id: &str) -> AgentRecord {
    AgentRecord {
        agent_id: AgentId::new(id),
        capabilities: [Capability::new("invoice")].into_iter().collect(),
        endpoint: format!("http://{id}"),
        registered_at: Utc::now(),
        lease_id: LeaseId(1),
        ttl_seconds: 60,
    }
}

#[test]
fn test_expiry_racing_an_older_renew_never_resurrects() {
    let index = LivenessIndex::new(PREFIX, LivenessConfig::default(), EventBus::new(16));
    let invoice = Capability::new("invoice");

    for round in 0..2_000i64 {
        let id = format!("racer-{round}");
        let renew_revision = Revision(round * 2 + 1);
        let expiry_revision = Revision(round * 2 + 2);
        let barrier = Barrier::new(2);

        std::thread::scope(|scope| {
            scope.spawn(|| {
                barrier.wait();
                index.touch(invoice_record(&id), renew_revision);
            });
            scope.spawn(|| {
                barrier.wait();
                index.remove(&AgentId::new(id.as_str()), expiry_revision);
            });
        });

        assert!(
            !index.contains(&AgentId::new(id.as_str())),
            "expired agent {id} is still live"
        );
    }
    assert_eq!(index.partition_len(&invoice), 0);
    assert_eq!(index.live_count(), 0);
}
