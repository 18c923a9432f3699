// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Concurrent checkout stress: many agents racing for one enabled item must
//! produce exactly one owner.

use bazaar_core::domain::agent::AgentId;
use bazaar_core::domain::engine::{EngineError, WorkItemId, WorkItemRecord, WorkflowEngine};
use bazaar_core::infrastructure::engine::InMemoryWorkflowEngine;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Barrier;

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_fifty_agents_one_item_exactly_one_checkout() {
    let engine = Arc::new(InMemoryWorkflowEngine::new(Duration::from_secs(60)));
    engine.enable(WorkItemRecord::enabled("wi-invoice-1", "invoice"));
    let item = WorkItemId::new("wi-invoice-1");
    let barrier = Arc::new(Barrier::new(50));

    let mut handles = Vec::new();
    for i in 0..50 {
        let engine = engine.clone();
        let item = item.clone();
        let barrier = barrier.clone();
        handles.push(tokio::spawn(async move {
            barrier.wait().await;
            engine.checkout(&item, &AgentId::new(format!("agent-{i}"))).await
        }));
    }

    let mut winners = 0;
    let mut already_owned = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => winners += 1,
            Err(EngineError::AlreadyOwned { .. }) => already_owned += 1,
            Err(other) => panic!("unexpected checkout error: {other}"),
        }
    }

    assert_eq!(winners, 1);
    assert_eq!(already_owned, 49);
    assert_eq!(engine.checkout_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_ownership_never_overlaps_across_rollbacks() {
    let engine = Arc::new(InMemoryWorkflowEngine::new(Duration::from_secs(60)));
    engine.enable(WorkItemRecord::enabled("wi-1", "invoice"));
    let item = WorkItemId::new("wi-1");
    let holders = Arc::new(std::sync::atomic::AtomicUsize::new(0));

    let mut handles = Vec::new();
    for i in 0..16 {
        let engine = engine.clone();
        let item = item.clone();
        let holders = holders.clone();
        handles.push(tokio::spawn(async move {
            let agent = AgentId::new(format!("agent-{i}"));
            for _ in 0..50 {
                if engine.checkout(&item, &agent).await.is_ok() {
                    let concurrent = holders.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    assert_eq!(concurrent, 0, "two agents held the same item");
                    tokio::task::yield_now().await;
                    holders.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
                    engine.rollback(&item, &agent).await.unwrap();
                }
                tokio::task::yield_now().await;
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
    assert!(engine.checkout_count() >= 1);
}
