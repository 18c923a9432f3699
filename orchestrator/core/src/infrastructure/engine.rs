// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// In-Memory Workflow Engine
//
// Reference implementation of the WorkflowEngine port for tests and embedded
// demos. Checkout is atomic per item (the DashMap shard lock serialises
// concurrent claims) and time-bounded: an expired checkout is reclaimable.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info};

use crate::domain::agent::{AgentId, Capability};
use crate::domain::engine::{EngineError, WorkItemId, WorkItemRecord, WorkflowEngine};

struct ItemState {
    record: WorkItemRecord,
    result: Option<serde_json::Value>,
}

impl ItemState {
    fn checkout_live(&self) -> bool {
        match (&self.record.owner_agent_id, self.record.checkout_expires_at) {
            (Some(_), Some(expires_at)) => expires_at > Utc::now(),
            (Some(_), None) => true,
            _ => false,
        }
    }
}

pub struct InMemoryWorkflowEngine {
    items: DashMap<WorkItemId, ItemState>,
    checkout_ttl: Duration,
    checkouts: AtomicU64,
}

impl InMemoryWorkflowEngine {
    pub fn new(checkout_ttl: Duration) -> Self {
        Self {
            items: DashMap::new(),
            checkout_ttl,
            checkouts: AtomicU64::new(0),
        }
    }

    /// Make an item available for checkout.
    pub fn enable(&self, record: WorkItemRecord) {
        debug!(work_item_id = %record.work_item_id, capability = %record.required_capability, "Work item enabled");
        self.items.insert(
            record.work_item_id.clone(),
            ItemState {
                record,
                result: None,
            },
        );
    }

    pub fn get(&self, item: &WorkItemId) -> Option<WorkItemRecord> {
        self.items.get(item).map(|state| state.record.clone())
    }

    pub fn result(&self, item: &WorkItemId) -> Option<serde_json::Value> {
        self.items.get(item).and_then(|state| state.result.clone())
    }

    pub fn is_completed(&self, item: &WorkItemId) -> bool {
        self.items.get(item).map(|state| state.result.is_some()).unwrap_or(false)
    }

    /// Successful checkouts since creation.
    pub fn checkout_count(&self) -> u64 {
        self.checkouts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WorkflowEngine for InMemoryWorkflowEngine {
    async fn list_enabled_work_items(&self, capability: &Capability) -> Result<Vec<WorkItemRecord>, EngineError> {
        let mut items: Vec<WorkItemRecord> = self
            .items
            .iter()
            .filter(|state| {
                state.result.is_none() && &state.record.required_capability == capability && !state.checkout_live()
            })
            .map(|state| state.record.clone())
            .collect();
        items.sort_by(|a, b| a.enabled_at.cmp(&b.enabled_at).then_with(|| a.work_item_id.cmp(&b.work_item_id)));
        Ok(items)
    }

    async fn checkout(&self, item: &WorkItemId, agent: &AgentId) -> Result<WorkItemRecord, EngineError> {
        let mut state = self
            .items
            .get_mut(item)
            .ok_or_else(|| EngineError::NotFound(item.clone()))?;
        if state.result.is_some() {
            return Err(EngineError::NotFound(item.clone()));
        }
        if state.checkout_live() {
            if let Some(owner) = &state.record.owner_agent_id {
                if owner != agent {
                    return Err(EngineError::AlreadyOwned {
                        item: item.clone(),
                        owner: owner.clone(),
                    });
                }
            }
        }

        let expires_at = chrono::Duration::from_std(self.checkout_ttl)
            .ok()
            .map(|ttl| Utc::now() + ttl);
        state.record.owner_agent_id = Some(agent.clone());
        state.record.checkout_expires_at = expires_at;
        self.checkouts.fetch_add(1, Ordering::SeqCst);
        info!(work_item_id = %item, agent_id = %agent, "Work item checked out");
        Ok(state.record.clone())
    }

    async fn complete(
        &self,
        item: &WorkItemId,
        agent: &AgentId,
        result: serde_json::Value,
    ) -> Result<(), EngineError> {
        let mut state = self
            .items
            .get_mut(item)
            .ok_or_else(|| EngineError::NotFound(item.clone()))?;
        if state.result.is_some() {
            return Err(EngineError::AlreadyTerminal(item.clone()));
        }
        if state.record.owner_agent_id.as_ref() != Some(agent) {
            return Err(EngineError::NotOwner {
                item: item.clone(),
                agent: agent.clone(),
            });
        }
        state.result = Some(result);
        state.record.checkout_expires_at = None;
        info!(work_item_id = %item, agent_id = %agent, "Work item completed");
        Ok(())
    }

    async fn rollback(&self, item: &WorkItemId, agent: &AgentId) -> Result<(), EngineError> {
        let mut state = self
            .items
            .get_mut(item)
            .ok_or_else(|| EngineError::NotFound(item.clone()))?;
        if state.result.is_some() || state.record.owner_agent_id.as_ref() != Some(agent) {
            return Err(EngineError::NotOwner {
                item: item.clone(),
                agent: agent.clone(),
            });
        }
        state.record.owner_agent_id = None;
        state.record.checkout_expires_at = None;
        info!(work_item_id = %item, agent_id = %agent, "Work item rolled back");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine_with(item: &str) -> InMemoryWorkflowEngine {
        let engine = InMemoryWorkflowEngine::new(Duration::from_secs(60));
        engine.enable(WorkItemRecord::enabled(item, "invoice"));
        engine
    }

    #[tokio::test]
    async fn test_checkout_is_exclusive() {
        let engine = engine_with("wi-1");
        let item = WorkItemId::new("wi-1");
        engine.checkout(&item, &AgentId::new("a1")).await.unwrap();

        let err = engine.checkout(&item, &AgentId::new("a2")).await.unwrap_err();
        assert_eq!(
            err,
            EngineError::AlreadyOwned {
                item: item.clone(),
                owner: AgentId::new("a1")
            }
        );
        assert!(engine
            .list_enabled_work_items(&Capability::new("invoice"))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_rollback_reenables() {
        let engine = engine_with("wi-1");
        let item = WorkItemId::new("wi-1");
        engine.checkout(&item, &AgentId::new("a1")).await.unwrap();

        assert!(matches!(
            engine.rollback(&item, &AgentId::new("a2")).await,
            Err(EngineError::NotOwner { .. })
        ));
        engine.rollback(&item, &AgentId::new("a1")).await.unwrap();
        assert_eq!(
            engine
                .list_enabled_work_items(&Capability::new("invoice"))
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_complete_is_terminal() {
        let engine = engine_with("wi-1");
        let item = WorkItemId::new("wi-1");
        let agent = AgentId::new("a1");
        engine.checkout(&item, &agent).await.unwrap();
        engine.complete(&item, &agent, serde_json::json!({"ok": true})).await.unwrap();

        assert_eq!(
            engine.complete(&item, &agent, serde_json::json!({})).await,
            Err(EngineError::AlreadyTerminal(item.clone()))
        );
        assert!(matches!(
            engine.checkout(&item, &AgentId::new("a2")).await,
            Err(EngineError::NotFound(_))
        ));
        assert_eq!(engine.result(&item), Some(serde_json::json!({"ok": true})));
    }

    #[tokio::test]
    async fn test_expired_checkout_is_reclaimable() {
        let engine = InMemoryWorkflowEngine::new(Duration::ZERO);
        engine.enable(WorkItemRecord::enabled("wi-1", "invoice"));
        let item = WorkItemId::new("wi-1");
        engine.checkout(&item, &AgentId::new("a1")).await.unwrap();

        let record = engine.checkout(&item, &AgentId::new("a2")).await.unwrap();
        assert_eq!(record.owner_agent_id, Some(AgentId::new("a2")));
    }
}
