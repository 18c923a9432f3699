// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Workflow Engine Port
//!
//! The engine that enables, owns and persists work items is an external
//! collaborator. The marketplace only reads its records and relies on its
//! checkout being atomic: the engine's owner field is the single source of
//! truth for exclusivity, the partitioner's assignment is advisory.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::domain::agent::{AgentId, Capability};
use crate::domain::error::ErrorClass;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkItemId(String);

impl WorkItemId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorkItemId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Engine-owned view of an enabled or checked-out work item. Never persisted
/// by the marketplace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkItemRecord {
    pub work_item_id: WorkItemId,
    pub required_capability: Capability,
    pub enabled_at: DateTime<Utc>,
    pub owner_agent_id: Option<AgentId>,
    pub checkout_expires_at: Option<DateTime<Utc>>,
}

impl WorkItemRecord {
    pub fn enabled(id: impl Into<String>, capability: impl Into<Capability>) -> Self {
        Self {
            work_item_id: WorkItemId::new(id),
            required_capability: capability.into(),
            enabled_at: Utc::now(),
            owner_agent_id: None,
            checkout_expires_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("work item {item} already owned by {owner}")]
    AlreadyOwned { item: WorkItemId, owner: AgentId },

    #[error("work item {0} not found")]
    NotFound(WorkItemId),

    #[error("agent {agent} does not own work item {item}")]
    NotOwner { item: WorkItemId, agent: AgentId },

    #[error("work item {0} already completed")]
    AlreadyTerminal(WorkItemId),

    #[error("workflow engine unavailable: {0}")]
    Unavailable(String),
}

impl EngineError {
    pub fn class(&self) -> ErrorClass {
        match self {
            EngineError::AlreadyOwned { .. } | EngineError::NotOwner { .. } | EngineError::AlreadyTerminal(_) => {
                ErrorClass::Conflict
            }
            EngineError::NotFound(_) => ErrorClass::Expired,
            EngineError::Unavailable(_) => ErrorClass::Transient,
        }
    }
}

#[async_trait]
pub trait WorkflowEngine: Send + Sync {
    /// Enabled (unowned, or owned with an expired checkout) items requiring `capability`.
    async fn list_enabled_work_items(&self, capability: &Capability) -> Result<Vec<WorkItemRecord>, EngineError>;

    /// Atomic, single-owner claim.
    async fn checkout(&self, item: &WorkItemId, agent: &AgentId) -> Result<WorkItemRecord, EngineError>;

    async fn complete(
        &self,
        item: &WorkItemId,
        agent: &AgentId,
        result: serde_json::Value,
    ) -> Result<(), EngineError>;

    /// Release the checkout so the item is enabled again.
    async fn rollback(&self, item: &WorkItemId, agent: &AgentId) -> Result<(), EngineError>;
}
