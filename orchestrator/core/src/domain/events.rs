// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

use crate::domain::agent::{AgentId, Capability};
use crate::domain::engine::WorkItemId;
use crate::domain::lease::{LeaseId, Revision};

/// Agent listing lifecycle events, published as they are applied to the
/// liveness index. Together with [`HandoffEvent`] they form the audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RegistryEvent {
    AgentPublished {
        agent_id: AgentId,
        lease_id: LeaseId,
        capabilities: BTreeSet<Capability>,
        revision: Revision,
        published_at: DateTime<Utc>,
    },
    AgentRenewed {
        agent_id: AgentId,
        lease_id: LeaseId,
        renewed_at: DateTime<Utc>,
    },
    AgentUnpublished {
        agent_id: AgentId,
        unpublished_at: DateTime<Utc>,
    },
    /// Lease expired without renewal; observed through the watch stream.
    AgentExpired {
        agent_id: AgentId,
        revision: Revision,
        expired_at: DateTime<Utc>,
    },
    IndexDegraded {
        reason: String,
        degraded_at: DateTime<Utc>,
    },
    IndexResynced {
        live_agents: usize,
        revision: Revision,
        resynced_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HandoffEvent {
    HandoffIssued {
        token_id: Uuid,
        work_item_id: WorkItemId,
        source_agent_id: AgentId,
        target_agent_id: AgentId,
        expires_at: DateTime<Utc>,
    },
    HandoffAccepted {
        token_id: Uuid,
        work_item_id: WorkItemId,
        target_agent_id: AgentId,
        accepted_at: DateTime<Utc>,
    },
    HandoffRejected {
        work_item_id: Option<WorkItemId>,
        reason: String,
        rejected_at: DateTime<Utc>,
    },
}
