// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Types
//!
//! Lifecycle states, work outcomes and the SDK error type.

use bazaar_core::domain::engine::{EngineError, WorkItemId};
use bazaar_core::domain::error::{ErrorClass, MarketplaceError};
use bazaar_core::domain::agent::AgentId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Agent lifecycle.
///
/// ```text
/// INITIALIZING ─publish─▶ DISCOVERING ⇄ PROCESSING
///                              │  ▲
///                  renew/discover fails   recovered
///                              ▼  │
///                          RECONNECTING ─too many failures─▶ STOPPING ─▶ STOPPED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentState {
    Initializing,
    Discovering,
    Processing,
    Reconnecting,
    Stopping,
    Stopped,
}

impl AgentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentState::Initializing => "INITIALIZING",
            AgentState::Discovering => "DISCOVERING",
            AgentState::Processing => "PROCESSING",
            AgentState::Reconnecting => "RECONNECTING",
            AgentState::Stopping => "STOPPING",
            AgentState::Stopped => "STOPPED",
        }
    }
}

/// What a [`crate::agent::WorkHandler`] decided about an item it checked out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkOutcome {
    /// Done; the payload is reported to the engine.
    Completed(serde_json::Value),
    /// Cannot be done here; hand it to another capable agent.
    HandOff { reason: String },
    /// Give the item back to the engine untouched.
    Failed { reason: String },
}

/// Token plus routing data delivered to a handoff target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandoffEnvelope {
    pub token: String,
    pub work_item_id: WorkItemId,
    pub source_agent_id: AgentId,
    pub expires_at: DateTime<Utc>,
}

/// Operation names passed to [`with_deadline`] for registry calls.
pub const REGISTRY_OPERATIONS: &[&str] = &["publish", "renew", "unpublish", "discover", "request_handoff", "acknowledge_handoff"];

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Registry(#[from] MarketplaceError),

    #[error("workflow engine: {0}")]
    Engine(#[from] EngineError),

    #[error("handoff delivery failed: {0}")]
    Delivery(String),

    #[error("{operation} timed out after {timeout:?}")]
    Timeout { operation: &'static str, timeout: Duration },

    #[error("gave up after {attempts} consecutive reconnect attempts")]
    ReconnectExhausted { attempts: u32 },

    #[error("invalid agent configuration: {0}")]
    Config(String),

    #[error("agent task ended abnormally: {0}")]
    Aborted(String),
}

impl AgentError {
    pub fn class(&self) -> ErrorClass {
        match self {
            AgentError::Registry(e) => e.class(),
            AgentError::Engine(e) => e.class(),
            AgentError::Delivery(_) | AgentError::Timeout { .. } => ErrorClass::Transient,
            AgentError::ReconnectExhausted { .. } | AgentError::Config(_) | AgentError::Aborted(_) => {
                ErrorClass::Fatal
            }
        }
    }

    /// Transient failure talking to the registry, the condition that sends an
    /// agent into RECONNECTING. Engine and delivery failures never do.
    pub fn is_registry_outage(&self) -> bool {
        match self {
            AgentError::Registry(e) => e.class() == ErrorClass::Transient,
            AgentError::Timeout { operation, .. } => REGISTRY_OPERATIONS.contains(operation),
            _ => false,
        }
    }

    /// Whether the registry no longer holds this agent's lease.
    pub fn is_lease_lost(&self) -> bool {
        matches!(
            self,
            AgentError::Registry(MarketplaceError::LeaseNotFound(_) | MarketplaceError::AgentNotFound(_))
        )
    }
}

/// Run `fut` under `timeout`, mapping elapsed time to [`AgentError::Timeout`].
pub async fn with_deadline<T, E, F>(operation: &'static str, timeout: Duration, fut: F) -> Result<T, AgentError>
where
    F: std::future::Future<Output = Result<T, E>>,
    E: Into<AgentError>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result.map_err(Into::into),
        Err(_) => Err(AgentError::Timeout { operation, timeout }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        let lost = AgentError::Registry(MarketplaceError::LeaseNotFound(AgentId::new("a1")));
        assert!(lost.is_lease_lost());
        assert_eq!(lost.class(), ErrorClass::Expired);

        let owned = AgentError::Engine(EngineError::AlreadyOwned {
            item: WorkItemId::new("wi-1"),
            owner: AgentId::new("a2"),
        });
        assert_eq!(owned.class(), ErrorClass::Conflict);
        assert!(!owned.is_lease_lost());

        assert_eq!(AgentError::ReconnectExhausted { attempts: 5 }.class(), ErrorClass::Fatal);
    }

    #[test]
    fn test_registry_outage_detection() {
        let down = AgentError::Registry(MarketplaceError::Unavailable("down".into()));
        assert!(down.is_registry_outage());
        let slow_renew = AgentError::Timeout {
            operation: "renew",
            timeout: Duration::from_secs(5),
        };
        assert!(slow_renew.is_registry_outage());
        let slow_engine = AgentError::Timeout {
            operation: "checkout",
            timeout: Duration::from_secs(5),
        };
        assert!(!slow_engine.is_registry_outage());
        assert!(!AgentError::Engine(EngineError::Unavailable("x".into())).is_registry_outage());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_maps_to_timeout() {
        let slow = async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok::<_, AgentError>(())
        };
        let err = with_deadline("renew", Duration::from_secs(1), slow).await.unwrap_err();
        assert!(matches!(err, AgentError::Timeout { operation: "renew", .. }));
        assert_eq!(err.class(), ErrorClass::Transient);
    }
}
