// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Error Taxonomy
//!
//! Every error crossing a component boundary classifies itself into one of four
//! [`ErrorClass`]es. Callers branch on the class, never on message text:
//!
//! | Class | Examples | Expected reaction |
//! |-------|----------|-------------------|
//! | `Transient` | timeout, store unavailable | retry with backoff |
//! | `Conflict` | duplicate agent id, item already owned | re-discover, do not retry blindly |
//! | `Expired` | lease or token past TTL | normal lifecycle event |
//! | `Fatal` | bad signature, invalid input | log and surface |

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::domain::agent::{AgentId, IdentityError};
use crate::domain::lease::LeaseStoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Transient,
    Conflict,
    Expired,
    Fatal,
}

impl ErrorClass {
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorClass::Transient)
    }
}

/// Errors surfaced by the registry facade (marketplace + handoff).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MarketplaceError {
    #[error("agent {0} is already live")]
    DuplicateAgentId(AgentId),

    #[error("no live lease for agent {0}")]
    LeaseNotFound(AgentId),

    #[error("agent {0} not found")]
    AgentNotFound(AgentId),

    #[error("handoff target {0} is not live")]
    TargetNotLive(AgentId),

    #[error("handoff token invalid: {0}")]
    TokenInvalid(String),

    #[error("handoff token signature rejected: {0}")]
    TokenSignature(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("{operation} timed out after {timeout:?}")]
    Timeout { operation: &'static str, timeout: Duration },

    #[error("registry unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Store(#[from] LeaseStoreError),
}

impl MarketplaceError {
    pub fn class(&self) -> ErrorClass {
        match self {
            MarketplaceError::DuplicateAgentId(_) | MarketplaceError::TargetNotLive(_) => ErrorClass::Conflict,
            MarketplaceError::LeaseNotFound(_)
            | MarketplaceError::AgentNotFound(_)
            | MarketplaceError::TokenInvalid(_) => ErrorClass::Expired,
            MarketplaceError::TokenSignature(_) | MarketplaceError::InvalidRequest(_) => ErrorClass::Fatal,
            MarketplaceError::Timeout { .. } | MarketplaceError::Unavailable(_) => ErrorClass::Transient,
            MarketplaceError::Store(e) => e.class(),
        }
    }
}

impl MarketplaceError {
    /// Stable machine-readable code carried in API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            MarketplaceError::DuplicateAgentId(_) => "duplicate_agent_id",
            MarketplaceError::LeaseNotFound(_) => "lease_not_found",
            MarketplaceError::AgentNotFound(_) => "agent_not_found",
            MarketplaceError::TargetNotLive(_) => "target_not_live",
            MarketplaceError::TokenInvalid(_) => "token_invalid",
            MarketplaceError::TokenSignature(_) => "token_signature",
            MarketplaceError::InvalidRequest(_) => "invalid_request",
            MarketplaceError::Timeout { .. } => "timeout",
            MarketplaceError::Unavailable(_) => "unavailable",
            MarketplaceError::Store(e) => match e {
                LeaseStoreError::LeaseNotFound(_) => "lease_not_found",
                LeaseStoreError::KeyExists(_) => "duplicate_agent_id",
                LeaseStoreError::InvalidRequest(_) => "invalid_request",
                _ => "unavailable",
            },
        }
    }
}

impl From<IdentityError> for MarketplaceError {
    fn from(err: IdentityError) -> Self {
        MarketplaceError::InvalidRequest(err.to_string())
    }
}

/// Run `fut` under `timeout`, mapping elapsed time to [`MarketplaceError::Timeout`].
pub async fn with_timeout<T, E, F>(operation: &'static str, timeout: Duration, fut: F) -> Result<T, MarketplaceError>
where
    F: std::future::Future<Output = Result<T, E>>,
    E: Into<MarketplaceError>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result.map_err(Into::into),
        Err(_) => Err(MarketplaceError::Timeout { operation, timeout }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::lease::LeaseId;

    #[test]
    fn test_error_classes() {
        let id = AgentId::new("a1");
        assert_eq!(MarketplaceError::DuplicateAgentId(id.clone()).class(), ErrorClass::Conflict);
        assert_eq!(MarketplaceError::LeaseNotFound(id).class(), ErrorClass::Expired);
        assert_eq!(MarketplaceError::TokenSignature("bad".into()).class(), ErrorClass::Fatal);
        assert_eq!(
            MarketplaceError::Store(LeaseStoreError::Unavailable("down".into())).class(),
            ErrorClass::Transient
        );
        assert_eq!(
            MarketplaceError::Store(LeaseStoreError::LeaseNotFound(LeaseId(7))).class(),
            ErrorClass::Expired
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_timeout_maps_elapsed() {
        let result: Result<(), MarketplaceError> = with_timeout("renew", Duration::from_millis(50), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<(), MarketplaceError>(())
        })
        .await;

        assert!(matches!(result, Err(MarketplaceError::Timeout { operation: "renew", .. })));
        assert!(result.unwrap_err().class().is_retryable());
    }
}
