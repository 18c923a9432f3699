// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Handoff Tokens
//!
//! A handoff moves an owned-but-unworkable item from a source agent to a
//! capable, live target. The token is the only state the protocol needs: it is
//! signed, short-lived and single-use, so a target that never acknowledges
//! simply lets the item fall back into normal discovery.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::agent::{AgentId, Capability};
use crate::domain::engine::WorkItemId;

/// Signed claim set. Field names are kept short since they travel in every token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandoffClaims {
    /// Token id, consumed on first acknowledgement.
    pub jti: Uuid,
    pub wid: WorkItemId,
    pub src: AgentId,
    pub tgt: AgentId,
    pub iat: i64,
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cap: Option<Capability>,
}

impl HandoffClaims {
    pub fn expires_at(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.exp, 0).single().unwrap_or_else(Utc::now)
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.iat, 0).single().unwrap_or_else(Utc::now)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now.timestamp() >= self.exp
    }
}

/// A minted handoff: the decoded view plus the compact signed form that is
/// actually delivered to the target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandoffToken {
    pub token_id: Uuid,
    pub work_item_id: WorkItemId,
    pub source_agent_id: AgentId,
    pub target_agent_id: AgentId,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Compact JWS binding `{workItemId, targetAgentId, expiresAt}`.
    pub signature: String,
}

impl HandoffToken {
    pub fn from_claims(claims: &HandoffClaims, signature: String) -> Self {
        Self {
            token_id: claims.jti,
            work_item_id: claims.wid.clone(),
            source_agent_id: claims.src.clone(),
            target_agent_id: claims.tgt.clone(),
            issued_at: claims.issued_at(),
            expires_at: claims.expires_at(),
            signature,
        }
    }
}

/// Body of `POST /handoff`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandoffRequest {
    pub work_item_id: WorkItemId,
    pub source_agent_id: AgentId,
    pub target_agent_id: AgentId,
    /// When set, the target must advertise this capability.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability: Option<Capability>,
}

/// Response of `POST /handoff`: the compact token to deliver to the target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandoffGrant {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl From<&HandoffToken> for HandoffGrant {
    fn from(token: &HandoffToken) -> Self {
        Self {
            token: token.signature.clone(),
            expires_at: token.expires_at,
        }
    }
}

/// Response of `POST /handoff/{token}/ack`: the verified, now consumed claims.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandoffAck {
    pub token_id: Uuid,
    pub work_item_id: WorkItemId,
    pub source_agent_id: AgentId,
    pub target_agent_id: AgentId,
    pub expires_at: DateTime<Utc>,
}

impl From<&HandoffClaims> for HandoffAck {
    fn from(claims: &HandoffClaims) -> Self {
        Self {
            token_id: claims.jti,
            work_item_id: claims.wid.clone(),
            source_agent_id: claims.src.clone(),
            target_agent_id: claims.tgt.clone(),
            expires_at: claims.expires_at(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claims_expiry_boundary() {
        let now = Utc::now();
        let claims = HandoffClaims {
            jti: Uuid::new_v4(),
            wid: WorkItemId::new("wi-1"),
            src: AgentId::new("a1"),
            tgt: AgentId::new("a2"),
            iat: now.timestamp(),
            exp: now.timestamp() + 30,
            cap: None,
        };

        assert!(!claims.is_expired_at(now));
        assert!(claims.is_expired_at(now + chrono::Duration::seconds(30)));
        assert_eq!(claims.expires_at().timestamp(), claims.exp);
    }
}
