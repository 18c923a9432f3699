// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Handoff Coordinator
//!
//! Mints and redeems single-use handoff tokens.
//!
//! Issue records the token id as outstanding; the first successful
//! acknowledgement removes it atomically, so a replay (before or after
//! expiry) finds nothing and is rejected with `TokenInvalid`. A target that
//! never acknowledges simply lets the entry age out; the work item has
//! already been rolled back by the source and returns through discovery.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::application::marketplace::AgentMarketplace;
use crate::domain::agent::AgentId;
use crate::domain::error::MarketplaceError;
use crate::domain::events::HandoffEvent;
use crate::domain::handoff::{HandoffClaims, HandoffRequest, HandoffToken};
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::handoff_signer::HandoffSigner;

pub struct HandoffCoordinator {
    marketplace: Arc<AgentMarketplace>,
    signer: HandoffSigner,
    token_ttl: Duration,
    outstanding: DashMap<Uuid, DateTime<Utc>>,
    events: EventBus,
}

impl HandoffCoordinator {
    pub fn new(
        marketplace: Arc<AgentMarketplace>,
        signer: HandoffSigner,
        token_ttl: Duration,
        events: EventBus,
    ) -> Self {
        Self {
            marketplace,
            signer,
            token_ttl,
            outstanding: DashMap::new(),
            events,
        }
    }

    pub fn token_ttl(&self) -> Duration {
        self.token_ttl
    }

    pub fn outstanding_count(&self) -> usize {
        self.outstanding.len()
    }

    fn reject(&self, request: Option<&HandoffRequest>, err: MarketplaceError) -> MarketplaceError {
        warn!(error = %err, "Handoff rejected");
        self.events.publish_handoff_event(HandoffEvent::HandoffRejected {
            work_item_id: request.map(|r| r.work_item_id.clone()),
            reason: err.to_string(),
            rejected_at: Utc::now(),
        });
        err
    }

    /// Mint a token handing `work_item_id` from source to a live target.
    ///
    /// # Errors
    ///
    /// - [`MarketplaceError::TargetNotLive`] if the target holds no live lease
    /// - [`MarketplaceError::InvalidRequest`] for self-handoff or a target lacking the capability
    pub async fn issue(&self, request: HandoffRequest) -> Result<HandoffToken, MarketplaceError> {
        request.source_agent_id.validate()?;
        request.target_agent_id.validate()?;
        if request.source_agent_id == request.target_agent_id {
            return Err(self.reject(
                Some(&request),
                MarketplaceError::InvalidRequest("source and target must differ".to_string()),
            ));
        }

        let target = match self.marketplace.resolve_live(&request.target_agent_id).await? {
            Some(record) => record,
            None => {
                let err = MarketplaceError::TargetNotLive(request.target_agent_id.clone());
                return Err(self.reject(Some(&request), err));
            }
        };
        if let Some(capability) = &request.capability {
            if !target.advertises(capability) {
                let err = MarketplaceError::InvalidRequest(format!(
                    "target {} does not advertise {}",
                    target.agent_id, capability
                ));
                return Err(self.reject(Some(&request), err));
            }
        }

        let now = Utc::now();
        let ttl_secs = i64::try_from(self.token_ttl.as_secs()).unwrap_or(i64::MAX / 2);
        let claims = HandoffClaims {
            jti: Uuid::new_v4(),
            wid: request.work_item_id,
            src: request.source_agent_id,
            tgt: request.target_agent_id,
            iat: now.timestamp(),
            exp: now.timestamp().saturating_add(ttl_secs),
            cap: request.capability,
        };
        let signature = self.signer.sign(&claims)?;
        let token = HandoffToken::from_claims(&claims, signature);
        self.outstanding.insert(token.token_id, token.expires_at);

        metrics::counter!("bazaar_handoffs_issued_total").increment(1);
        info!(
            token_id = %token.token_id,
            work_item_id = %token.work_item_id,
            source = %token.source_agent_id,
            target = %token.target_agent_id,
            "Handoff token issued"
        );
        self.events.publish_handoff_event(HandoffEvent::HandoffIssued {
            token_id: token.token_id,
            work_item_id: token.work_item_id.clone(),
            source_agent_id: token.source_agent_id.clone(),
            target_agent_id: token.target_agent_id.clone(),
            expires_at: token.expires_at,
        });
        Ok(token)
    }

    /// Verify and consume a token. `acting_agent`, when given, must be the target.
    ///
    /// # Errors
    ///
    /// - [`MarketplaceError::TokenSignature`] for tampered or foreign tokens and wrong recipients
    /// - [`MarketplaceError::TokenInvalid`] for expired, already used or unknown tokens
    pub fn accept(&self, token: &str, acting_agent: Option<&AgentId>) -> Result<HandoffClaims, MarketplaceError> {
        let claims = self.signer.verify(token).map_err(|e| self.reject(None, e))?;

        if claims.is_expired_at(Utc::now()) {
            self.outstanding.remove(&claims.jti);
            return Err(self.reject(None, MarketplaceError::TokenInvalid("token expired".to_string())));
        }
        if let Some(agent) = acting_agent {
            if agent != &claims.tgt {
                let err = MarketplaceError::TokenSignature(format!("token not issued to {}", agent));
                return Err(self.reject(None, err));
            }
        }
        if self.outstanding.remove(&claims.jti).is_none() {
            return Err(self.reject(
                None,
                MarketplaceError::TokenInvalid("token already used or unknown".to_string()),
            ));
        }

        metrics::counter!("bazaar_handoffs_accepted_total").increment(1);
        info!(token_id = %claims.jti, work_item_id = %claims.wid, target = %claims.tgt, "Handoff accepted");
        self.events.publish_handoff_event(HandoffEvent::HandoffAccepted {
            token_id: claims.jti,
            work_item_id: claims.wid.clone(),
            target_agent_id: claims.tgt.clone(),
            accepted_at: Utc::now(),
        });
        Ok(claims)
    }

    /// Forget outstanding tokens past their expiry. Returns the number dropped.
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let before = self.outstanding.len();
        self.outstanding.retain(|_, expires_at| *expires_at > now);
        let purged = before.saturating_sub(self.outstanding.len());
        if purged > 0 {
            debug!(purged, "Purged expired handoff tokens");
        }
        purged
    }

    pub fn spawn_sweeper(self: &Arc<Self>, period: Duration, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        coordinator.purge_expired();
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        })
    }
}
