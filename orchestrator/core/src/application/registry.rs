// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use async_trait::async_trait;
use std::sync::Arc;

use crate::application::handoff::HandoffCoordinator;
use crate::application::marketplace::AgentMarketplace;
use crate::domain::agent::{AgentId, DiscoveryPage, DiscoveryQuery, PublishRequest};
use crate::domain::error::MarketplaceError;
use crate::domain::handoff::{HandoffAck, HandoffGrant, HandoffRequest};
use crate::domain::lease::LeaseId;

/// The registry operations an agent needs, whether the registry runs in the
/// same process ([`RegistryService`]) or behind the REST API (the SDK client).
#[async_trait]
pub trait RegistryApi: Send + Sync {
    async fn publish(&self, request: PublishRequest) -> Result<LeaseId, MarketplaceError>;

    async fn renew(&self, agent_id: &AgentId, lease_id: LeaseId) -> Result<(), MarketplaceError>;

    async fn unpublish(&self, agent_id: &AgentId) -> Result<(), MarketplaceError>;

    async fn discover(&self, query: DiscoveryQuery) -> Result<DiscoveryPage, MarketplaceError>;

    async fn request_handoff(&self, request: HandoffRequest) -> Result<HandoffGrant, MarketplaceError>;

    async fn acknowledge_handoff(
        &self,
        token: &str,
        acting_agent: Option<&AgentId>,
    ) -> Result<HandoffAck, MarketplaceError>;
}

/// In-process [`RegistryApi`].
#[derive(Clone)]
pub struct RegistryService {
    marketplace: Arc<AgentMarketplace>,
    handoff: Arc<HandoffCoordinator>,
}

impl RegistryService {
    pub fn new(marketplace: Arc<AgentMarketplace>, handoff: Arc<HandoffCoordinator>) -> Self {
        Self { marketplace, handoff }
    }

    pub fn marketplace(&self) -> &Arc<AgentMarketplace> {
        &self.marketplace
    }

    pub fn handoff(&self) -> &Arc<HandoffCoordinator> {
        &self.handoff
    }
}

#[async_trait]
impl RegistryApi for RegistryService {
    async fn publish(&self, request: PublishRequest) -> Result<LeaseId, MarketplaceError> {
        self.marketplace.publish(request).await
    }

    async fn renew(&self, agent_id: &AgentId, lease_id: LeaseId) -> Result<(), MarketplaceError> {
        self.marketplace.renew(agent_id, lease_id).await
    }

    async fn unpublish(&self, agent_id: &AgentId) -> Result<(), MarketplaceError> {
        self.marketplace.unpublish(agent_id).await
    }

    async fn discover(&self, query: DiscoveryQuery) -> Result<DiscoveryPage, MarketplaceError> {
        self.marketplace.discover(query).await
    }

    async fn request_handoff(&self, request: HandoffRequest) -> Result<HandoffGrant, MarketplaceError> {
        let token = self.handoff.issue(request).await?;
        Ok(HandoffGrant::from(&token))
    }

    async fn acknowledge_handoff(
        &self,
        token: &str,
        acting_agent: Option<&AgentId>,
    ) -> Result<HandoffAck, MarketplaceError> {
        let claims = self.handoff.accept(token, acting_agent)?;
        Ok(HandoffAck::from(&claims))
    }
}
