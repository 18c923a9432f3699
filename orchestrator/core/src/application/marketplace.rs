// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Agent Marketplace
//!
//! Registry facade over the [`LeaseStore`] and the [`LivenessIndex`].
//!
//! Writes go to the store (the single source of truth for liveness) and are
//! mirrored into the index immediately so an agent always reads its own
//! publish. Reads are served from the index partition for the requested
//! capability only.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::domain::agent::{
    AgentId, AgentRecord, Capability, CapabilitySchema, DiscoveryPage, DiscoveryQuery, PublishRequest,
};
use crate::domain::error::{with_timeout, MarketplaceError};
use crate::domain::events::RegistryEvent;
use crate::domain::lease::{KeyValue, LeaseId, LeaseStore, LeaseStoreError};
use crate::domain::node_config::RegistryConfig;
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::liveness_index::LivenessIndex;

pub struct AgentMarketplace {
    store: Arc<dyn LeaseStore>,
    index: Arc<LivenessIndex>,
    schema: CapabilitySchema,
    config: RegistryConfig,
    events: EventBus,
}

impl AgentMarketplace {
    pub fn new(
        store: Arc<dyn LeaseStore>,
        index: Arc<LivenessIndex>,
        schema: CapabilitySchema,
        config: RegistryConfig,
        events: EventBus,
    ) -> Self {
        Self {
            store,
            index,
            schema,
            config,
            events,
        }
    }

    pub fn index(&self) -> &Arc<LivenessIndex> {
        &self.index
    }

    pub fn schema(&self) -> &CapabilitySchema {
        &self.schema
    }

    pub fn live_count(&self) -> usize {
        self.index.live_count()
    }

    pub fn is_degraded(&self) -> bool {
        self.index.is_degraded()
    }

    fn timeout(&self) -> Duration {
        self.config.operation_timeout
    }

    fn resolve_ttl(&self, requested: Option<u64>) -> Result<Duration, MarketplaceError> {
        let ttl = requested.map(Duration::from_secs).unwrap_or(self.config.default_ttl);
        if ttl < self.config.min_ttl || ttl > self.config.max_ttl {
            return Err(MarketplaceError::InvalidRequest(format!(
                "ttl {}s outside [{}s, {}s]",
                ttl.as_secs(),
                self.config.min_ttl.as_secs(),
                self.config.max_ttl.as_secs()
            )));
        }
        Ok(ttl)
    }

    /// Publish a listing under a fresh lease.
    ///
    /// # Errors
    ///
    /// - [`MarketplaceError::DuplicateAgentId`] if the agent already holds a live listing
    /// - [`MarketplaceError::InvalidRequest`] for bad ids, endpoints, capabilities or TTLs
    pub async fn publish(&self, request: PublishRequest) -> Result<LeaseId, MarketplaceError> {
        request.agent_id.validate()?;
        if request.endpoint.trim().is_empty() {
            return Err(MarketplaceError::InvalidRequest("endpoint must not be empty".to_string()));
        }
        self.schema.validate(&request.capabilities)?;
        let ttl = self.resolve_ttl(request.ttl)?;

        let grant = with_timeout("grant", self.timeout(), self.store.grant(ttl)).await?;
        let record = AgentRecord {
            agent_id: request.agent_id.clone(),
            capabilities: request.capabilities,
            endpoint: request.endpoint,
            registered_at: Utc::now(),
            lease_id: grant.id,
            ttl_seconds: ttl.as_secs(),
        };
        let value = serde_json::to_vec(&record)
            .map_err(|e| MarketplaceError::InvalidRequest(format!("unencodable record: {}", e)))?;
        let key = self.index.key_for(&record.agent_id);

        let created = with_timeout("publish", self.timeout(), self.store.create(&key, value, Some(grant.id))).await;
        let revision = match created {
            Ok(revision) => revision,
            Err(e) => {
                // The lease is useless without its key
                if let Err(revoke_err) = self.store.revoke(grant.id).await {
                    debug!(lease_id = %grant.id, "Failed to revoke orphaned lease: {}", revoke_err);
                }
                return Err(match e {
                    MarketplaceError::Store(LeaseStoreError::KeyExists(_)) => {
                        MarketplaceError::DuplicateAgentId(record.agent_id)
                    }
                    other => other,
                });
            }
        };

        self.index.upsert(record.clone(), revision);
        metrics::counter!("bazaar_agents_published_total").increment(1);
        info!(
            agent_id = %record.agent_id,
            lease_id = %grant.id,
            ttl_seconds = record.ttl_seconds,
            "Agent published"
        );
        self.events.publish_registry_event(RegistryEvent::AgentPublished {
            agent_id: record.agent_id,
            lease_id: grant.id,
            capabilities: record.capabilities,
            revision,
            published_at: record.registered_at,
        });
        Ok(grant.id)
    }

    /// Read the authoritative listing for `agent_id` from the store.
    async fn load(&self, agent_id: &AgentId) -> Result<Option<(KeyValue, AgentRecord)>, MarketplaceError> {
        let key = self.index.key_for(agent_id);
        let Some(kv) = with_timeout("get", self.timeout(), self.store.get(&key)).await? else {
            return Ok(None);
        };
        let record: AgentRecord = serde_json::from_slice(&kv.value)
            .map_err(|e| MarketplaceError::Unavailable(format!("corrupt listing for {}: {}", agent_id, e)))?;
        Ok(Some((kv, record)))
    }

    /// Extend the agent's lease by a full TTL. Safe to repeat; never revives
    /// a lease that has already expired.
    pub async fn renew(&self, agent_id: &AgentId, lease_id: LeaseId) -> Result<(), MarketplaceError> {
        let (kv, record) = match self.load(agent_id).await? {
            Some((kv, record)) if kv.lease == Some(lease_id) => (kv, record),
            _ => return Err(MarketplaceError::LeaseNotFound(agent_id.clone())),
        };

        with_timeout("renew", self.timeout(), self.store.keep_alive(lease_id))
            .await
            .map_err(|e| match e {
                MarketplaceError::Store(LeaseStoreError::LeaseNotFound(_)) => {
                    MarketplaceError::LeaseNotFound(agent_id.clone())
                }
                other => other,
            })?;

        self.index.touch(record, kv.mod_revision);
        metrics::counter!("bazaar_lease_renewals_total").increment(1);
        debug!(agent_id = %agent_id, lease_id = %lease_id, "Lease renewed");
        self.events.publish_registry_event(RegistryEvent::AgentRenewed {
            agent_id: agent_id.clone(),
            lease_id,
            renewed_at: Utc::now(),
        });
        Ok(())
    }

    /// Remove the listing and its lease. Absent agents are not an error.
    pub async fn unpublish(&self, agent_id: &AgentId) -> Result<(), MarketplaceError> {
        agent_id.validate()?;
        let key = self.index.key_for(agent_id);
        let existing = with_timeout("get", self.timeout(), self.store.get(&key)).await?;
        let Some(kv) = existing else {
            debug!(agent_id = %agent_id, "Unpublish of absent agent");
            return Ok(());
        };

        if let Some(revision) = with_timeout("unpublish", self.timeout(), self.store.delete(&key)).await? {
            self.index.remove(agent_id, revision);
        }
        if let Some(lease_id) = kv.lease {
            if let Err(e) = with_timeout("revoke", self.timeout(), self.store.revoke(lease_id)).await {
                warn!(agent_id = %agent_id, lease_id = %lease_id, "Lease revoke after unpublish failed: {}", e);
            }
        }

        metrics::counter!("bazaar_agents_unpublished_total").increment(1);
        info!(agent_id = %agent_id, "Agent unpublished");
        self.events.publish_registry_event(RegistryEvent::AgentUnpublished {
            agent_id: agent_id.clone(),
            unpublished_at: Utc::now(),
        });
        Ok(())
    }

    /// Page through live agents advertising a capability. Reads only the
    /// capability's index partition.
    pub async fn discover(&self, query: DiscoveryQuery) -> Result<DiscoveryPage, MarketplaceError> {
        let capability = Capability::parse(query.capability.as_str())?;
        let limit = query.limit.min(self.config.max_page_size);
        let (agents, total) = self.index.page(&capability, limit, query.offset);
        Ok(DiscoveryPage {
            agents,
            total,
            stale: self.index.is_degraded(),
        })
    }

    /// Cached listing for one agent.
    pub fn get(&self, agent_id: &AgentId) -> Result<AgentRecord, MarketplaceError> {
        self.index
            .get(agent_id)
            .map(|entry| entry.record)
            .ok_or_else(|| MarketplaceError::AgentNotFound(agent_id.clone()))
    }

    /// Authoritative liveness check against the store.
    pub async fn resolve_live(&self, agent_id: &AgentId) -> Result<Option<AgentRecord>, MarketplaceError> {
        Ok(self.load(agent_id).await?.map(|(_, record)| record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::lease::Revision;
    use crate::domain::node_config::{LeaseStoreConfig, LivenessConfig};
    use crate::infrastructure::lease_store::InMemoryLeaseStore;

    const PREFIX: &str = "/bazaar/agents/";

    fn marketplace() -> (AgentMarketplace, Arc<InMemoryLeaseStore>) {
        let store = Arc::new(InMemoryLeaseStore::new(&LeaseStoreConfig::default()));
        let events = EventBus::new(64);
        let index = Arc::new(LivenessIndex::new(PREFIX, LivenessConfig::default(), events.clone()));
        let schema = CapabilitySchema::new(["invoice", "shipping"]).unwrap();
        let marketplace = AgentMarketplace::new(store.clone(), index, schema, RegistryConfig::default(), events);
        (marketplace, store)
    }

    #[tokio::test]
    async fn test_publish_then_discover_reads_own_write() {
        let (marketplace, _) = marketplace();
        let lease = marketplace
            .publish(PublishRequest::new("a1", ["invoice"], "http://a1").with_ttl(60))
            .await
            .unwrap();

        let page = marketplace.discover(DiscoveryQuery::new("invoice")).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.agents[0].lease_id, lease);
        assert_eq!(marketplace.get(&AgentId::new("a1")).unwrap().ttl_seconds, 60);
    }

    #[tokio::test]
    async fn test_duplicate_publish_rejected() {
        let (marketplace, store) = marketplace();
        marketplace
            .publish(PublishRequest::new("a1", ["invoice"], "http://a1"))
            .await
            .unwrap();
        let err = marketplace
            .publish(PublishRequest::new("a1", ["shipping"], "http://a1b"))
            .await
            .unwrap_err();
        assert_eq!(err, MarketplaceError::DuplicateAgentId(AgentId::new("a1")));
        // The losing lease was revoked
        assert_eq!(store.lease_count(), 1);
    }

    #[tokio::test]
    async fn test_publish_validation() {
        let (marketplace, _) = marketplace();
        let unknown = marketplace
            .publish(PublishRequest::new("a1", ["payroll"], "http://a1"))
            .await;
        assert!(matches!(unknown, Err(MarketplaceError::InvalidRequest(_))));

        let no_caps = marketplace
            .publish(PublishRequest::new("a1", Vec::<&str>::new(), "http://a1"))
            .await;
        assert!(matches!(no_caps, Err(MarketplaceError::InvalidRequest(_))));

        let short_ttl = marketplace
            .publish(PublishRequest::new("a1", ["invoice"], "http://a1").with_ttl(1))
            .await;
        assert!(matches!(short_ttl, Err(MarketplaceError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_renew_requires_matching_lease() {
        let (marketplace, _) = marketplace();
        let id = AgentId::new("a1");
        let lease = marketplace
            .publish(PublishRequest::new("a1", ["invoice"], "http://a1"))
            .await
            .unwrap();

        marketplace.renew(&id, lease).await.unwrap();
        marketplace.renew(&id, lease).await.unwrap();
        assert_eq!(
            marketplace.renew(&id, LeaseId(lease.0 + 100)).await,
            Err(MarketplaceError::LeaseNotFound(id.clone()))
        );
        assert_eq!(
            marketplace.renew(&AgentId::new("ghost"), lease).await,
            Err(MarketplaceError::LeaseNotFound(AgentId::new("ghost")))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_renew_after_expiry_fails() {
        let (marketplace, _) = marketplace();
        let id = AgentId::new("a1");
        let lease = marketplace
            .publish(PublishRequest::new("a1", ["invoice"], "http://a1").with_ttl(10))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(
            marketplace.renew(&id, lease).await,
            Err(MarketplaceError::LeaseNotFound(id))
        );
    }

    #[tokio::test]
    async fn test_unpublish_is_idempotent() {
        let (marketplace, store) = marketplace();
        let id = AgentId::new("a1");
        marketplace
            .publish(PublishRequest::new("a1", ["invoice"], "http://a1"))
            .await
            .unwrap();

        marketplace.unpublish(&id).await.unwrap();
        marketplace.unpublish(&id).await.unwrap();
        assert_eq!(marketplace.live_count(), 0);
        assert_eq!(store.lease_count(), 0);
        assert!(marketplace.index().applied_revision() >= Revision::ZERO);
    }

    #[tokio::test]
    async fn test_discover_capability_handling() {
        let (marketplace, _) = marketplace();
        let unknown = marketplace.discover(DiscoveryQuery::new("payroll")).await.unwrap();
        assert_eq!(unknown.total, 0);
        assert!(unknown.agents.is_empty());

        let malformed = marketplace.discover(DiscoveryQuery::new("Not A Tag")).await;
        assert!(matches!(malformed, Err(MarketplaceError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_store_outage_is_transient() {
        let (marketplace, store) = marketplace();
        store.set_available(false);
        let err = marketplace
            .publish(PublishRequest::new("a1", ["invoice"], "http://a1"))
            .await
            .unwrap_err();
        assert!(err.class().is_retryable());
    }
}
