// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Out-of-band handoff delivery
//!
//! The registry mints handoff tokens but never carries them; the source agent
//! delivers the token to the target itself. [`ChannelHandoffDelivery`] routes
//! tokens between agents in one process, [`HttpHandoffDelivery`] POSTs them to
//! the target's advertised endpoint.

use async_trait::async_trait;
use dashmap::DashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

use bazaar_core::domain::agent::{AgentId, AgentRecord};

use crate::types::{AgentError, HandoffEnvelope};

/// Receiving half of an agent's handoff inbox.
pub type HandoffInbox = mpsc::Receiver<HandoffEnvelope>;

/// Create a bounded inbox. The sender goes to whatever receives tokens for
/// the agent (an HTTP handler, a [`ChannelHandoffDelivery`]).
pub fn handoff_inbox(capacity: usize) -> (mpsc::Sender<HandoffEnvelope>, HandoffInbox) {
    mpsc::channel(capacity.max(1))
}

#[async_trait]
pub trait HandoffDelivery: Send + Sync {
    async fn deliver(&self, target: &AgentRecord, envelope: HandoffEnvelope) -> Result<(), AgentError>;
}

/// In-process delivery keyed by agent id.
#[derive(Default)]
pub struct ChannelHandoffDelivery {
    inboxes: DashMap<AgentId, mpsc::Sender<HandoffEnvelope>>,
}

impl ChannelHandoffDelivery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent and return its inbox.
    pub fn register(&self, agent_id: AgentId, capacity: usize) -> HandoffInbox {
        let (tx, rx) = handoff_inbox(capacity);
        self.inboxes.insert(agent_id, tx);
        rx
    }

    pub fn unregister(&self, agent_id: &AgentId) {
        self.inboxes.remove(agent_id);
    }
}

#[async_trait]
impl HandoffDelivery for ChannelHandoffDelivery {
    async fn deliver(&self, target: &AgentRecord, envelope: HandoffEnvelope) -> Result<(), AgentError> {
        let sender = self
            .inboxes
            .get(&target.agent_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| AgentError::Delivery(format!("no inbox registered for {}", target.agent_id)))?;
        sender
            .send(envelope)
            .await
            .map_err(|_| AgentError::Delivery(format!("inbox of {} is closed", target.agent_id)))?;
        debug!(target = %target.agent_id, "Handoff token delivered in-process");
        Ok(())
    }
}

/// Delivery by `POST {endpoint}/handoff` with the envelope as JSON.
#[derive(Clone)]
pub struct HttpHandoffDelivery {
    client: reqwest::Client,
}

impl HttpHandoffDelivery {
    pub fn new(timeout: Duration) -> Result<Self, AgentError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AgentError::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HandoffDelivery for HttpHandoffDelivery {
    async fn deliver(&self, target: &AgentRecord, envelope: HandoffEnvelope) -> Result<(), AgentError> {
        let url = format!("{}/handoff", target.endpoint.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .json(&envelope)
            .send()
            .await
            .map_err(|e| AgentError::Delivery(format!("POST {} failed: {}", url, e)))?;
        if !response.status().is_success() {
            return Err(AgentError::Delivery(format!(
                "POST {} returned {}",
                url,
                response.status()
            )));
        }
        debug!(target = %target.agent_id, url = %url, "Handoff token delivered over HTTP");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bazaar_core::domain::agent::Capability;
    use bazaar_core::domain::engine::WorkItemId;
    use bazaar_core::domain::lease::LeaseId;
    use chrono::Utc;
    use mockito::Matcher;
    use serde_json::json;

    fn record(id: &str, endpoint: &str) -> AgentRecord {
        AgentRecord {
            agent_id: AgentId::new(id),
            capabilities: [Capability::new("invoice")].into_iter().collect(),
            endpoint: endpoint.to_string(),
            registered_at: Utc::now(),
            lease_id: LeaseId(1),
            ttl_seconds: 60,
        }
    }

    fn envelope() -> HandoffEnvelope {
        HandoffEnvelope {
            token: "t.o.k".to_string(),
            work_item_id: WorkItemId::new("wi-1"),
            source_agent_id: AgentId::new("a1"),
            expires_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_channel_delivery_routes_by_id() {
        let delivery = ChannelHandoffDelivery::new();
        let mut inbox = delivery.register(AgentId::new("a2"), 4);

        delivery.deliver(&record("a2", "local"), envelope()).await.unwrap();
        assert_eq!(inbox.recv().await.unwrap().token, "t.o.k");

        let err = delivery.deliver(&record("a3", "local"), envelope()).await.unwrap_err();
        assert!(matches!(err, AgentError::Delivery(_)));

        delivery.unregister(&AgentId::new("a2"));
        assert!(delivery.deliver(&record("a2", "local"), envelope()).await.is_err());
    }

    #[tokio::test]
    async fn test_http_delivery_posts_envelope() {
        let mut server = mockito::Server::new_async().await;
        let ok = server
            .mock("POST", "/handoff")
            .match_body(Matcher::PartialJson(json!({ "token": "t.o.k", "workItemId": "wi-1" })))
            .with_status(202)
            .create_async()
            .await;

        let delivery = HttpHandoffDelivery::new(Duration::from_secs(2)).unwrap();
        delivery
            .deliver(&record("a2", &format!("{}/", server.url())), envelope())
            .await
            .unwrap();
        ok.assert_async().await;
    }

    #[tokio::test]
    async fn test_http_delivery_rejects_error_status() {
        let mut server = mockito::Server::new_async().await;
        server.mock("POST", "/handoff").with_status(503).create_async().await;

        let delivery = HttpHandoffDelivery::new(Duration::from_secs(2)).unwrap();
        let err = delivery
            .deliver(&record("a2", &server.url()), envelope())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Delivery(_)));
    }
}
