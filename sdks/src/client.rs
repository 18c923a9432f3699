// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;

use bazaar_core::application::registry::RegistryApi;
use bazaar_core::domain::agent::{AgentId, AgentRecord, DiscoveryPage, DiscoveryQuery, PublishRequest};
use bazaar_core::domain::error::MarketplaceError;
use bazaar_core::domain::handoff::{HandoffAck, HandoffGrant, HandoffRequest};
use bazaar_core::domain::lease::LeaseId;
use bazaar_core::presentation::api::{ErrorBody, HealthBody, LeaseBody};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// HTTP client for a Bazaar registry.
///
/// Implements [`RegistryApi`], so an [`crate::agent::Agent`] runs the same way
/// against a remote registry as against an in-process one. Error bodies are
/// decoded back into the [`MarketplaceError`] the server raised.
#[derive(Clone)]
pub struct MarketplaceClient {
    base_url: String,
    client: Client,
    api_key: Option<String>,
    timeout: Duration,
}

impl MarketplaceClient {
    /// Create a new client with the default per-request timeout.
    pub fn new(base_url: impl Into<String>) -> Result<Self, MarketplaceError> {
        Self::with_timeout(base_url, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Result<Self, MarketplaceError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| MarketplaceError::Unavailable(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            api_key: None,
            timeout,
        })
    }

    /// Set a bearer token sent with every request.
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Fetch one listing.
    pub async fn get_agent(&self, agent_id: &AgentId) -> Result<AgentRecord, MarketplaceError> {
        let req = self.request(Method::GET, &format!("/agents/{}", agent_id));
        self.send_json("get_agent", req, Some(agent_id)).await
    }

    pub async fn health(&self) -> Result<HealthBody, MarketplaceError> {
        let req = self.request(Method::GET, "/health");
        self.send_json("health", req, None).await
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let mut req = self.client.request(method, format!("{}{}", self.base_url, path));
        if let Some(key) = &self.api_key {
            req = req.header("Authorization", format!("Bearer {}", key));
        }
        req
    }

    async fn send(
        &self,
        operation: &'static str,
        req: RequestBuilder,
        subject: Option<&AgentId>,
    ) -> Result<Response, MarketplaceError> {
        let response = req.send().await.map_err(|e| self.transport_error(operation, e))?;
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body = response.json::<ErrorBody>().await.ok();
        Err(decode_error(status, body, subject))
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        req: RequestBuilder,
        subject: Option<&AgentId>,
    ) -> Result<T, MarketplaceError> {
        let response = self.send(operation, req, subject).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| MarketplaceError::Unavailable(format!("{} returned an unreadable body: {}", operation, e)))
    }

    fn transport_error(&self, operation: &'static str, err: reqwest::Error) -> MarketplaceError {
        if err.is_timeout() {
            MarketplaceError::Timeout {
                operation,
                timeout: self.timeout,
            }
        } else {
            MarketplaceError::Unavailable(format!("{} failed: {}", operation, err))
        }
    }
}

/// Rebuild the server-side error from an HTTP error response. `subject` is the
/// agent the request was about, used for id-carrying variants.
pub fn decode_error(status: StatusCode, body: Option<ErrorBody>, subject: Option<&AgentId>) -> MarketplaceError {
    let subject = || subject.cloned().unwrap_or_else(|| AgentId::new("unknown"));
    let message = body
        .as_ref()
        .map(|b| b.error.clone())
        .unwrap_or_else(|| format!("HTTP {}", status));

    match body.as_ref().map(|b| b.code.as_str()) {
        Some("duplicate_agent_id") => MarketplaceError::DuplicateAgentId(subject()),
        Some("lease_not_found") => MarketplaceError::LeaseNotFound(subject()),
        Some("agent_not_found") => MarketplaceError::AgentNotFound(subject()),
        Some("target_not_live") => MarketplaceError::TargetNotLive(subject()),
        Some("token_invalid") => MarketplaceError::TokenInvalid(message),
        Some("token_signature") => MarketplaceError::TokenSignature(message),
        Some("invalid_request") => MarketplaceError::InvalidRequest(message),
        _ => match status {
            StatusCode::CONFLICT => MarketplaceError::DuplicateAgentId(subject()),
            StatusCode::NOT_FOUND => MarketplaceError::AgentNotFound(subject()),
            StatusCode::GONE => MarketplaceError::TokenInvalid(message),
            StatusCode::UNAUTHORIZED => MarketplaceError::TokenSignature(message),
            StatusCode::BAD_REQUEST => MarketplaceError::InvalidRequest(message),
            _ => MarketplaceError::Unavailable(message),
        },
    }
}

#[async_trait]
impl RegistryApi for MarketplaceClient {
    async fn publish(&self, request: PublishRequest) -> Result<LeaseId, MarketplaceError> {
        let agent_id = request.agent_id.clone();
        let req = self.request(Method::POST, "/agents").json(&request);
        let body: LeaseBody = self.send_json("publish", req, Some(&agent_id)).await?;
        Ok(body.lease_id)
    }

    async fn renew(&self, agent_id: &AgentId, lease_id: LeaseId) -> Result<(), MarketplaceError> {
        let req = self
            .request(Method::PUT, &format!("/agents/{}/lease", agent_id))
            .json(&LeaseBody { lease_id });
        self.send("renew", req, Some(agent_id)).await?;
        Ok(())
    }

    async fn unpublish(&self, agent_id: &AgentId) -> Result<(), MarketplaceError> {
        let req = self.request(Method::DELETE, &format!("/agents/{}", agent_id));
        self.send("unpublish", req, Some(agent_id)).await?;
        Ok(())
    }

    async fn discover(&self, query: DiscoveryQuery) -> Result<DiscoveryPage, MarketplaceError> {
        let req = self.request(Method::GET, "/agents").query(&[
            ("capability", query.capability.to_string()),
            ("limit", query.limit.to_string()),
            ("offset", query.offset.to_string()),
        ]);
        self.send_json("discover", req, None).await
    }

    async fn request_handoff(&self, request: HandoffRequest) -> Result<HandoffGrant, MarketplaceError> {
        let target = request.target_agent_id.clone();
        let req = self.request(Method::POST, "/handoff").json(&request);
        self.send_json("request_handoff", req, Some(&target)).await
    }

    async fn acknowledge_handoff(
        &self,
        token: &str,
        acting_agent: Option<&AgentId>,
    ) -> Result<HandoffAck, MarketplaceError> {
        let mut req = self.request(Method::POST, &format!("/handoff/{}/ack", token));
        if let Some(agent) = acting_agent {
            req = req.query(&[("agentId", agent.as_str())]);
        }
        self.send_json("acknowledge_handoff", req, acting_agent).await
    }
}
