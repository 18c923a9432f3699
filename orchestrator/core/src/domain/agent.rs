// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Agent Registry Types
//!
//! Identity, capability and listing types shared by the registry, the liveness
//! index and agent clients.
//!
//! - [`AgentId`] — caller-chosen unique identifier (string newtype).
//! - [`Capability`] — a tag from the closed [`CapabilitySchema`].
//! - [`AgentRecord`] — the listing stored under the agent's lease.
//! - [`PublishRequest`], [`DiscoveryQuery`], [`DiscoveryPage`] — registry I/O.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;

use crate::domain::lease::LeaseId;

const MAX_AGENT_ID_LEN: usize = 256;
const MAX_CAPABILITY_LEN: usize = 64;

/// Unique identifier of a published agent.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(String);

impl AgentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Parse and validate an identifier. Ids end up inside LeaseStore keys so
    /// they must be non-empty, bounded and free of `/`.
    pub fn parse(id: &str) -> Result<Self, IdentityError> {
        let agent_id = Self::new(id);
        agent_id.validate()?;
        Ok(agent_id)
    }

    pub fn validate(&self) -> Result<(), IdentityError> {
        if self.0.trim().is_empty() {
            return Err(IdentityError::EmptyAgentId);
        }
        if self.0.len() > MAX_AGENT_ID_LEN {
            return Err(IdentityError::AgentIdTooLong(self.0.len()));
        }
        if self.0.contains('/') {
            return Err(IdentityError::IllegalAgentId(self.0.clone()));
        }
        Ok(())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AgentId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// A capability tag an agent advertises, e.g. `invoice`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Capability(String);

impl Capability {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    /// Tags are lowercase ASCII words made of `[a-z0-9._-]`.
    pub fn parse(tag: &str) -> Result<Self, IdentityError> {
        let well_formed = !tag.is_empty()
            && tag.len() <= MAX_CAPABILITY_LEN
            && tag
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-'));
        if well_formed {
            Ok(Self::new(tag))
        } else {
            Err(IdentityError::MalformedCapability(tag.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Capability {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// The closed set of capability tags the registry accepts.
///
/// Publishing an unregistered tag is rejected so the number of index
/// partitions stays bounded by configuration rather than by client input.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilitySchema {
    tags: BTreeSet<Capability>,
}

impl CapabilitySchema {
    pub fn new<I, S>(tags: I) -> Result<Self, IdentityError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let tags = tags
            .into_iter()
            .map(|t| Capability::parse(t.as_ref()))
            .collect::<Result<BTreeSet<_>, _>>()?;
        Ok(Self { tags })
    }

    pub fn contains(&self, capability: &Capability) -> bool {
        self.tags.contains(capability)
    }

    pub fn validate(&self, capabilities: &BTreeSet<Capability>) -> Result<(), IdentityError> {
        if capabilities.is_empty() {
            return Err(IdentityError::NoCapabilities);
        }
        for capability in capabilities {
            Capability::parse(capability.as_str())?;
            if !self.contains(capability) {
                return Err(IdentityError::UnknownCapability(capability.to_string()));
            }
        }
        Ok(())
    }

    pub fn tags(&self) -> impl Iterator<Item = &Capability> {
        self.tags.iter()
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }
}

/// Validation failures for identifiers and capability tags.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    #[error("agent id must not be empty")]
    EmptyAgentId,

    #[error("agent id is {0} bytes, limit is 256")]
    AgentIdTooLong(usize),

    #[error("agent id {0:?} contains '/'")]
    IllegalAgentId(String),

    #[error("agent must advertise at least one capability")]
    NoCapabilities,

    #[error("capability tag {0:?} is malformed")]
    MalformedCapability(String),

    #[error("capability {0:?} is not registered in the capability schema")]
    UnknownCapability(String),
}

/// A live listing, stored as the value of the agent's lease-bound key.
///
/// Created on publish, extended by renew, deleted by unpublish or lease expiry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRecord {
    pub agent_id: AgentId,
    pub capabilities: BTreeSet<Capability>,
    pub endpoint: String,
    pub registered_at: DateTime<Utc>,
    pub lease_id: LeaseId,
    pub ttl_seconds: u64,
}

impl AgentRecord {
    pub fn advertises(&self, capability: &Capability) -> bool {
        self.capabilities.contains(capability)
    }
}

/// Body of `POST /agents`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishRequest {
    pub agent_id: AgentId,
    pub capabilities: BTreeSet<Capability>,
    pub endpoint: String,
    /// Lease TTL in seconds. `None` uses the registry default.
    #[serde(default)]
    pub ttl: Option<u64>,
}

impl PublishRequest {
    pub fn new<I, C>(agent_id: impl Into<String>, capabilities: I, endpoint: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<Capability>,
    {
        Self {
            agent_id: AgentId::new(agent_id),
            capabilities: capabilities.into_iter().map(Into::into).collect(),
            endpoint: endpoint.into(),
            ttl: None,
        }
    }

    pub fn with_ttl(mut self, ttl_seconds: u64) -> Self {
        self.ttl = Some(ttl_seconds);
        self
    }
}

/// Capability-filtered discovery query (`GET /agents`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryQuery {
    pub capability: Capability,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

impl DiscoveryQuery {
    pub fn new(capability: impl Into<Capability>) -> Self {
        Self {
            capability: capability.into(),
            limit: default_limit(),
            offset: 0,
        }
    }

    pub fn page(mut self, limit: usize, offset: usize) -> Self {
        self.limit = limit;
        self.offset = offset;
        self
    }
}

fn default_limit() -> usize {
    100
}

/// One page of live agents advertising a capability.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryPage {
    pub agents: Vec<AgentRecord>,
    /// Number of live agents in the capability partition.
    pub total: usize,
    /// Set while the liveness index is serving data from a disconnected watch.
    #[serde(default)]
    pub stale: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_id_validation() {
        assert!(AgentId::parse("a1").is_ok());
        assert_eq!(AgentId::parse("  "), Err(IdentityError::EmptyAgentId));
        assert!(matches!(AgentId::parse("a/b"), Err(IdentityError::IllegalAgentId(_))));
        let long = "x".repeat(300);
        assert_eq!(AgentId::parse(&long), Err(IdentityError::AgentIdTooLong(300)));
    }

    #[test]
    fn test_capability_parse() {
        assert!(Capability::parse("invoice").is_ok());
        assert!(Capability::parse("po.approve-v2").is_ok());
        assert!(Capability::parse("Invoice").is_err());
        assert!(Capability::parse("").is_err());
        assert!(Capability::parse("has space").is_err());
    }

    #[test]
    fn test_schema_rejects_unknown_and_empty() {
        let schema = CapabilitySchema::new(["invoice", "shipping"]).unwrap();
        let known: BTreeSet<Capability> = [Capability::new("invoice")].into_iter().collect();
        let unknown: BTreeSet<Capability> = [Capability::new("payroll")].into_iter().collect();

        assert!(schema.validate(&known).is_ok());
        assert_eq!(
            schema.validate(&unknown),
            Err(IdentityError::UnknownCapability("payroll".to_string()))
        );
        assert_eq!(schema.validate(&BTreeSet::new()), Err(IdentityError::NoCapabilities));
    }

    #[test]
    fn test_publish_request_wire_shape() {
        let json = serde_json::json!({
            "agentId": "a1",
            "capabilities": ["invoice"],
            "endpoint": "http://10.0.0.1:9000",
            "ttl": 60
        });
        let request: PublishRequest = serde_json::from_value(json).unwrap();
        assert_eq!(request.agent_id, AgentId::new("a1"));
        assert_eq!(request.ttl, Some(60));
        assert!(request.capabilities.contains(&Capability::new("invoice")));
    }
}
