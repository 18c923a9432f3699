// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Bazaar Rust SDK
//!
//! Build agents that publish themselves to a Bazaar marketplace, pull work
//! from a workflow engine and hand items off to one another.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use bazaar_sdk::{Agent, AgentConfig, ChannelHandoffDelivery, MarketplaceClient, WorkHandler, WorkOutcome};
//! # use bazaar_core::domain::engine::{WorkItemRecord, WorkflowEngine};
//! # struct Echo;
//! # #[async_trait::async_trait]
//! # impl WorkHandler for Echo {
//! #     async fn handle(&self, item: &WorkItemRecord) -> WorkOutcome {
//! #         WorkOutcome::Completed(serde_json::json!({ "item": item.work_item_id }))
//! #     }
//! # }
//! # async fn run(engine: Arc<dyn WorkflowEngine>) -> Result<(), Box<dyn std::error::Error>> {
//! let registry = Arc::new(MarketplaceClient::new("http://localhost:8088")?);
//! let config = AgentConfig::new("invoice-agent-1", ["invoice"], "http://10.0.0.7:9000");
//! let handle = Agent::new(config, registry, engine, Arc::new(Echo), Arc::new(ChannelHandoffDelivery::new())).spawn();
//! // ...
//! handle.stop().await?;
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod backoff;
pub mod client;
pub mod delivery;
pub mod types;

pub use agent::{Agent, AgentConfig, AgentHandle, WorkHandler};
pub use backoff::{BackoffController, BackoffState};
pub use client::MarketplaceClient;
pub use delivery::{handoff_inbox, ChannelHandoffDelivery, HandoffDelivery, HandoffInbox, HttpHandoffDelivery};
pub use types::*;
