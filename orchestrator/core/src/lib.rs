// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Bazaar Core
//!
//! Registry side of the agent marketplace: lease-backed agent listings, the
//! watch-fed liveness index, capability discovery and signed handoff tokens.
//!
//! # Architecture
//!
//! - **domain:** identity, lease and work item types; `LeaseStore` and `WorkflowEngine` ports
//! - **application:** `AgentMarketplace`, `HandoffCoordinator`, `RegistryApi`
//! - **infrastructure:** in-memory LeaseStore, liveness index, event bus, token signer
//! - **presentation:** axum HTTP API

pub mod application;
pub mod domain;
pub mod infrastructure;
pub mod presentation;

pub use domain::*;
