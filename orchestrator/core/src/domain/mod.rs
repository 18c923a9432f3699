// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Domain layer: identity, lease, work item and handoff types plus the ports
//! ([`lease::LeaseStore`], [`engine::WorkflowEngine`]) the marketplace is built on.

pub mod agent;
pub mod engine;
pub mod error;
pub mod events;
pub mod handoff;
pub mod lease;
pub mod node_config;
