// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # `bazaar-swarm` — Multi-Agent Coordination
//!
//! Keeps many agents serving the same capability from stepping on each other.
//!
//! ## Crate Layout
//!
//! | Module | Layer | Contents |
//! |--------|-------|----------|
//! | [`domain`] | Domain | work-item partitioning, conflict ballots and policies |
//! | [`application`] | Application | `ConflictResolver` with its human fallback queue |
//! | [`presentation`] | Presentation | `/conflicts` REST routes |
//!
//! ## Key Concepts
//!
//! - **Soft partition**: each agent hashes enabled work items onto a sorted
//!   snapshot of the live agents for its capability and only attempts its own
//!   share. The engine's atomic checkout remains the exclusivity guarantee.
//! - **Conflict case**: a work item reviewed by several agents. Ballots are
//!   reconciled by majority vote, an arbiter agent, or a human, in the order
//!   the item's review policy lists.

pub mod application;
pub mod domain;
pub mod presentation;

pub use domain::*;
