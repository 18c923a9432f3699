// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Swarm Domain Layer
//!
//! Pure domain types for multi-agent coordination. No I/O dependencies.
//!
//! | Module | Key Types |
//! |--------|-----------|
//! | [`partition`] | `owns`, `PartitionView`, `PartitionRefresher` |
//! | [`conflict`] | `ConflictBallot`, `ConflictDecision`, `ReviewPolicy`, `ConflictState` |

pub mod conflict;
pub mod partition;

pub use conflict::*;
pub use partition::*;
