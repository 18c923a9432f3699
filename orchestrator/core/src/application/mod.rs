// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod handoff;
pub mod marketplace;
pub mod registry;

pub use handoff::HandoffCoordinator;
pub use marketplace::AgentMarketplace;
pub use registry::{RegistryApi, RegistryService};
