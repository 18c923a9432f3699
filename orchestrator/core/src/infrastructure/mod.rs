// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod engine;
pub mod event_bus;
pub mod handoff_signer;
pub mod lease_store;
pub mod liveness_index;
