// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod conflict_resolver;

pub use conflict_resolver::ConflictResolver;
