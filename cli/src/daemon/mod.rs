// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Registry daemon (`bazaar serve`)

pub mod server;

pub use server::{start_daemon, Daemon};
