// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Presentation Layer (`bazaar-core`)
//!
//! HTTP surface that translates REST requests into [`crate::application`]
//! calls and maps [`crate::domain::error::MarketplaceError`] onto status codes.
//!
//! | Module | Transport | Description |
//! |--------|-----------|-------------|
//! | [`api`] | HTTP (Axum) | agent publish/renew/unpublish/discover and handoff routes |

pub mod api;
