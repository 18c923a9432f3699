// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Command implementations for the Bazaar CLI

use anyhow::{Context, Result};
use colored::Colorize;
use std::path::PathBuf;

use bazaar_core::domain::node_config::MarketplaceConfigManifest;
use bazaar_sdk::MarketplaceClient;

pub mod agent;
pub mod config;
pub mod handoff;

pub use self::agent::AgentCommand;
pub use self::config::ConfigCommand;
pub use self::handoff::HandoffCommand;

const DEFAULT_CLIENT_HOST: &str = "127.0.0.1";

/// Registry base URL for client commands. Flags win over the config file;
/// a wildcard bind address is reached through loopback.
pub fn resolve_base_url(config_path: Option<PathBuf>, host: Option<String>, port: Option<u16>) -> Result<String> {
    let network = MarketplaceConfigManifest::load_or_default(config_path)
        .context("Failed to load configuration")?
        .spec
        .network;

    let host = host.unwrap_or_else(|| match network.bind_address.as_str() {
        "0.0.0.0" | "::" | "" => DEFAULT_CLIENT_HOST.to_string(),
        other => other.to_string(),
    });
    let port = port.unwrap_or(network.port);
    Ok(base_url(&host, port))
}

pub fn base_url(host: &str, port: u16) -> String {
    if host.starts_with("http://") || host.starts_with("https://") {
        format!("{}:{}", host.trim_end_matches('/'), port)
    } else {
        format!("http://{}:{}", host, port)
    }
}

pub(crate) fn client(base_url: &str) -> Result<MarketplaceClient> {
    let client = MarketplaceClient::new(base_url).context("Failed to create registry client")?;
    Ok(match std::env::var("BAZAAR_API_KEY") {
        Ok(key) => client.with_api_key(key),
        Err(_) => client,
    })
}

/// `bazaar status`: registry health.
pub async fn status(base_url: &str) -> Result<()> {
    let health = client(base_url)?
        .health()
        .await
        .with_context(|| format!("Registry at {} is unreachable", base_url))?;

    let status = if health.degraded {
        format!("{} (degraded: serving stale discovery results)", health.status).yellow()
    } else {
        health.status.green()
    };
    println!("{} {}", "Registry:".bold(), base_url);
    println!("  Status:      {}", status);
    println!("  Live agents: {}", health.live_agents);
    println!("  Uptime:      {}s", health.uptime_seconds);
    Ok(())
}
