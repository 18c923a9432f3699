// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Agent listing commands
//!
//! Commands: publish, renew, unpublish, get, discover

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;

use bazaar_core::application::registry::RegistryApi;
use bazaar_core::domain::agent::{AgentId, AgentRecord, DiscoveryQuery, PublishRequest};
use bazaar_core::domain::lease::LeaseId;

use super::client;

#[derive(Subcommand)]
pub enum AgentCommand {
    /// Publish a listing and print its lease id
    Publish {
        /// Agent ID
        #[arg(value_name = "AGENT_ID")]
        agent_id: String,

        /// Advertised capability (repeatable)
        #[arg(short = 'C', long = "capability", required = true)]
        capabilities: Vec<String>,

        /// Endpoint other agents deliver handoff tokens to
        #[arg(short, long)]
        endpoint: String,

        /// Lease TTL in seconds (default: registry default)
        #[arg(long)]
        ttl: Option<u64>,
    },

    /// Renew an agent's lease
    Renew {
        #[arg(value_name = "AGENT_ID")]
        agent_id: String,

        /// Lease id returned by publish
        #[arg(short, long)]
        lease: i64,
    },

    /// Remove a listing (idempotent)
    Unpublish {
        #[arg(value_name = "AGENT_ID")]
        agent_id: String,
    },

    /// Show one live listing
    Get {
        #[arg(value_name = "AGENT_ID")]
        agent_id: String,

        /// Print raw JSON
        #[arg(long)]
        json: bool,
    },

    /// List live agents advertising a capability
    Discover {
        #[arg(value_name = "CAPABILITY")]
        capability: String,

        #[arg(long, default_value = "100")]
        limit: usize,

        #[arg(long, default_value = "0")]
        offset: usize,

        /// Print raw JSON
        #[arg(long)]
        json: bool,
    },
}

pub async fn handle_command(command: AgentCommand, base_url: &str) -> Result<()> {
    let client = client(base_url)?;

    match command {
        AgentCommand::Publish {
            agent_id,
            capabilities,
            endpoint,
            ttl,
        } => {
            let mut request = PublishRequest::new(agent_id, capabilities.iter().map(String::as_str), endpoint);
            request.ttl = ttl;
            let agent_id = request.agent_id.clone();
            let lease = client.publish(request).await.context("Publish failed")?;
            println!(
                "{}",
                format!("✓ Agent {} published (lease {})", agent_id, lease).green()
            );
        }
        AgentCommand::Renew { agent_id, lease } => {
            let agent_id = AgentId::new(agent_id);
            client
                .renew(&agent_id, LeaseId(lease))
                .await
                .context("Renew failed")?;
            println!("{}", format!("✓ Lease {} renewed", lease).green());
        }
        AgentCommand::Unpublish { agent_id } => {
            let agent_id = AgentId::new(agent_id);
            client.unpublish(&agent_id).await.context("Unpublish failed")?;
            println!("{}", format!("✓ Agent {} unpublished", agent_id).green());
        }
        AgentCommand::Get { agent_id, json } => {
            let record = client
                .get_agent(&AgentId::new(agent_id))
                .await
                .context("Lookup failed")?;
            if json {
                println!("{}", serde_json::to_string_pretty(&record)?);
            } else {
                print_header();
                print_record(&record);
            }
        }
        AgentCommand::Discover {
            capability,
            limit,
            offset,
            json,
        } => {
            let page = client
                .discover(DiscoveryQuery::new(capability.as_str()).page(limit, offset))
                .await
                .context("Discovery failed")?;
            if json {
                println!("{}", serde_json::to_string_pretty(&page)?);
                return Ok(());
            }
            if page.stale {
                println!("{}", "⚠ Registry index is degraded; results may be stale".yellow());
            }
            if page.agents.is_empty() {
                println!("{}", format!("No live agents advertise '{}'", capability).yellow());
                return Ok(());
            }
            println!(
                "Showing {}-{} of {} agents",
                offset + 1,
                offset + page.agents.len(),
                page.total
            );
            print_header();
            for record in &page.agents {
                print_record(record);
            }
        }
    }

    Ok(())
}

fn print_header() {
    println!("{:<28} {:<10} {:<32} {}", "AGENT", "LEASE", "ENDPOINT", "CAPABILITIES");
}

fn print_record(record: &AgentRecord) {
    let capabilities: Vec<&str> = record.capabilities.iter().map(|c| c.as_str()).collect();
    println!(
        "{:<28} {:<10} {:<32} {}",
        record.agent_id.as_str().bold(),
        record.lease_id,
        record.endpoint,
        capabilities.join(",")
    );
}
