// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Handoff commands
//!
//! Commands: request, ack

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;

use bazaar_core::application::registry::RegistryApi;
use bazaar_core::domain::agent::{AgentId, Capability};
use bazaar_core::domain::engine::WorkItemId;
use bazaar_core::domain::handoff::HandoffRequest;

use super::client;

#[derive(Subcommand)]
pub enum HandoffCommand {
    /// Mint a handoff token for a work item
    Request {
        #[arg(value_name = "WORK_ITEM_ID")]
        work_item_id: String,

        /// Source agent handing the item away
        #[arg(long)]
        from: String,

        /// Target agent taking the item over
        #[arg(long)]
        to: String,

        /// Capability the target must advertise
        #[arg(short = 'C', long)]
        capability: Option<String>,
    },

    /// Redeem a handoff token (single use)
    Ack {
        #[arg(value_name = "TOKEN")]
        token: String,

        /// Agent redeeming the token; must be the token's target
        #[arg(long)]
        agent: Option<String>,
    },
}

pub async fn handle_command(command: HandoffCommand, base_url: &str) -> Result<()> {
    let client = client(base_url)?;

    match command {
        HandoffCommand::Request {
            work_item_id,
            from,
            to,
            capability,
        } => {
            let request = HandoffRequest {
                work_item_id: WorkItemId::new(work_item_id),
                source_agent_id: AgentId::new(from),
                target_agent_id: AgentId::new(to),
                capability: capability.map(Capability::new),
            };
            let grant = client
                .request_handoff(request)
                .await
                .context("Handoff request failed")?;
            println!("{}", "✓ Handoff token issued".green());
            println!("  Expires: {}", grant.expires_at.to_rfc3339());
            println!("{}", grant.token);
        }
        HandoffCommand::Ack { token, agent } => {
            let agent = agent.map(AgentId::new);
            let ack = client
                .acknowledge_handoff(&token, agent.as_ref())
                .await
                .context("Handoff acknowledgement failed")?;
            println!(
                "{}",
                format!(
                    "✓ {} handed from {} to {}",
                    ack.work_item_id, ack.source_agent_id, ack.target_agent_id
                )
                .green()
            );
        }
    }

    Ok(())
}
