// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # Bazaar CLI
//!
//! The `bazaar` binary runs the registry daemon and talks to a running one.
//!
//! ## Commands
//!
//! - `bazaar serve` - Run the registry (lease store, liveness index, REST API)
//! - `bazaar status` - Registry health
//! - `bazaar config show|validate|generate` - Configuration management
//! - `bazaar agent publish|renew|unpublish|get|discover` - Listing operations
//! - `bazaar handoff request|ack` - Handoff token operations
//!
//! Client commands resolve the registry address from `--host`/`--port`, then
//! the configuration file's `network` block.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;

use bazaar::commands::{self, AgentCommand, ConfigCommand, HandoffCommand};
use bazaar::daemon;
use bazaar_core::domain::node_config::MarketplaceConfigManifest;

/// Bazaar - distributed agent marketplace
#[derive(Parser)]
#[command(name = "bazaar")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file (overrides discovery)
    #[arg(
        short,
        long,
        global = true,
        env = "BAZAAR_CONFIG_PATH",
        value_name = "FILE"
    )]
    config: Option<PathBuf>,

    /// Registry HTTP port (default: from config, else 8700)
    #[arg(long, global = true, env = "BAZAAR_PORT")]
    port: Option<u16>,

    /// Registry HTTP host (default: from config for `serve`, else 127.0.0.1)
    #[arg(long, global = true, env = "BAZAAR_HOST")]
    host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "BAZAAR_LOG_LEVEL")]
    log_level: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the registry daemon in the foreground
    #[command(name = "serve")]
    Serve,

    /// Show registry health
    #[command(name = "status")]
    Status,

    /// Configuration management
    #[command(name = "config")]
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },

    /// Agent listing operations
    #[command(name = "agent")]
    Agent {
        #[command(subcommand)]
        command: AgentCommand,
    },

    /// Handoff token operations
    #[command(name = "handoff")]
    Handoff {
        #[command(subcommand)]
        command: HandoffCommand,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logging settings come from the config file unless overridden; a broken
    // file is reported by the command itself, not here.
    let observability = MarketplaceConfigManifest::load_or_default(cli.config.clone())
        .map(|config| config.spec.observability)
        .unwrap_or_default();
    let level = cli.log_level.clone().unwrap_or(observability.log_level);
    let json = cli.log_json || observability.log_format == "json";
    init_logging(&level, json)?;

    match cli.command {
        Some(Commands::Serve) => daemon::start_daemon(cli.config, cli.host, cli.port).await,
        Some(Commands::Status) => {
            let base_url = commands::resolve_base_url(cli.config, cli.host, cli.port)?;
            commands::status(&base_url).await
        }
        Some(Commands::Config { command }) => commands::config::handle_command(command, cli.config).await,
        Some(Commands::Agent { command }) => {
            let base_url = commands::resolve_base_url(cli.config, cli.host, cli.port)?;
            commands::agent::handle_command(command, &base_url).await
        }
        Some(Commands::Handoff { command }) => {
            let base_url = commands::resolve_base_url(cli.config, cli.host, cli.port)?;
            commands::handoff::handle_command(command, &base_url).await
        }
        None => {
            eprintln!("{}", "No command specified. Use --help for usage.".yellow());
            std::process::exit(1);
        }
    }
}

/// Initialize tracing subscriber for logging
fn init_logging(level: &str, json: bool) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if json {
        builder.json().init();
    } else {
        builder.compact().init();
    }

    Ok(())
}
