// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Configuration management commands
//!
//! Commands: show, validate, generate

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::PathBuf;

use bazaar_core::domain::node_config::MarketplaceConfigManifest;

pub const CONFIG_TEMPLATE: &str = include_str!("../../templates/bazaar-config.yaml");

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Show config file paths checked
        #[arg(long)]
        paths: bool,
    },

    /// Validate configuration file
    Validate {
        /// Path to config file (default: discover)
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,
    },

    /// Generate sample configuration
    Generate {
        /// Output path
        #[arg(short, long, default_value = "./bazaar-config.yaml")]
        output: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

pub async fn handle_command(command: ConfigCommand, config_override: Option<PathBuf>) -> Result<()> {
    match command {
        ConfigCommand::Show { paths } => show(config_override, paths).await,
        ConfigCommand::Validate { file } => validate(file.or(config_override)).await,
        ConfigCommand::Generate { output, force } => generate(output, force).await,
    }
}

async fn show(config_override: Option<PathBuf>, show_paths: bool) -> Result<()> {
    let config = MarketplaceConfigManifest::load_or_default(config_override.clone())
        .context("Failed to load configuration")?;

    if show_paths {
        println!("{}", "Configuration discovery paths:".bold());
        if let Some(path) = &config_override {
            println!("  1. --config flag: {}", path.display());
        } else {
            println!("  1. --config flag: {}", "(not set)".dimmed());
        }
        println!(
            "  2. BAZAAR_CONFIG_PATH: {}",
            std::env::var("BAZAAR_CONFIG_PATH")
                .unwrap_or_else(|_| "(not set)".to_string())
                .dimmed()
        );
        println!("  3. ./bazaar-config.yaml");
        println!("  4. ~/.bazaar/config.yaml");
        println!("  5. /etc/bazaar/config.yaml");
        println!();
    }

    let spec = &config.spec;
    println!("{}", "Current configuration:".bold());
    println!("  Name: {}", config.metadata.name);
    println!();

    println!("{}", "Registry:".bold());
    println!("  Key prefix: {}", spec.registry.key_prefix);
    if spec.registry.capabilities.is_empty() {
        println!("  Capabilities: {}", "(none - every publish will be rejected)".yellow());
    } else {
        println!("  Capabilities: {}", spec.registry.capabilities.join(", "));
    }
    println!(
        "  Lease TTL: {:?} (allowed {:?}..{:?})",
        spec.registry.default_ttl, spec.registry.min_ttl, spec.registry.max_ttl
    );
    println!("  Max page size: {}", spec.registry.max_page_size);
    println!();

    println!("{}", "Handoff:".bold());
    println!("  Token TTL: {:?}", spec.handoff.token_ttl);
    let secret = match &spec.handoff.signing_secret {
        Some(raw) if raw.starts_with("env:") => raw.clone(),
        Some(_) => "<inline>".to_string(),
        None => "(ephemeral)".to_string(),
    };
    println!("  Signing secret: {}", secret);
    println!();

    println!("{}", "Agent defaults:".bold());
    println!(
        "  Heartbeat: every {:?}, lease {:?}",
        spec.agent.heartbeat_interval, spec.agent.lease_ttl
    );
    println!(
        "  Backoff: {}ms x{} up to {}ms",
        spec.agent.backoff.floor_ms, spec.agent.backoff.multiplier, spec.agent.backoff.cap_ms
    );
    println!(
        "  Partition refresh: every {} cycles",
        spec.agent.partition_refresh_cycles
    );
    println!();

    println!("{}", "Network:".bold());
    println!("  Listen: {}:{}", spec.network.bind_address, spec.network.port);

    Ok(())
}

async fn validate(config_path: Option<PathBuf>) -> Result<()> {
    println!("Validating configuration...");

    let config = MarketplaceConfigManifest::load_or_default(config_path)
        .context("Failed to load configuration")?;

    config.validate().context("Configuration validation failed")?;

    println!("{}", "✓ Configuration is valid".green());

    Ok(())
}

async fn generate(output: PathBuf, force: bool) -> Result<()> {
    if output.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", output.display());
    }

    std::fs::write(&output, CONFIG_TEMPLATE)
        .with_context(|| format!("Failed to write config to {:?}", output))?;

    println!(
        "{}",
        format!("✓ Configuration generated: {}", output.display()).green()
    );

    Ok(())
}
