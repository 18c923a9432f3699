// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Marketplace Configuration Types
//
// Defines the configuration schema for a Bazaar registry node and the agents
// that connect to it:
// - Kubernetes-style manifest format (apiVersion/kind/metadata/spec)
// - Registry settings (lease TTL bounds, key prefix, capability schema)
// - Liveness index resynchronisation limits
// - Handoff token TTL and signing secret
// - Agent defaults (heartbeat, backoff, partition refresh cadence)
// - Network and observability settings

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::domain::agent::CapabilitySchema;

pub const API_VERSION: &str = "bazaar.dev/v1";
pub const KIND: &str = "MarketplaceConfig";
const MIN_SECRET_LEN: usize = 32;

/// Top-level Kubernetes-style marketplace configuration manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketplaceConfigManifest {
    /// API version (must be "bazaar.dev/v1")
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Resource kind (must be "MarketplaceConfig")
    pub kind: String,

    pub metadata: ManifestMetadata,

    #[serde(default)]
    pub spec: MarketplaceConfigSpec,
}

/// Manifest metadata (Kubernetes-style)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMetadata {
    /// Human-readable registry name
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarketplaceConfigSpec {
    #[serde(default)]
    pub registry: RegistryConfig,

    #[serde(default)]
    pub lease_store: LeaseStoreConfig,

    #[serde(default)]
    pub liveness: LivenessConfig,

    #[serde(default)]
    pub handoff: HandoffConfig,

    #[serde(default)]
    pub agent: AgentDefaults,

    #[serde(default)]
    pub network: NetworkConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// LeaseStore key prefix under which listings live
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Closed set of capability tags agents may advertise
    #[serde(default)]
    pub capabilities: Vec<String>,

    /// Lease TTL applied when a publish request does not carry one
    #[serde(default = "default_heartbeat_ttl", with = "humantime_serde")]
    pub default_ttl: Duration,

    #[serde(default = "default_min_ttl", with = "humantime_serde")]
    pub min_ttl: Duration,

    #[serde(default = "default_max_ttl", with = "humantime_serde")]
    pub max_ttl: Duration,

    /// Upper bound on `limit` for discovery queries
    #[serde(default = "default_max_page_size")]
    pub max_page_size: usize,

    /// Timeout applied to every LeaseStore call
    #[serde(default = "default_operation_timeout", with = "humantime_serde")]
    pub operation_timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseStoreConfig {
    /// How often the embedded store expires overdue leases
    #[serde(default = "default_reaper_interval", with = "humantime_serde")]
    pub reaper_interval: Duration,

    /// Number of watch events retained for replay
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    /// Per-watcher buffer; a watcher that falls further behind is disconnected
    #[serde(default = "default_watch_buffer")]
    pub watch_buffer: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LivenessConfig {
    /// Keys read per range call during a resynchronisation
    #[serde(default = "default_resync_batch_size")]
    pub resync_batch_size: usize,

    /// Maximum full resynchronisations per minute
    #[serde(default = "default_resync_per_minute")]
    pub resync_per_minute: u32,

    /// Wait before re-establishing a dropped watch
    #[serde(default = "default_reconnect_delay", with = "humantime_serde")]
    pub reconnect_delay: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffConfig {
    #[serde(default = "default_token_ttl", with = "humantime_serde")]
    pub token_ttl: Duration,

    /// HMAC secret for token signatures (supports "env:VAR_NAME")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signing_secret: Option<String>,

    /// How often expired, never-acknowledged tokens are forgotten
    #[serde(default = "default_sweep_interval", with = "humantime_serde")]
    pub sweep_interval: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDefaults {
    #[serde(default = "default_heartbeat_ttl", with = "humantime_serde")]
    pub lease_ttl: Duration,

    #[serde(default = "default_heartbeat_interval", with = "humantime_serde")]
    pub heartbeat_interval: Duration,

    #[serde(default)]
    pub backoff: BackoffSettings,

    /// Discovery cycles between partition snapshot refreshes
    #[serde(default = "default_partition_refresh_cycles")]
    pub partition_refresh_cycles: u32,

    /// Consecutive RECONNECTING failures before the agent stops
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    #[serde(default = "default_agent_reconnect_delay", with = "humantime_serde")]
    pub reconnect_delay: Duration,

    /// Timeout for renew, discover, checkout and handoff calls
    #[serde(default = "default_operation_timeout", with = "humantime_serde")]
    pub operation_timeout: Duration,

    /// Age after which an enabled item may be attempted by any capable agent
    #[serde(default = "default_orphan_after", with = "humantime_serde")]
    pub orphan_after: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffSettings {
    #[serde(default = "default_backoff_floor_ms")]
    pub floor_ms: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub multiplier: u32,

    #[serde(default = "default_backoff_cap_ms")]
    pub cap_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    #[serde(default = "default_api_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// "compact" or "json"
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

// Default value functions
fn default_key_prefix() -> String {
    "/bazaar/agents/".to_string()
}

fn default_heartbeat_ttl() -> Duration {
    Duration::from_secs(60)
}

fn default_min_ttl() -> Duration {
    Duration::from_secs(5)
}

fn default_max_ttl() -> Duration {
    Duration::from_secs(3600)
}

fn default_max_page_size() -> usize {
    1000
}

fn default_operation_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_reaper_interval() -> Duration {
    Duration::from_millis(500)
}

fn default_history_limit() -> usize {
    10_000
}

fn default_watch_buffer() -> usize {
    4096
}

fn default_resync_batch_size() -> usize {
    1000
}

fn default_resync_per_minute() -> u32 {
    6
}

fn default_reconnect_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_token_ttl() -> Duration {
    Duration::from_secs(30)
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(20)
}

fn default_partition_refresh_cycles() -> u32 {
    10
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

fn default_agent_reconnect_delay() -> Duration {
    Duration::from_secs(2)
}

fn default_orphan_after() -> Duration {
    Duration::from_secs(30)
}

fn default_backoff_floor_ms() -> u64 {
    5
}

fn default_backoff_multiplier() -> u32 {
    2
}

fn default_backoff_cap_ms() -> u64 {
    60_000
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8700
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "compact".to_string()
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            key_prefix: default_key_prefix(),
            capabilities: vec![],
            default_ttl: default_heartbeat_ttl(),
            min_ttl: default_min_ttl(),
            max_ttl: default_max_ttl(),
            max_page_size: default_max_page_size(),
            operation_timeout: default_operation_timeout(),
        }
    }
}

impl Default for LeaseStoreConfig {
    fn default() -> Self {
        Self {
            reaper_interval: default_reaper_interval(),
            history_limit: default_history_limit(),
            watch_buffer: default_watch_buffer(),
        }
    }
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            resync_batch_size: default_resync_batch_size(),
            resync_per_minute: default_resync_per_minute(),
            reconnect_delay: default_reconnect_delay(),
        }
    }
}

impl Default for HandoffConfig {
    fn default() -> Self {
        Self {
            token_ttl: default_token_ttl(),
            signing_secret: None,
            sweep_interval: default_sweep_interval(),
        }
    }
}

impl Default for AgentDefaults {
    fn default() -> Self {
        Self {
            lease_ttl: default_heartbeat_ttl(),
            heartbeat_interval: default_heartbeat_interval(),
            backoff: BackoffSettings::default(),
            partition_refresh_cycles: default_partition_refresh_cycles(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_delay: default_agent_reconnect_delay(),
            operation_timeout: default_operation_timeout(),
            orphan_after: default_orphan_after(),
        }
    }
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            floor_ms: default_backoff_floor_ms(),
            multiplier: default_backoff_multiplier(),
            cap_ms: default_backoff_cap_ms(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_api_port(),
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

impl Default for MarketplaceConfigManifest {
    fn default() -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: ManifestMetadata {
                name: "bazaar".to_string(),
                version: Some("1.0.0".to_string()),
                labels: None,
            },
            spec: MarketplaceConfigSpec::default(),
        }
    }
}

impl MarketplaceConfigManifest {
    /// Load configuration from YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to YAML file
    pub fn to_yaml_file(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    /// Parse configuration from YAML string
    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Discover configuration file using precedence order
    /// 1. BAZAAR_CONFIG_PATH environment variable
    /// 2. ./bazaar-config.yaml (working directory)
    /// 3. ~/.bazaar/config.yaml (user home)
    /// 4. /etc/bazaar/config.yaml (system)
    pub fn discover_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("BAZAAR_CONFIG_PATH") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let cwd = PathBuf::from("./bazaar-config.yaml");
        if cwd.exists() {
            return Some(cwd);
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".bazaar").join("config.yaml");
            if user_config.exists() {
                return Some(user_config);
            }
        }

        let system_config = PathBuf::from("/etc/bazaar/config.yaml");
        if system_config.exists() {
            return Some(system_config);
        }

        None
    }

    /// Load configuration with discovery, fallback to default
    pub fn load_or_default(cli_path: Option<PathBuf>) -> anyhow::Result<Self> {
        // Explicit CLI path fails if missing/invalid
        if let Some(path) = cli_path {
            tracing::info!("Loading configuration from explicit path: {:?}", path);
            let mut config = Self::from_yaml_file(&path)
                .map_err(|e| anyhow::anyhow!("Failed to load config at {:?}: {}", path, e))?;
            config.apply_env_overrides();
            return Ok(config);
        }

        if let Some(config_path) = Self::discover_config() {
            tracing::info!("Loading configuration from discovered path: {:?}", config_path);
            let mut config = Self::from_yaml_file(config_path)?;
            config.apply_env_overrides();
            Ok(config)
        } else {
            tracing::warn!("No configuration file found in standard locations. Using defaults.");
            let mut config = Self::default();
            config.apply_env_overrides();
            Ok(config)
        }
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Some(ttl) = env_duration("BAZAAR_HEARTBEAT_TTL") {
            tracing::info!("Environment override: BAZAAR_HEARTBEAT_TTL={:?}", ttl);
            self.spec.registry.default_ttl = ttl;
            self.spec.agent.lease_ttl = ttl;
        }
        if let Some(ttl) = env_duration("BAZAAR_HANDOFF_TTL") {
            tracing::info!("Environment override: BAZAAR_HANDOFF_TTL={:?}", ttl);
            self.spec.handoff.token_ttl = ttl;
        }
        if let Ok(secret) = std::env::var("BAZAAR_HANDOFF_SECRET") {
            tracing::info!("Environment override: BAZAAR_HANDOFF_SECRET=<redacted>");
            self.spec.handoff.signing_secret = Some(secret);
        }
        if let Some(floor) = env_parse::<u64>("BAZAAR_BACKOFF_FLOOR_MS") {
            self.spec.agent.backoff.floor_ms = floor;
        }
        if let Some(cap) = env_parse::<u64>("BAZAAR_BACKOFF_CAP_MS") {
            self.spec.agent.backoff.cap_ms = cap;
        }
        if let Some(multiplier) = env_parse::<u32>("BAZAAR_BACKOFF_MULTIPLIER") {
            self.spec.agent.backoff.multiplier = multiplier;
        }
        if let Some(cycles) = env_parse::<u32>("BAZAAR_PARTITION_REFRESH_CYCLES") {
            self.spec.agent.partition_refresh_cycles = cycles;
        }
    }

    /// Build the capability schema from `spec.registry.capabilities`
    pub fn capability_schema(&self) -> anyhow::Result<CapabilitySchema> {
        CapabilitySchema::new(&self.spec.registry.capabilities).map_err(|e| anyhow::anyhow!("{}", e))
    }

    /// Resolve the handoff signing secret, following "env:VAR_NAME" indirection.
    /// Returns `None` when no secret is configured.
    pub fn resolve_signing_secret(&self) -> anyhow::Result<Option<Vec<u8>>> {
        let Some(raw) = &self.spec.handoff.signing_secret else {
            return Ok(None);
        };
        let secret = match raw.strip_prefix("env:") {
            Some(var) => std::env::var(var)
                .map_err(|_| anyhow::anyhow!("Handoff secret variable {} is not set", var))?,
            None => raw.clone(),
        };
        Ok(Some(secret.into_bytes()))
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api_version != API_VERSION {
            anyhow::bail!("Invalid apiVersion: '{}'. Must be '{}'", self.api_version, API_VERSION);
        }

        if self.kind != KIND {
            anyhow::bail!("Invalid kind: '{}'. Must be '{}'", self.kind, KIND);
        }

        if self.metadata.name.is_empty() {
            anyhow::bail!("metadata.name cannot be empty");
        }

        let registry = &self.spec.registry;
        if registry.capabilities.is_empty() {
            anyhow::bail!("spec.registry.capabilities must list at least one capability");
        }
        self.capability_schema()?;

        if !registry.key_prefix.starts_with('/') || !registry.key_prefix.ends_with('/') {
            anyhow::bail!("spec.registry.key_prefix must start and end with '/'");
        }
        if registry.min_ttl.is_zero() || registry.default_ttl.is_zero() {
            anyhow::bail!("Lease TTLs must be greater than zero");
        }
        if registry.min_ttl > registry.max_ttl {
            anyhow::bail!("spec.registry.min_ttl exceeds max_ttl");
        }
        if registry.default_ttl < registry.min_ttl || registry.default_ttl > registry.max_ttl {
            anyhow::bail!("spec.registry.default_ttl must lie within [min_ttl, max_ttl]");
        }
        if registry.max_page_size == 0 {
            anyhow::bail!("spec.registry.max_page_size must be greater than zero");
        }

        if self.spec.liveness.resync_per_minute == 0 || self.spec.liveness.resync_batch_size == 0 {
            anyhow::bail!("spec.liveness resync limits must be greater than zero");
        }

        if self.spec.handoff.token_ttl.is_zero() {
            anyhow::bail!("spec.handoff.token_ttl must be greater than zero");
        }
        if let Some(secret) = self.resolve_signing_secret()? {
            if secret.len() < MIN_SECRET_LEN {
                anyhow::bail!("Handoff signing secret must be at least {} bytes", MIN_SECRET_LEN);
            }
        }

        let agent = &self.spec.agent;
        if agent.heartbeat_interval.is_zero() || agent.heartbeat_interval >= agent.lease_ttl {
            anyhow::bail!("spec.agent.heartbeat_interval must be non-zero and shorter than lease_ttl");
        }
        if agent.backoff.multiplier < 1 {
            anyhow::bail!("spec.agent.backoff.multiplier must be at least 1");
        }
        if agent.backoff.floor_ms == 0 || agent.backoff.floor_ms > agent.backoff.cap_ms {
            anyhow::bail!("spec.agent.backoff.floor_ms must be non-zero and not exceed cap_ms");
        }
        if agent.partition_refresh_cycles == 0 {
            anyhow::bail!("spec.agent.partition_refresh_cycles must be greater than zero");
        }

        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("Invalid value for {}: '{}'. Ignoring.", name, raw);
            None
        }
    }
}

fn env_duration(name: &str) -> Option<Duration> {
    let raw = std::env::var(name).ok()?;
    match humantime_serde::re::humantime::parse_duration(&raw) {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("Invalid duration for {}: '{}'. Ignoring.", name, raw);
            None
        }
    }
}
