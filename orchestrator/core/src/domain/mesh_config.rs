// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Mesh Configuration Types
//
// Defines the configuration schema for an agentmesh coordinator, including:
// - Kubernetes-style manifest format (apiVersion/kind/metadata/spec)
// - Coordinator node identity
// - Heartbeat expiry and retention windows
// - Routing retry, backoff and deadline policy
// - Delivery queue and connection buffer bounds
// - Network and observability settings

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const API_VERSION: &str = "agentmesh.io/v1";
pub const KIND: &str = "MeshConfig";

/// Top-level Kubernetes-style coordinator configuration manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfigManifest {
    /// API version (must be "agentmesh.io/v1")
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Resource kind (must be "MeshConfig")
    pub kind: String,

    pub metadata: ManifestMetadata,

    #[serde(default)]
    pub spec: MeshConfigSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMetadata {
    /// Human-readable coordinator name
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

/// Coordinator configuration specification (content under spec:)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfigSpec {
    #[serde(default)]
    pub node: NodeIdentity,

    #[serde(default)]
    pub health: HealthConfig,

    #[serde(default)]
    pub routing: RoutingConfig,

    #[serde(default)]
    pub delivery: DeliveryConfig,

    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub network: NetworkConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeIdentity {
    /// Stable coordinator identifier (defaults to the host name)
    #[serde(default = "default_node_id")]
    pub id: String,
}

/// Heartbeat expiry and eviction
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthConfig {
    /// How often the health monitor sweeps the registry
    #[serde(default = "default_check_interval", with = "humantime_serde")]
    pub check_interval: Duration,

    /// Silence after which an Active agent is moved to Offline
    #[serde(default = "default_heartbeat_timeout", with = "humantime_serde")]
    pub heartbeat_timeout: Duration,

    /// How long an Offline record is kept before it is purged
    #[serde(default = "default_retention_window", with = "humantime_serde")]
    pub retention_window: Duration,
}

/// Routing retries, backoff and deadlines
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoutingConfig {
    /// Attempts for transient failures before surfacing RoutingFailed
    #[serde(default = "default_max_route_attempts")]
    pub max_route_attempts: u32,

    /// First retry delay; doubles per attempt
    #[serde(default = "default_backoff_base", with = "humantime_serde")]
    pub backoff_base: Duration,

    /// Upper bound on a single retry delay
    #[serde(default = "default_backoff_max", with = "humantime_serde")]
    pub backoff_max: Duration,

    /// Time limit for one enqueue call to the delivery queue
    #[serde(default = "default_handoff_timeout", with = "humantime_serde")]
    pub handoff_timeout: Duration,

    /// Deadline applied when a caller does not supply one
    #[serde(default = "default_route_deadline", with = "humantime_serde")]
    pub route_deadline: Duration,

    /// Time a dispatched message may stay unacknowledged before its reservation is released
    #[serde(default = "default_ack_timeout", with = "humantime_serde")]
    pub ack_timeout: Duration,

    /// Time allowed for in-flight messages to settle on shutdown
    #[serde(default = "default_shutdown_grace", with = "humantime_serde")]
    pub shutdown_grace: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeliveryConfig {
    /// Undelivered envelopes buffered per node before enqueue reports QueueUnavailable
    #[serde(default = "default_per_node_capacity")]
    pub per_node_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransportConfig {
    /// Frames buffered per connection and direction
    #[serde(default = "default_connection_buffer")]
    pub connection_buffer: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkConfig {
    /// Network bind address (e.g. "0.0.0.0" or "127.0.0.1")
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// HTTP API port
    #[serde(default = "default_api_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ObservabilityConfig {
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Log level (e.g., "info", "debug", "trace")
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricsConfig {
    /// Expose a Prometheus scrape endpoint
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_node_id() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "agentmesh-node".to_string())
}

fn default_check_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_heartbeat_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_retention_window() -> Duration {
    Duration::from_secs(300)
}

fn default_max_route_attempts() -> u32 {
    3
}

fn default_backoff_base() -> Duration {
    Duration::from_millis(50)
}

fn default_backoff_max() -> Duration {
    Duration::from_secs(1)
}

fn default_handoff_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_route_deadline() -> Duration {
    Duration::from_secs(10)
}

fn default_ack_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_shutdown_grace() -> Duration {
    Duration::from_secs(10)
}

fn default_per_node_capacity() -> usize {
    1024
}

fn default_connection_buffer() -> usize {
    64
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

fn default_metrics_port() -> u16 {
    9187
}

impl Default for NodeIdentity {
    fn default() -> Self {
        Self { id: default_node_id() }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval: default_check_interval(),
            heartbeat_timeout: default_heartbeat_timeout(),
            retention_window: default_retention_window(),
        }
    }
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            max_route_attempts: default_max_route_attempts(),
            backoff_base: default_backoff_base(),
            backoff_max: default_backoff_max(),
            handoff_timeout: default_handoff_timeout(),
            route_deadline: default_route_deadline(),
            ack_timeout: default_ack_timeout(),
            shutdown_grace: default_shutdown_grace(),
        }
    }
}

impl RoutingConfig {
    /// Exponential backoff before retry number `attempt` (1-based), capped at `backoff_max`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.backoff_base
            .saturating_mul(1u32 << exponent)
            .min(self.backoff_max)
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            per_node_capacity: default_per_node_capacity(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connection_buffer: default_connection_buffer(),
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

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

impl Default for MeshConfigSpec {
    fn default() -> Self {
        Self {
            node: NodeIdentity::default(),
            health: HealthConfig::default(),
            routing: RoutingConfig::default(),
            delivery: DeliveryConfig::default(),
            transport: TransportConfig::default(),
            network: NetworkConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

impl Default for MeshConfigManifest {
    fn default() -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: ManifestMetadata {
                name: default_node_id(),
                version: Some("1.0.0".to_string()),
                labels: None,
            },
            spec: MeshConfigSpec::default(),
        }
    }
}

impl MeshConfigManifest {
    /// Load configuration from YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    /// Save configuration to YAML file
    pub fn to_yaml_file(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        std::fs::write(path, self.to_yaml_string()?)?;
        Ok(())
    }

    pub fn to_yaml_string(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Parse configuration from YAML string
    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Discover configuration file using precedence order
    /// 1. AGENTMESH_CONFIG_PATH environment variable
    /// 2. ./agentmesh-config.yaml (working directory)
    /// 3. ~/.agentmesh/config.yaml (user home)
    /// 4. /etc/agentmesh/config.yaml (system, Unix)
    pub fn discover_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("AGENTMESH_CONFIG_PATH") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let cwd = PathBuf::from("./agentmesh-config.yaml");
        if cwd.exists() {
            return Some(cwd);
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".agentmesh").join("config.yaml");
            if user_config.exists() {
                return Some(user_config);
            }
        }

        let system_config = PathBuf::from("/etc/agentmesh/config.yaml");
        if system_config.exists() {
            return Some(system_config);
        }

        None
    }

    /// Load configuration with discovery, fallback to default
    pub fn load_or_default(cli_path: Option<PathBuf>) -> anyhow::Result<Self> {
        // Explicit CLI path must exist and parse
        if let Some(path) = cli_path {
            tracing::info!("Loading configuration from explicit path: {:?}", path);
            let mut config = Self::from_yaml_file(&path)
                .map_err(|e| anyhow::anyhow!("Failed to load config at {:?}: {}", path, e))?;
            config.apply_env_overrides();
            return Ok(config);
        }

        let mut config = if let Some(config_path) = Self::discover_config() {
            tracing::info!("Loading configuration from discovered path: {:?}", config_path);
            Self::from_yaml_file(config_path)?
        } else {
            tracing::warn!("No configuration file found in standard locations. Using defaults.");
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary lookup (the process environment in production).
    pub fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(val) = lookup("AGENTMESH_HEARTBEAT_TIMEOUT") {
            match humantime_serde::re::humantime::parse_duration(&val) {
                Ok(timeout) => {
                    tracing::info!("Environment override: AGENTMESH_HEARTBEAT_TIMEOUT={}", val);
                    self.spec.health.heartbeat_timeout = timeout;
                }
                Err(e) => tracing::warn!(
                    "Invalid value for AGENTMESH_HEARTBEAT_TIMEOUT: '{}' ({}). Ignoring.",
                    val,
                    e
                ),
            }
        }

        if let Some(val) = lookup("AGENTMESH_MAX_ROUTE_ATTEMPTS") {
            match val.parse::<u32>() {
                Ok(attempts) => {
                    tracing::info!("Environment override: AGENTMESH_MAX_ROUTE_ATTEMPTS={}", attempts);
                    self.spec.routing.max_route_attempts = attempts;
                }
                Err(_) => tracing::warn!(
                    "Invalid value for AGENTMESH_MAX_ROUTE_ATTEMPTS: '{}'. Expected an integer. Ignoring.",
                    val
                ),
            }
        }

        if let Some(val) = lookup("AGENTMESH_PORT") {
            match val.parse::<u16>() {
                Ok(port) => {
                    tracing::info!("Environment override: AGENTMESH_PORT={}", port);
                    self.spec.network.port = port;
                }
                Err(_) => tracing::warn!("Invalid value for AGENTMESH_PORT: '{}'. Ignoring.", val),
            }
        }
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

        if self.spec.node.id.is_empty() {
            anyhow::bail!("spec.node.id cannot be empty");
        }

        let health = &self.spec.health;
        if health.check_interval.is_zero() {
            anyhow::bail!("spec.health.check_interval must be greater than zero");
        }
        if health.heartbeat_timeout < health.check_interval {
            anyhow::bail!(
                "spec.health.heartbeat_timeout ({:?}) must not be shorter than check_interval ({:?})",
                health.heartbeat_timeout,
                health.check_interval
            );
        }

        let routing = &self.spec.routing;
        if routing.max_route_attempts == 0 {
            anyhow::bail!("spec.routing.max_route_attempts must be at least 1");
        }
        if routing.backoff_max < routing.backoff_base {
            anyhow::bail!("spec.routing.backoff_max must not be smaller than backoff_base");
        }
        if routing.handoff_timeout.is_zero() || routing.route_deadline.is_zero() {
            anyhow::bail!("spec.routing handoff_timeout and route_deadline must be greater than zero");
        }

        if self.spec.delivery.per_node_capacity == 0 {
            anyhow::bail!("spec.delivery.per_node_capacity must be at least 1");
        }

        if self.spec.transport.connection_buffer == 0 {
            anyhow::bail!("spec.transport.connection_buffer must be at least 1");
        }

        Ok(())
    }
}
