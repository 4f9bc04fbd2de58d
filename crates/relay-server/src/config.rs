//! Server configuration.
//!
//! Configuration can be loaded from:
//! - TOML configuration file
//! - Environment variables (RELAY__*, `__` separating sections)

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Known apps. Empty means any app id is accepted.
    #[serde(default)]
    pub apps: Vec<AppConfig>,

    /// Cluster replication.
    #[serde(default)]
    pub replication: ReplicationConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Heartbeat configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// One tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// App identifier.
    pub id: String,

    /// Whether connections may publish events themselves.
    #[serde(default = "default_true")]
    pub enable_client_messages: bool,
}

/// Which backend carries replication traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicationDriver {
    /// In-process hub; only useful for a single process.
    Memory,
    /// Shared WebSocket hub.
    Websocket,
    /// Redis pub/sub.
    Redis,
}

/// Cluster replication configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Enable replication.
    #[serde(default)]
    pub enabled: bool,

    /// Transport backend.
    #[serde(default = "default_driver")]
    pub driver: ReplicationDriver,

    /// This node's identity. Generated when unset.
    #[serde(default)]
    pub node_id: Option<String>,

    /// Member count query deadline in milliseconds.
    #[serde(default = "default_query_timeout")]
    pub query_timeout_ms: u64,

    /// Number of other nodes expected to answer queries. Unknown when
    /// unset, in which case every query waits for its deadline. Ignored by
    /// the memory driver, which never has peers.
    #[serde(default)]
    pub expected_peers: Option<usize>,

    /// Hub to connect to with the websocket driver.
    #[serde(default = "default_hub_url")]
    pub hub_url: String,

    /// Also run the hub in this process, listening here.
    #[serde(default)]
    pub hub_listen: Option<String>,

    /// Redis server for the redis driver.
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Deployment-wide topic prefix.
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum subscriptions per connection.
    #[serde(default = "default_max_subscriptions")]
    pub max_subscriptions_per_connection: usize,

    /// Maximum message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Outbound queue length per connection.
    #[serde(default = "default_connection_buffer")]
    pub connection_buffer: usize,

    /// Keep empty channels listed until they are removed explicitly.
    #[serde(default)]
    pub retain_empty_channels: bool,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Heartbeat interval in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,

    /// Connection timeout in milliseconds.
    #[serde(default = "default_heartbeat_timeout")]
    pub timeout_ms: u64,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,

    /// How often manager statistics are exported, in seconds.
    #[serde(default = "default_stats_interval")]
    pub stats_interval_secs: u64,
}

// Default value functions
fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    6001
}

fn default_true() -> bool {
    true
}

fn default_driver() -> ReplicationDriver {
    ReplicationDriver::Memory
}

fn default_query_timeout() -> u64 {
    2_000
}

fn default_hub_url() -> String {
    "ws://127.0.0.1:6010".to_string()
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_topic_prefix() -> String {
    tenvis_relay_core::topic::DEFAULT_TOPIC_PREFIX.to_string()
}

fn default_max_connections() -> usize {
    100_000
}

fn default_max_subscriptions() -> usize {
    100
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_connection_buffer() -> usize {
    1024
}

fn default_heartbeat_interval() -> u64 {
    30_000 // 30 seconds
}

fn default_heartbeat_timeout() -> u64 {
    120_000 // 2 minutes
}

fn default_metrics_port() -> u16 {
    9601
}

fn default_stats_interval() -> u64 {
    10
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            apps: Vec::new(),
            replication: ReplicationConfig::default(),
            limits: LimitsConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            driver: default_driver(),
            node_id: None,
            query_timeout_ms: default_query_timeout(),
            expected_peers: None,
            hub_url: default_hub_url(),
            hub_listen: None,
            redis_url: default_redis_url(),
            topic_prefix: default_topic_prefix(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_subscriptions_per_connection: default_max_subscriptions(),
            max_message_size: default_max_message_size(),
            connection_buffer: default_connection_buffer(),
            retain_empty_channels: false,
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval(),
            timeout_ms: default_heartbeat_timeout(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
            stats_interval_secs: default_stats_interval(),
        }
    }
}

impl ReplicationConfig {
    /// Query deadline as a duration.
    #[must_use]
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
}

impl Config {
    /// Default config file locations, in lookup order.
    pub const SEARCH_PATHS: [&'static str; 3] = [
        "relay.toml",
        "/etc/relay/relay.toml",
        "~/.config/relay/relay.toml",
    ];

    /// Load configuration from the first config file found, layered with
    /// `RELAY__*` environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed, or
    /// the result fails validation.
    pub fn load() -> Result<Self> {
        let file = Self::SEARCH_PATHS
            .iter()
            .map(|path| PathBuf::from(shellexpand::tilde(path).as_ref()))
            .find(|path| path.exists());

        let mut builder = ::config::Config::builder();
        if let Some(path) = &file {
            builder = builder.add_source(
                ::config::File::from(path.as_path()).format(::config::FileFormat::Toml),
            );
        }
        builder = builder.add_source(
            ::config::Environment::with_prefix("RELAY")
                .separator("__")
                .try_parsing(true),
        );

        let config: Config = builder
            .build()
            .context("Failed to assemble configuration")?
            .try_deserialize()
            .context("Invalid configuration")?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Check settings that depend on each other.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first inconsistency found.
    pub fn validate(&self) -> Result<()> {
        if self.replication.enabled && self.apps.is_empty() {
            bail!("Replication needs the app list: add at least one [[apps]] entry");
        }
        if self.limits.connection_buffer == 0 {
            bail!("limits.connection_buffer must be at least 1");
        }
        if self.replication.query_timeout_ms == 0 {
            bail!("replication.query_timeout_ms must be at least 1");
        }
        Ok(())
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid host:port {}:{}", self.host, self.port))
    }

    /// Look up a configured app.
    #[must_use]
    pub fn app(&self, app_id: &str) -> Option<&AppConfig> {
        self.apps.iter().find(|app| app.id == app_id)
    }

    /// Check if connections and API calls for `app_id` are accepted.
    #[must_use]
    pub fn allows_app(&self, app_id: &str) -> bool {
        self.apps.is_empty() || self.app(app_id).is_some()
    }

    /// Check if connections of `app_id` may publish events.
    #[must_use]
    pub fn client_messages_enabled(&self, app_id: &str) -> bool {
        self.app(app_id).map_or(true, |app| app.enable_client_messages)
    }

    /// Ids of every configured app.
    #[must_use]
    pub fn app_ids(&self) -> Vec<String> {
        self.apps.iter().map(|app| app.id.clone()).collect()
    }
}
