//! WolfLite Configuration
//!
//! Configuration structures consumed by the replication engine. Loading the
//! file is the binary's job; the engine only relies on a validated struct.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main WolfLite configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WolfLiteConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Transaction log configuration
    #[serde(default)]
    pub log: LogConfig,

    /// Log retention configuration
    #[serde(default)]
    pub retention: RetentionConfig,

    /// Replication stream configuration
    #[serde(default)]
    pub stream: StreamConfig,

    /// Consul lease configuration
    #[serde(default)]
    pub consul: Option<ConsulConfig>,

    /// Static lease configuration
    #[serde(default, rename = "static")]
    pub static_lease: Option<StaticConfig>,

    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node identifier
    pub id: String,

    /// Data directory for logs, page images and state
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Address the replication stream server binds to
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Advertised stream address for replicas to connect to
    #[serde(default)]
    pub advertise_address: Option<String>,

    /// Whether this node may ever become primary
    #[serde(default = "default_true")]
    pub candidate: bool,

    /// How often a non-primary node retries the lease, in milliseconds
    #[serde(default = "default_lease_poll_ms")]
    pub lease_poll_interval_ms: u64,
}

/// Transaction log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Enable LZ4 compression for record frames
    #[serde(default)]
    pub compression: bool,

    /// Use fsync for durability (only disable for tests)
    #[serde(default = "default_true")]
    pub fsync: bool,

    /// Read every appended frame back and verify it before publishing
    #[serde(default)]
    pub strict_verify: bool,

    /// Maximum number of records per segment file
    #[serde(default = "default_segment_max_records")]
    pub segment_max_records: u32,

    /// Maximum segment size in megabytes
    #[serde(default = "default_segment_size_mb")]
    pub segment_size_mb: u64,

    /// Maximum number of queued appends flushed with a single sync
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

/// Log retention configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Minimum age of a record before it may be deleted, in seconds
    #[serde(default = "default_retention_secs")]
    pub duration_secs: u64,

    /// How often the retention monitor runs, in seconds
    #[serde(default = "default_retention_monitor_secs")]
    pub monitor_interval_secs: u64,

    /// How long a disconnected replica keeps holding the retention floor
    #[serde(default = "default_replica_grace_secs")]
    pub replica_grace_secs: u64,
}

/// Replication stream configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Interval between primary heartbeats in milliseconds
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Replica read timeout before the stream is considered dead
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,

    /// Connection timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Initial reconnect/retry backoff in milliseconds
    #[serde(default = "default_backoff_min_ms")]
    pub backoff_min_ms: u64,

    /// Maximum reconnect/retry backoff in milliseconds
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Maximum records read from disk per stream batch
    #[serde(default = "default_max_batch_entries")]
    pub max_batch_entries: usize,
}

/// Consul lease configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsulConfig {
    /// Consul agent URL
    pub url: String,

    /// Hostname reported as lease holder; must equal the node id when set
    #[serde(default)]
    pub hostname: Option<String>,

    /// Stream address published with the lease (node advertise address if unset)
    #[serde(default)]
    pub advertise_address: Option<String>,

    /// KV key used as the primary lock
    #[serde(default = "default_consul_key")]
    pub key: String,

    /// Session TTL in seconds
    #[serde(default = "default_consul_ttl_secs")]
    pub ttl_secs: u64,

    /// Lock delay after an unclean release, in seconds
    #[serde(default = "default_consul_lock_delay_secs")]
    pub lock_delay_secs: u64,
}

/// Static lease configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticConfig {
    /// Whether this node is the primary
    pub primary: bool,

    /// Hostname of the primary
    pub hostname: String,

    /// Stream address of the primary
    pub advertise_address: String,
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Enable HTTP API
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// HTTP API bind address
    #[serde(default = "default_api_address")]
    pub bind_address: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// The single lease strategy a valid configuration selects
#[derive(Debug, Clone, Copy)]
pub enum LeaseMode<'a> {
    Consul(&'a ConsulConfig),
    Static(&'a StaticConfig),
}

// Default value functions
fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/wolflite")
}

fn default_bind_address() -> String {
    "0.0.0.0:20202".to_string()
}

fn default_true() -> bool {
    true
}

fn default_lease_poll_ms() -> u64 {
    1000
}

fn default_segment_max_records() -> u32 {
    1024
}

fn default_segment_size_mb() -> u64 {
    64
}

fn default_batch_size() -> usize {
    256
}

fn default_retention_secs() -> u64 {
    600
}

fn default_retention_monitor_secs() -> u64 {
    60
}

fn default_replica_grace_secs() -> u64 {
    60
}

fn default_heartbeat_interval_ms() -> u64 {
    1000
}

fn default_heartbeat_timeout_ms() -> u64 {
    5000
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_backoff_min_ms() -> u64 {
    100
}

fn default_backoff_max_ms() -> u64 {
    5000
}

fn default_max_batch_entries() -> usize {
    256
}

fn default_consul_key() -> String {
    "wolflite/primary".to_string()
}

fn default_consul_ttl_secs() -> u64 {
    10
}

fn default_consul_lock_delay_secs() -> u64 {
    5
}

fn default_api_address() -> String {
    "0.0.0.0:20203".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            compression: false,
            fsync: true,
            strict_verify: false,
            segment_max_records: default_segment_max_records(),
            segment_size_mb: default_segment_size_mb(),
            batch_size: default_batch_size(),
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            duration_secs: default_retention_secs(),
            monitor_interval_secs: default_retention_monitor_secs(),
            replica_grace_secs: default_replica_grace_secs(),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            backoff_min_ms: default_backoff_min_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            max_batch_entries: default_max_batch_entries(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: default_api_address(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl NodeConfig {
    pub fn lease_poll_interval(&self) -> Duration {
        Duration::from_millis(self.lease_poll_interval_ms.max(1))
    }
}

impl RetentionConfig {
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs.max(1))
    }

    pub fn replica_grace(&self) -> Duration {
        Duration::from_secs(self.replica_grace_secs)
    }
}

impl StreamConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn backoff_min(&self) -> Duration {
        Duration::from_millis(self.backoff_min_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms.max(self.backoff_min_ms))
    }
}

impl ConsulConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn lock_delay(&self) -> Duration {
        Duration::from_secs(self.lock_delay_secs)
    }
}

impl WolfLiteConfig {
    /// Create a configuration with defaults for the given node
    pub fn new(node_id: impl Into<String>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            node: NodeConfig {
                id: node_id.into(),
                data_dir: data_dir.into(),
                bind_address: default_bind_address(),
                advertise_address: None,
                candidate: true,
                lease_poll_interval_ms: default_lease_poll_ms(),
            },
            log: LogConfig::default(),
            retention: RetentionConfig::default(),
            stream: StreamConfig::default(),
            consul: None,
            static_lease: None,
            api: ApiConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: WolfLiteConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the full configuration, including the lease strategy
    pub fn validate(&self) -> crate::Result<()> {
        self.validate_node()?;
        self.lease_mode()?;
        Ok(())
    }

    /// Validate the parts of the configuration the store itself depends on
    pub fn validate_node(&self) -> crate::Result<()> {
        if self.node.id.is_empty() {
            return Err(crate::Error::Config("node.id cannot be empty".into()));
        }

        if self.node.data_dir.as_os_str().is_empty() {
            return Err(crate::Error::Config("node.data_dir cannot be empty".into()));
        }

        if self.log.segment_max_records == 0 {
            return Err(crate::Error::Config(
                "log.segment_max_records must be at least 1".into(),
            ));
        }

        if self.stream.max_batch_entries == 0 {
            return Err(crate::Error::Config(
                "stream.max_batch_entries must be at least 1".into(),
            ));
        }

        Ok(())
    }

    /// Get the lease strategy; exactly one must be configured
    pub fn lease_mode(&self) -> crate::Result<LeaseMode<'_>> {
        match (&self.consul, &self.static_lease) {
            (Some(_), Some(_)) => Err(crate::Error::Config(
                "cannot specify both 'consul' and 'static' lease modes".into(),
            )),
            (None, None) => Err(crate::Error::Config(
                "must specify a lease mode ('consul', 'static')".into(),
            )),
            (Some(consul), None) => {
                // Replicas recognise the primary by node id
                if let Some(hostname) = consul.hostname.as_deref() {
                    if hostname != self.node.id {
                        return Err(crate::Error::Config(format!(
                            "consul.hostname '{}' must match node.id '{}'",
                            hostname, self.node.id
                        )));
                    }
                }
                Ok(LeaseMode::Consul(consul))
            }
            (None, Some(fixed)) => {
                if fixed.primary && fixed.hostname != self.node.id {
                    return Err(crate::Error::Config(format!(
                        "static primary hostname '{}' must match node.id '{}'",
                        fixed.hostname, self.node.id
                    )));
                }
                Ok(LeaseMode::Static(fixed))
            }
        }
    }

    /// Get the advertised stream address (or bind address if not set)
    pub fn advertise_address(&self) -> &str {
        self.node
            .advertise_address
            .as_deref()
            .unwrap_or(&self.node.bind_address)
    }

    /// Get the data directory path
    pub fn data_dir(&self) -> &PathBuf {
        &self.node.data_dir
    }

    /// Get the directory holding one subdirectory per database
    pub fn databases_dir(&self) -> PathBuf {
        self.node.data_dir.join("dbs")
    }

    /// Get the state directory path
    pub fn state_dir(&self) -> PathBuf {
        self.node.data_dir.join("state")
    }
}
