//! # Config
//!
//! Wire constants and runtime configuration for servers, clients and messengers.
//!
//! Configuration can be loaded from a TOML file, from `SCS_*` environment
//! variables, or built programmatically with [`NetworkConfig::default_with_overrides`].
//! Durations are written as milliseconds in files and environment variables.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::Level;

use crate::error::{ProtocolError, Result};
use crate::utils::timeout::{
    CONNECT_TIMEOUT, KEEPALIVE_IDLE_THRESHOLD, KEEPALIVE_INTERVAL, RESPONSE_TIMEOUT,
};

/// Current wire schema version, carried as the first payload byte
pub const WIRE_VERSION: u8 = 1;

/// Sync marker opening every frame ("SC")
pub const SYNC_MARKER: [u8; 2] = [0x53, 0x43];

/// Max allowed payload size (16 MB)
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Default cap on concurrently registered server clients
pub const MAX_CONNECTIONS: usize = 1024;

/// Prefix shared by all environment overrides
const ENV_PREFIX: &str = "SCS_";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub server: ServerConfig,
    pub client: ClientConfig,
    pub messenger: MessengerConfig,
    pub transport: TransportConfig,
    pub logging: LoggingConfig,
}

/// Server connection manager settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen endpoint (`host:port`, `tcp://host:port` or `unix:///path`)
    pub address: String,
    /// Connections accepted beyond this count are dropped
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:10101".to_string(),
            max_connections: MAX_CONNECTIONS,
        }
    }
}

/// Client connection manager settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub address: String,
    /// Upper bound on a single dial attempt
    #[serde(with = "duration_ms")]
    pub connection_timeout: Duration,
    /// Period of the keep-alive timer
    #[serde(with = "duration_ms")]
    pub keepalive_interval: Duration,
    /// A ping is only sent once the channel has been idle this long
    #[serde(with = "duration_ms")]
    pub keepalive_idle_threshold: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:10101".to_string(),
            connection_timeout: CONNECT_TIMEOUT,
            keepalive_interval: KEEPALIVE_INTERVAL,
            keepalive_idle_threshold: KEEPALIVE_IDLE_THRESHOLD,
        }
    }
}

/// Request/reply messenger settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessengerConfig {
    /// Default wait for a correlated reply, overridable per call
    #[serde(with = "duration_ms")]
    pub response_timeout: Duration,
    /// Capacity of the inbound dispatch queue; `None` means unbounded
    pub queue_capacity: Option<usize>,
}

impl Default for MessengerConfig {
    fn default() -> Self {
        Self {
            response_timeout: RESPONSE_TIMEOUT,
            queue_capacity: None,
        }
    }
}

/// Channel-level transport settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub max_payload_size: usize,
    /// Disable Nagle buffering on TCP sockets
    pub no_delay: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_payload_size: MAX_PAYLOAD_SIZE,
            no_delay: true,
        }
    }
}

/// Logging settings consumed by [`crate::utils::logging::init_logging`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// The name of the application, used for the log file name and filter target
    pub app_name: String,
    #[serde(with = "level_name")]
    pub log_level: Level,
    /// Whether to enable JSON log format (useful for log aggregation)
    pub json_format: bool,
    /// Directory for daily rolling log files, `None` for console only
    pub log_dir: Option<String>,
    pub log_to_console: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: "scs_transport".to_string(),
            log_level: Level::INFO,
            json_format: false,
            log_dir: None,
            log_to_console: true,
        }
    }
}

impl NetworkConfig {
    /// Load configuration from a TOML file; missing keys keep their defaults
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        toml::from_str(&text)
            .map_err(|e| ProtocolError::Config(format!("{}: {e}", path.as_ref().display())))
    }

    /// Defaults overridden by any `SCS_*` environment variables that are set
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Defaults adjusted by a closure
    pub fn default_with_overrides<F>(f: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        f(&mut config);
        config
    }

    /// Write the configuration as TOML
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let text = toml::to_string_pretty(self)
            .map_err(|e| ProtocolError::Config(format!("cannot serialize config: {e}")))?;
        std::fs::write(path, text)?;
        Ok(())
    }

    /// Apply environment overrides in place
    pub fn apply_env(&mut self) -> Result<()> {
        if let Some(address) = env_var("SERVER_ADDRESS") {
            self.server.address = address;
        }
        if let Some(address) = env_var("CLIENT_ADDRESS") {
            self.client.address = address;
        }
        if let Some(max) = env_parse::<usize>("MAX_CONNECTIONS")? {
            self.server.max_connections = max;
        }
        if let Some(ms) = env_parse::<u64>("CONNECTION_TIMEOUT_MS")? {
            self.client.connection_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("KEEPALIVE_INTERVAL_MS")? {
            self.client.keepalive_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("KEEPALIVE_IDLE_MS")? {
            self.client.keepalive_idle_threshold = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("RESPONSE_TIMEOUT_MS")? {
            self.messenger.response_timeout = Duration::from_millis(ms);
        }
        if let Some(capacity) = env_parse::<usize>("QUEUE_CAPACITY")? {
            self.messenger.queue_capacity = Some(capacity);
        }
        if let Some(size) = env_parse::<usize>("MAX_PAYLOAD_SIZE")? {
            self.transport.max_payload_size = size;
        }
        if let Some(level) = env_parse::<Level>("LOG_LEVEL")? {
            self.logging.log_level = level;
        }
        Ok(())
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(format!("{ENV_PREFIX}{key}")).ok()
}

fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env_var(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ProtocolError::Config(format!("{ENV_PREFIX}{key}={raw}: {e}"))),
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let ms = u64::try_from(value.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(ms)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

mod level_name {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};
    use tracing::Level;

    pub fn serialize<S: Serializer>(value: &Level, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string().to_lowercase())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Level, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse::<Level>().map_err(D::Error::custom)
    }
}
