//! # Configuration Management
//!
//! JSON configuration for the links built from this crate: the gateway
//! itself, a backend server's cluster connector, an end-user client and an
//! inner pair link.
//!
//! ## Configuration Sources
//! - JSON files via `from_file()`
//! - JSON strings via `from_json()`
//! - Direct instantiation with defaults
//!
//! Durations are written in milliseconds. Configuration is loaded once at
//! startup; a missing or malformed file is fatal for the binary.

use crate::error::{GatewayError, Result};
use crate::protocol::messages::LinkType;
use crate::utils::compression::CompressionKind;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Config file read by the binary when no path is given
pub const DEFAULT_CONFIG_PATH: &str = "proxy_config.json";

/// Granularity of the receive-side keepalive check
pub const KEEP_ALIVE_PRECISION: Duration = Duration::from_millis(1000);

/// Default margin before the keepalive timeout at which a heartbeat is sent
pub const DEFAULT_MAX_SEND_DELAY: Duration = Duration::from_millis(2000);

/// Period of the routing table sweep
pub const CLEANUP_PERIOD: Duration = Duration::from_millis(3000);

/// Delay before retrying a delivery the logic refused
pub const DELIVERY_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Socket linger and graceful-close drain limit
pub const LINGER_TIMEOUT: Duration = Duration::from_secs(10);

/// Default ring buffer size for cluster and inner pair links (10 MiB)
pub const DEFAULT_RING_CAPACITY: usize = 10 * 1024 * 1024;

/// Smallest ring that still fits one maximal entry
pub const MIN_RING_CAPACITY: usize = 128 * 1024;

fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        GatewayError::ConfigError(format!(
            "Failed to read config file {}: {e}",
            path.display()
        ))
    })?;
    parse_json(&contents)
}

fn parse_json<T: DeserializeOwned>(content: &str) -> Result<T> {
    serde_json::from_str::<T>(content)
        .map_err(|e| GatewayError::ConfigError(format!("Failed to parse JSON: {e}")))
}

fn strict(errors: Vec<String>) -> Result<()> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(GatewayError::ConfigError(format!(
            "Configuration validation failed:\n  - {}",
            errors.join("\n  - ")
        )))
    }
}

/// Keepalive timing shared by every connection a process owns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct KeepaliveConfig {
    /// Period of the per-connection timer
    #[serde(with = "duration_serde")]
    pub tick_interval: Duration,

    /// Receive silence after which a connection is kicked
    #[serde(with = "duration_serde")]
    pub keep_alive_timeout: Duration,

    /// How long before `keep_alive_timeout` a heartbeat goes out
    #[serde(with = "duration_serde", default = "default_max_send_delay")]
    pub max_send_delay: Duration,
}

fn default_max_send_delay() -> Duration {
    DEFAULT_MAX_SEND_DELAY
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(100),
            keep_alive_timeout: Duration::from_secs(30),
            max_send_delay: DEFAULT_MAX_SEND_DELAY,
        }
    }
}

impl KeepaliveConfig {
    /// Number of ticks between two receive-side checks, at least 1
    pub fn ticks_per_check(&self) -> u64 {
        let tick = self.tick_interval.as_millis().max(1);
        let precision = KEEP_ALIVE_PRECISION.as_millis();
        (((precision + tick / 2) / tick) as u64).max(1)
    }

    /// Send silence after which a heartbeat is due
    pub fn send_deadline(&self) -> Duration {
        self.keep_alive_timeout.saturating_sub(self.max_send_delay)
    }

    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.tick_interval.as_millis() < 10 {
            errors.push("Tick interval too short (minimum: 10ms)".to_string());
        } else if self.tick_interval > KEEP_ALIVE_PRECISION {
            errors.push(format!(
                "Tick interval too long: {}ms (maximum: {}ms)",
                self.tick_interval.as_millis(),
                KEEP_ALIVE_PRECISION.as_millis()
            ));
        }

        if self.keep_alive_timeout < KEEP_ALIVE_PRECISION {
            errors.push("Keep-alive timeout too short (minimum: 1000ms)".to_string());
        } else if self.keep_alive_timeout.as_secs() > 3600 {
            errors.push("Keep-alive timeout too long (maximum: 1 hour)".to_string());
        }

        if self.max_send_delay >= self.keep_alive_timeout {
            errors.push(format!(
                "Max send delay ({}ms) must be shorter than the keep-alive timeout ({}ms)",
                self.max_send_delay.as_millis(),
                self.keep_alive_timeout.as_millis()
            ));
        }

        errors
    }
}

/// Gateway process configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxyConfig {
    /// TCP port the gateway accepts on; 0 picks an ephemeral port
    pub listened_port: u16,

    /// Number of execution lanes
    pub session_thread_num: usize,

    #[serde(flatten)]
    pub keepalive: KeepaliveConfig,

    /// Compressor for client-facing payloads
    #[serde(default)]
    pub compression: CompressionKind,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listened_port: 9000,
            session_thread_num: 4,
            keepalive: KeepaliveConfig::default(),
            compression: CompressionKind::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl ProxyConfig {
    /// Load configuration from a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        load_json(path.as_ref())
    }

    /// Load configuration from a JSON string
    pub fn from_json(content: &str) -> Result<Self> {
        parse_json(content)
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.session_thread_num == 0 {
            errors.push("session_thread_num must be greater than 0".to_string());
        } else if self.session_thread_num > 256 {
            errors.push(format!(
                "session_thread_num too large: {} (maximum: 256)",
                self.session_thread_num
            ));
        }

        errors.extend(self.keepalive.validate());
        errors.extend(self.logging.validate());
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        strict(self.validate())
    }
}

/// Backend server side of the gateway link
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClusterConfig {
    /// Gateway address
    pub proxy_ip: String,
    pub proxy_port: u16,

    /// Server id within the area
    pub sid: u16,
    pub area_id: u16,

    /// Platform tag hashed into the server identity
    pub platform: String,

    /// Link type announced in the auth request
    #[serde(default = "default_cluster_link")]
    pub link_type: LinkType,

    #[serde(flatten)]
    pub keepalive: KeepaliveConfig,

    /// Bytes reserved for inbound entries awaiting `pick_msg`
    #[serde(default = "default_ring_capacity")]
    pub ring_capacity: usize,

    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_cluster_link() -> LinkType {
    LinkType::ActiveGameServer
}

fn default_ring_capacity() -> usize {
    DEFAULT_RING_CAPACITY
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            proxy_ip: String::from("127.0.0.1"),
            proxy_port: 9000,
            sid: 1,
            area_id: 1,
            platform: String::from("default"),
            link_type: default_cluster_link(),
            keepalive: KeepaliveConfig::default(),
            ring_capacity: DEFAULT_RING_CAPACITY,
            logging: LoggingConfig::default(),
        }
    }
}

impl ClusterConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        load_json(path.as_ref())
    }

    pub fn from_json(content: &str) -> Result<Self> {
        parse_json(content)
    }

    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.proxy_ip.parse::<IpAddr>().is_err() {
            errors.push(format!("Invalid proxy_ip: '{}'", self.proxy_ip));
        }
        if self.proxy_port == 0 {
            errors.push("proxy_port cannot be 0".to_string());
        }
        errors.extend(validate_platform(&self.platform));
        if !self.link_type.is_server() {
            errors.push(format!(
                "link_type {:?} is not a server link type",
                self.link_type
            ));
        }

        errors.extend(validate_ring(self.ring_capacity));
        errors.extend(self.keepalive.validate());
        errors.extend(self.logging.validate());
        errors
    }

    pub fn validate_strict(&self) -> Result<()> {
        strict(self.validate())
    }
}

/// End-user client side of the gateway link
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    /// Gateway address
    pub proxy_ip: String,
    pub proxy_port: u16,

    /// Server the client asks to be routed to
    pub sid: u16,
    pub area_id: u16,
    pub platform: String,

    #[serde(flatten)]
    pub keepalive: KeepaliveConfig,

    /// Must match the gateway's client-facing compressor
    #[serde(default)]
    pub compression: CompressionKind,

    #[serde(default = "default_ring_capacity")]
    pub ring_capacity: usize,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            proxy_ip: String::from("127.0.0.1"),
            proxy_port: 9000,
            sid: 1,
            area_id: 1,
            platform: String::from("default"),
            keepalive: KeepaliveConfig::default(),
            compression: CompressionKind::default(),
            ring_capacity: DEFAULT_RING_CAPACITY,
            logging: LoggingConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        load_json(path.as_ref())
    }

    pub fn from_json(content: &str) -> Result<Self> {
        parse_json(content)
    }

    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.proxy_ip.parse::<IpAddr>().is_err() {
            errors.push(format!("Invalid proxy_ip: '{}'", self.proxy_ip));
        }
        if self.proxy_port == 0 {
            errors.push("proxy_port cannot be 0".to_string());
        }
        errors.extend(validate_platform(&self.platform));
        errors.extend(validate_ring(self.ring_capacity));
        errors.extend(self.keepalive.validate());
        errors.extend(self.logging.validate());
        errors
    }

    pub fn validate_strict(&self) -> Result<()> {
        strict(self.validate())
    }
}

/// Direct LAN peer link
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InnerPairConfig {
    /// Peer address, used when `is_connector` is set
    pub ip: String,
    pub port: u16,

    /// Local port, used when `is_connector` is not set
    pub listened_port: u16,

    pub is_connector: bool,

    #[serde(flatten)]
    pub keepalive: KeepaliveConfig,

    #[serde(default = "default_ring_capacity")]
    pub ring_capacity: usize,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for InnerPairConfig {
    fn default() -> Self {
        Self {
            ip: String::from("127.0.0.1"),
            port: 9100,
            listened_port: 9100,
            is_connector: true,
            keepalive: KeepaliveConfig::default(),
            ring_capacity: DEFAULT_RING_CAPACITY,
            logging: LoggingConfig::default(),
        }
    }
}

impl InnerPairConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        load_json(path.as_ref())
    }

    pub fn from_json(content: &str) -> Result<Self> {
        parse_json(content)
    }

    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.is_connector {
            if self.ip.parse::<IpAddr>().is_err() {
                errors.push(format!("Invalid peer ip: '{}'", self.ip));
            }
            if self.port == 0 {
                errors.push("port cannot be 0 for a connector".to_string());
            }
        }

        errors.extend(validate_ring(self.ring_capacity));
        errors.extend(self.keepalive.validate());
        errors.extend(self.logging.validate());
        errors
    }

    pub fn validate_strict(&self) -> Result<()> {
        strict(self.validate())
    }
}

fn validate_platform(platform: &str) -> Vec<String> {
    let mut errors = Vec::new();
    if platform.is_empty() {
        errors.push("platform cannot be empty".to_string());
    } else if platform.len() > usize::from(u8::MAX) {
        errors.push(format!(
            "platform too long: {} bytes (maximum: 255)",
            platform.len()
        ));
    } else if platform.as_bytes().contains(&0) {
        errors.push("platform cannot contain NUL bytes".to_string());
    }
    errors
}

fn validate_ring(capacity: usize) -> Vec<String> {
    let mut errors = Vec::new();
    if capacity < MIN_RING_CAPACITY {
        errors.push(format!(
            "ring_capacity too small: {capacity} bytes (minimum: {MIN_RING_CAPACITY})"
        ));
    } else if capacity > 1024 * 1024 * 1024 {
        errors.push(format!(
            "ring_capacity too large: {capacity} bytes (maximum: 1 GiB)"
        ));
    }
    errors
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Log level
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to log to console
    pub log_to_console: bool,

    /// Whether to log to file
    pub log_to_file: bool,

    /// Path to log file (if log_to_file is true)
    pub log_file_path: Option<String>,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("session-gateway"),
            log_level: Level::INFO,
            log_to_console: true,
            log_to_file: false,
            log_file_path: None,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    /// Validate logging configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.app_name.len() > 64 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 64)",
                self.app_name.len()
            ));
        }

        if self.log_to_file {
            match self.log_file_path {
                Some(ref path) => {
                    if let Some(parent) = Path::new(path).parent() {
                        if !parent.as_os_str().is_empty() && !parent.exists() {
                            errors.push(format!(
                                "Log file directory does not exist: {}",
                                parent.display()
                            ));
                        }
                    }
                }
                None => errors
                    .push("log_file_path must be specified when log_to_file is true".to_string()),
            }
        }

        if !self.log_to_console && !self.log_to_file {
            errors
                .push("At least one logging output (console or file) must be enabled".to_string());
        }

        errors
    }
}

/// Durations as integer milliseconds
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis() as u64;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Helper module for tracing::Level serialization/deserialization
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let level_str = match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        };
        level_str.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn ticks_per_check_rounds_and_floors_at_one() {
        let mut keepalive = KeepaliveConfig::default();
        keepalive.tick_interval = Duration::from_millis(100);
        assert_eq!(keepalive.ticks_per_check(), 10);
        keepalive.tick_interval = Duration::from_millis(300);
        assert_eq!(keepalive.ticks_per_check(), 3);
        keepalive.tick_interval = Duration::from_millis(400);
        assert_eq!(keepalive.ticks_per_check(), 3);
        keepalive.tick_interval = Duration::from_millis(1000);
        assert_eq!(keepalive.ticks_per_check(), 1);
    }

    #[test]
    fn max_send_delay_defaults_when_absent() {
        let config = ProxyConfig::from_json(
            r#"{"listened_port":9000,"session_thread_num":2,"tick_interval":100,"keep_alive_timeout":30000}"#,
        )
        .expect("parse");
        assert_eq!(config.keepalive.max_send_delay, DEFAULT_MAX_SEND_DELAY);
        assert_eq!(config.compression, CompressionKind::Lz4);
        assert!(config.validate().is_empty());
    }

    #[test]
    fn missing_required_key_is_rejected() {
        let err = ProxyConfig::from_json(r#"{"listened_port":9000}"#).unwrap_err();
        assert!(matches!(err, GatewayError::ConfigError(_)));
    }

    #[test]
    fn client_config_defaults_and_platform_rules() {
        let config = ClientConfig::from_json(
            r#"{"proxy_ip":"10.0.0.5","proxy_port":9000,"sid":7,"area_id":1,"platform":"ios","tick_interval":100,"keep_alive_timeout":30000}"#,
        )
        .expect("parse");
        assert_eq!(config.compression, CompressionKind::Lz4);
        assert_eq!(config.ring_capacity, DEFAULT_RING_CAPACITY);
        assert!(config.validate().is_empty());

        let bad = ClientConfig {
            platform: "a\0b".to_string(),
            proxy_port: 0,
            ..ClientConfig::default()
        };
        let errors = bad.validate();
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().any(|e| e.contains("NUL")));
        assert!(bad.validate_strict().is_err());
    }
}
