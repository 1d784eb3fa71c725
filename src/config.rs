//! # Configuration Management
//!
//! Centralized configuration for the RPC server, the client channel and the
//! example binaries.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()` / `from_toml()`
//! - Environment variables (`SECURE_RPC_*`) via `from_env()`
//! - Direct instantiation with defaults and `default_with_overrides()`
//!
//! Durations are serialized as whole milliseconds.

use crate::error::{ProtocolError, Result};
use crate::protocol::auth::DEFAULT_TOKEN_HEADER;
use crate::utils::timeout;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Current supported protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// Magic bytes to identify protocol packets ("SRPC")
pub const MAGIC_BYTES: [u8; 4] = *b"SRPC";

/// Max allowed payload size (16 MiB)
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Port the greet server listens on unless told otherwise
pub const DEFAULT_PORT: u16 = 50051;

/// Token the example server accepts by default
pub const DEFAULT_TOKEN: &str = "valid-token";

/// Top-level configuration
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct RpcConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub client: ClientConfig,

    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl RpcConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Defaults overridden by `SECURE_RPC_*` environment variables.
    ///
    /// Unparseable numeric values are reported rather than ignored.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("SECURE_RPC_SERVER_ADDRESS") {
            config.server.address = addr;
        }

        if let Ok(addr) = std::env::var("SECURE_RPC_CLIENT_ADDRESS") {
            config.client.address = addr;
        }

        if let Some(val) = env_parse::<usize>("SECURE_RPC_BACKPRESSURE_LIMIT")? {
            config.server.backpressure_limit = val;
            config.client.backpressure_limit = val;
        }

        if let Some(val) = env_parse::<u64>("SECURE_RPC_CONNECTION_TIMEOUT_MS")? {
            config.server.handshake_timeout = Duration::from_millis(val);
            config.client.connection_timeout = Duration::from_millis(val);
        }

        if let Some(val) = env_parse::<u64>("SECURE_RPC_CALL_TIMEOUT_MS")? {
            config.client.call_timeout = Some(Duration::from_millis(val));
        }

        if let Some(val) = env_parse::<usize>("SECURE_RPC_MAX_PAYLOAD_SIZE")? {
            config.transport.max_payload_size = val;
        }

        if let Ok(header) = std::env::var("SECURE_RPC_TOKEN_HEADER") {
            config.auth.header = header;
        }

        if let Ok(token) = std::env::var("SECURE_RPC_TOKEN") {
            config.auth.token = token;
        }

        if let Ok(level) = std::env::var("SECURE_RPC_LOG_LEVEL") {
            config.logging.log_level = level.parse::<Level>().map_err(|_| {
                ProtocolError::ConfigError(format!("Invalid SECURE_RPC_LOG_LEVEL: {level}"))
            })?;
        }

        Ok(config)
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

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.server.validate());
        errors.extend(self.client.validate());
        errors.extend(self.transport.validate());
        errors.extend(self.auth.validate());
        errors.extend(self.logging.validate());
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| ProtocolError::ConfigError(format!("Invalid {name}: {raw}"))),
        Err(_) => Ok(None),
    }
}

/// Server-specific configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Listen address (e.g., "0.0.0.0:50051")
    pub address: String,

    /// Capacity of each connection's outbound frame queue
    pub backpressure_limit: usize,

    /// Upper bound on the TLS handshake of an accepted socket
    #[serde(with = "duration_serde")]
    pub handshake_timeout: Duration,

    /// How long in-flight calls may run after shutdown starts
    #[serde(with = "duration_serde")]
    pub shutdown_timeout: Duration,

    /// Maximum number of concurrent connections
    pub max_connections: usize,

    /// Maximum number of concurrent calls per connection
    pub max_concurrent_calls: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: format!("0.0.0.0:{DEFAULT_PORT}"),
            backpressure_limit: 32,
            handshake_timeout: timeout::DEFAULT_TIMEOUT,
            shutdown_timeout: timeout::SHUTDOWN_TIMEOUT,
            max_connections: 1000,
            max_concurrent_calls: 100,
        }
    }
}

impl ServerConfig {
    /// Validate server configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.address.is_empty() {
            errors.push("Server address cannot be empty".to_string());
        } else if self.address.parse::<std::net::SocketAddr>().is_err() {
            errors.push(format!(
                "Invalid server address format: '{}' (expected format: '0.0.0.0:50051')",
                self.address
            ));
        }

        if self.backpressure_limit == 0 {
            errors.push("Backpressure limit must be greater than 0".to_string());
        } else if self.backpressure_limit > 1_000_000 {
            errors.push(format!(
                "Backpressure limit too large: {} (max recommended: 1,000,000)",
                self.backpressure_limit
            ));
        }

        if self.handshake_timeout.as_millis() < 100 {
            errors.push("Handshake timeout too short (minimum: 100ms)".to_string());
        } else if self.handshake_timeout.as_secs() > 300 {
            errors.push("Handshake timeout too long (maximum: 300s)".to_string());
        }

        if self.shutdown_timeout.as_millis() < 100 {
            errors.push("Shutdown timeout too short (minimum: 100ms)".to_string());
        } else if self.shutdown_timeout.as_secs() > 60 {
            errors.push("Shutdown timeout too long (maximum: 60s)".to_string());
        }

        if self.max_connections == 0 {
            errors.push("Max connections must be greater than 0".to_string());
        }

        if self.max_concurrent_calls == 0 {
            errors.push("Max concurrent calls must be greater than 0".to_string());
        }

        errors
    }
}

/// Client-specific configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    /// Target server as `host:port`
    pub address: String,

    /// Bound on TCP connect, TLS handshake and the server preface together
    #[serde(with = "duration_serde")]
    pub connection_timeout: Duration,

    /// Deadline applied to calls that do not set their own
    #[serde(
        default,
        with = "option_duration_serde",
        skip_serializing_if = "Option::is_none"
    )]
    pub call_timeout: Option<Duration>,

    /// Capacity of the outbound frame queue
    pub backpressure_limit: usize,

    /// How long `close` waits for in-flight calls
    #[serde(with = "duration_serde")]
    pub close_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: format!("localhost:{DEFAULT_PORT}"),
            connection_timeout: timeout::DEFAULT_TIMEOUT,
            call_timeout: None,
            backpressure_limit: 32,
            close_timeout: timeout::SHUTDOWN_TIMEOUT,
        }
    }
}

impl ClientConfig {
    /// Validate client configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        match self.address.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {}
            _ => errors.push(format!(
                "Invalid client address format: '{}' (expected format: 'localhost:50051')",
                self.address
            )),
        }

        if self.connection_timeout.as_millis() < 100 {
            errors.push("Connection timeout too short (minimum: 100ms)".to_string());
        }

        if let Some(call_timeout) = self.call_timeout {
            if call_timeout.as_millis() < 10 {
                errors.push("Call timeout too short (minimum: 10ms)".to_string());
            }
        }

        if self.backpressure_limit == 0 {
            errors.push("Backpressure limit must be greater than 0".to_string());
        }

        if self.close_timeout.as_secs() > 60 {
            errors.push("Close timeout too long (maximum: 60s)".to_string());
        }

        errors
    }
}

/// Transport configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransportConfig {
    /// Maximum allowed payload size in bytes
    pub max_payload_size: usize,

    /// Capacity of each call's inbound message queue
    pub call_buffer: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_payload_size: MAX_PAYLOAD_SIZE,
            call_buffer: 16,
        }
    }
}

impl TransportConfig {
    /// Validate transport configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.max_payload_size < 1024 {
            errors.push("Max payload size too small (minimum: 1 KB)".to_string());
        } else if self.max_payload_size > MAX_PAYLOAD_SIZE {
            errors.push(format!(
                "Max payload size too large: {} bytes (protocol maximum: {MAX_PAYLOAD_SIZE})",
                self.max_payload_size
            ));
        }

        if self.call_buffer == 0 {
            errors.push("Call buffer must be greater than 0".to_string());
        }

        errors
    }
}

/// Credential settings shared by both binaries
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuthConfig {
    /// Metadata key carrying the bearer token
    pub header: String,

    /// Token the client sends and the server accepts
    pub token: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            header: DEFAULT_TOKEN_HEADER.to_string(),
            token: DEFAULT_TOKEN.to_string(),
        }
    }
}

impl AuthConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.header.is_empty()
            || !self
                .header
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b"-_.".contains(&b))
        {
            errors.push(format!(
                "Invalid token header '{}' (allowed: lowercase letters, digits, '-', '_', '.')",
                self.header
            ));
        }

        if self.token.is_empty() {
            errors.push("Token cannot be empty".to_string());
        } else if !self.token.bytes().all(|b| b == b' ' || b.is_ascii_graphic()) {
            errors.push("Token must be printable ASCII".to_string());
        }

        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Application name attached to startup logs
    pub app_name: String,

    /// Log level used when `RUST_LOG` is unset
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,

    /// Include the event target (module path)
    pub with_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("secure-rpc"),
            log_level: Level::INFO,
            json_format: false,
            with_target: true,
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

        errors
    }
}

/// Helper module for Duration serialization/deserialization
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

mod option_duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_u64(d.as_millis() as u64),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
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
