//! Configuration management for the federation mesh.
//!
//! This module provides TOML-based configuration with support for multiple
//! configuration sources (default, file-based, environment variables) and
//! validation of configuration parameters.

use crate::utils::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Default configuration file name
pub const DEFAULT_CONFIG_FILE: &str = "meshd.toml";

/// Environment variable prefix for configuration
pub const ENV_PREFIX: &str = "MESH";

/// Complete configuration for a mesh node
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Server identity
    pub identity: IdentityConfig,
    /// Network configuration
    pub network: NetworkConfig,
    /// Heartbeat and liveness timers
    pub liveness: LivenessConfig,
    /// Inbound gate limits
    pub limits: LimitsConfig,
    /// Security toggles
    pub security: SecurityConfig,
    /// Storage configuration
    pub storage: StorageConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Server identity; anything left empty is loaded from or generated into `storage.keys_dir`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Server identifier (UUID v4)
    pub server_id: Option<Uuid>,
    /// base64url of the PKCS#8 PEM private key
    pub private_key_b64url: Option<String>,
    /// base64url of the SPKI PEM public key (derived from the private key when absent)
    pub public_key_b64url: Option<String>,
}

/// An introducer the node joins through on startup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntroducerConfig {
    /// WebSocket URL of the introducer
    pub url: String,
    /// Introducer's public key, used to verify its welcome
    #[serde(default)]
    pub pubkey_b64url: Option<String>,
}

/// Network and transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address the mesh listener binds to
    pub bind_host: String,
    /// Host advertised to peers in hello/announce frames
    pub advertised_host: String,
    /// Port for the mesh WebSocket listener
    pub listen_port: u16,
    /// Full URL advertised to peers, overriding `advertised_host:listen_port`
    pub public_url: Option<String>,
    /// Maximum frame size in bytes
    pub max_frame_bytes: usize,
    /// Connection timeout in seconds
    pub connect_timeout_secs: u64,
    /// Answer SERVER_HELLO_JOIN with a welcome listing known peers
    pub introducer_mode: bool,
    /// Introducers to join through on startup
    pub introducers: Vec<IntroducerConfig>,
}

/// Heartbeat and liveness configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessConfig {
    /// Heartbeat broadcast interval in milliseconds
    pub heartbeat_interval_ms: u64,
    /// Silence after which a peer link is evicted, in milliseconds
    pub peer_dead_ms: u64,
    /// How often the liveness sweep runs, in milliseconds
    pub sweep_interval_ms: u64,
}

/// Inbound gate limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Token bucket capacity per connection
    pub rate_capacity: f64,
    /// Token bucket refill rate per second
    pub rate_refill_per_sec: f64,
    /// Accepted distance between a frame's `ts` and the local clock
    pub clock_skew_ms: i64,
    /// Lifetime of replay/loop suppression fingerprints
    pub seen_ttl_ms: i64,
}

/// Security configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Accept the literal key `dummy` from peers (local testing only)
    pub dev_allow_dummy_keys: bool,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Base directory for node data
    pub data_dir: PathBuf,
    /// Directory holding the server identity
    pub keys_dir: PathBuf,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            advertised_host: "127.0.0.1".to_string(),
            listen_port: crate::defaults::DEFAULT_PORT,
            public_url: None,
            max_frame_bytes: crate::defaults::DEFAULT_MAX_FRAME_BYTES,
            connect_timeout_secs: 10,
            introducer_mode: true,
            introducers: Vec::new(),
        }
    }
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: crate::defaults::DEFAULT_HEARTBEAT_MS,
            peer_dead_ms: crate::defaults::DEFAULT_PEER_DEAD_MS,
            sweep_interval_ms: 2000,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            rate_capacity: 50.0,
            rate_refill_per_sec: 25.0,
            clock_skew_ms: 5 * 60 * 1000,
            seen_ttl_ms: crate::defaults::DEFAULT_SEEN_TTL_MS,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("mesh-federation");

        Self {
            keys_dir: data_dir.join("keys"),
            data_dir,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl NetworkConfig {
    /// URL this node advertises to its peers
    pub fn self_url(&self) -> String {
        match &self.public_url {
            Some(url) => url.clone(),
            None => format!("ws://{}:{}", self.advertised_host, self.listen_port),
        }
    }

    /// Socket address string the listener binds
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.bind_host, self.listen_port)
    }
}

impl MeshConfig {
    /// Load configuration from a TOML file
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be read or parsed
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
            path: path.display().to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(ConfigError::from)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with multiple sources (default, file, environment)
    pub fn load(config_file: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(path) = config_file {
            if path.exists() {
                config = Self::from_file(path)?;
            } else {
                return Err(ConfigError::FileNotFound {
                    path: path.display().to_string(),
                }
                .into());
            }
        } else {
            let default_locations = [
                PathBuf::from(DEFAULT_CONFIG_FILE),
                dirs::config_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("mesh-federation")
                    .join(DEFAULT_CONFIG_FILE),
            ];

            for location in &default_locations {
                if location.exists() {
                    config = Self::from_file(location)?;
                    break;
                }
            }
        }

        config = config.merge_from_env()?;
        config.validate()?;

        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path, self.to_toml_string()?)?;
        Ok(())
    }

    /// Merge configuration from environment variables
    fn merge_from_env(self) -> Result<Self> {
        self.merge_from(|name| std::env::var(format!("{ENV_PREFIX}_{name}")).ok())
    }

    /// Apply overrides from a variable lookup (names without the prefix)
    fn merge_from<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(id) = lookup("SERVER_ID") {
            self.identity.server_id =
                Some(Uuid::parse_str(&id).map_err(|_| ConfigError::InvalidValue {
                    field: "MESH_SERVER_ID".to_string(),
                    value: id.clone(),
                })?);
        }

        if let Some(key) = lookup("SERVER_PRIVATE_KEY_B64URL") {
            self.identity.private_key_b64url = Some(key);
        }

        if let Some(key) = lookup("SERVER_PUBLIC_KEY_B64URL") {
            self.identity.public_key_b64url = Some(key);
        }

        if let Some(port) = lookup("NETWORK_LISTEN_PORT") {
            self.network.listen_port = port.parse().map_err(|_| ConfigError::InvalidValue {
                field: "MESH_NETWORK_LISTEN_PORT".to_string(),
                value: port,
            })?;
        }

        if let Some(host) = lookup("NETWORK_ADVERTISED_HOST") {
            self.network.advertised_host = host;
        }

        if let Some(raw) = lookup("INTRODUCERS_JSON") {
            self.network.introducers =
                serde_json::from_str(&raw).map_err(|e| ConfigError::InvalidValue {
                    field: "MESH_INTRODUCERS_JSON".to_string(),
                    value: e.to_string(),
                })?;
        }

        if let Some(flag) = lookup("DEV_ALLOW_DUMMY_KEYS") {
            self.security.dev_allow_dummy_keys = match flag.trim().to_lowercase().as_str() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" => false,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        field: "MESH_DEV_ALLOW_DUMMY_KEYS".to_string(),
                        value: flag,
                    }
                    .into())
                }
            };
        }

        if let Some(level) = lookup("LOGGING_LEVEL") {
            self.logging.level = level;
        }

        Ok(self)
    }

    /// Validate the configuration for consistency and correctness
    pub fn validate(&self) -> Result<()> {
        let invalid = |field: &str, value: String| -> Result<()> {
            Err(ConfigError::InvalidValue {
                field: field.to_string(),
                value,
            }
            .into())
        };

        if let Some(id) = self.identity.server_id {
            if id.get_version_num() != 4 {
                return invalid("identity.server_id", id.to_string());
            }
        }

        if self.network.listen_port == 0 {
            return invalid("network.listen_port", "0".to_string());
        }

        if self.network.max_frame_bytes < 1024 {
            return invalid(
                "network.max_frame_bytes",
                self.network.max_frame_bytes.to_string(),
            );
        }

        for introducer in &self.network.introducers {
            if !introducer.url.starts_with("ws://") && !introducer.url.starts_with("wss://") {
                return invalid("network.introducers.url", introducer.url.clone());
            }
        }

        if self.liveness.heartbeat_interval_ms < 1000 {
            return invalid(
                "liveness.heartbeat_interval_ms",
                self.liveness.heartbeat_interval_ms.to_string(),
            );
        }

        if self.liveness.peer_dead_ms < 3000
            || self.liveness.peer_dead_ms <= self.liveness.heartbeat_interval_ms
        {
            return invalid(
                "liveness.peer_dead_ms",
                self.liveness.peer_dead_ms.to_string(),
            );
        }

        if self.liveness.sweep_interval_ms == 0 {
            return invalid("liveness.sweep_interval_ms", "0".to_string());
        }

        if self.limits.rate_capacity < 1.0 || self.limits.rate_refill_per_sec <= 0.0 {
            return invalid(
                "limits.rate_capacity",
                format!(
                    "{} @ {}/s",
                    self.limits.rate_capacity, self.limits.rate_refill_per_sec
                ),
            );
        }

        if self.limits.clock_skew_ms <= 0 {
            return invalid("limits.clock_skew_ms", self.limits.clock_skew_ms.to_string());
        }

        if self.limits.seen_ttl_ms <= 0 {
            return invalid("limits.seen_ttl_ms", self.limits.seen_ttl_ms.to_string());
        }

        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            _ => return invalid("logging.level", self.logging.level.clone()),
        }

        Ok(())
    }

    /// Ensure all required directories exist
    pub fn ensure_directories(&self) -> Result<()> {
        for dir in [&self.storage.data_dir, &self.storage.keys_dir] {
            if !dir.exists() {
                std::fs::create_dir_all(dir).map_err(|_| ConfigError::DirectoryCreation {
                    path: dir.display().to_string(),
                })?;
            }
        }

        Ok(())
    }

    /// Get the configuration as a pretty-printed TOML string
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| {
            ConfigError::ParseError {
                reason: e.to_string(),
            }
            .into()
        })
    }
}
