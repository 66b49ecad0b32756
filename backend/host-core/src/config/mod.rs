//! Host configuration, persisted as `{config_dir}/config.json`.
//!
//! Every section falls back to its defaults when absent, so an empty JSON
//! object is a valid configuration.

use crate::channel::protocol::HEADER_LENGTH;
use crate::error::config::ConfigError;

use common::ErrorLocation;

use std::collections::BTreeMap;
use std::panic::Location;
use std::path::Path;
use std::time::Duration;

use log::{info, warn};
use serde::{Deserialize, Serialize};

const CONFIG_FILE_NAME: &str = "config.json";
const CONFIG_VERSION: u32 = 1;
const LOG_LEVELS: [&str; 6] = ["trace", "debug", "info", "warn", "error", "off"];

// ============================================
// CONFIG STRUCTS
// ============================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// The two reconnection windows of a management channel.
///
/// `grace_time_ms` starts when the transport drops. `short_grace_time_ms`
/// replaces it once another client shows up.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectionConfig {
    #[serde(default = "default_grace_time_ms")]
    pub grace_time_ms: u64,
    #[serde(default = "default_short_grace_time_ms")]
    pub short_grace_time_ms: u64,
}

impl Default for ReconnectionConfig {
    fn default() -> Self {
        Self {
            grace_time_ms: default_grace_time_ms(),
            short_grace_time_ms: default_short_grace_time_ms(),
        }
    }
}

impl ReconnectionConfig {
    pub fn grace_time(&self) -> Duration {
        Duration::from_millis(self.grace_time_ms)
    }

    pub fn short_grace_time(&self) -> Duration {
        Duration::from_millis(self.short_grace_time_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChannelConfig {
    #[serde(default = "default_acknowledge_time_ms")]
    pub acknowledge_time_ms: u64,
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: u32,
    /// How long a write may make no progress before the carrier is dropped.
    #[serde(default = "default_write_stall_timeout_ms")]
    pub write_stall_timeout_ms: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            acknowledge_time_ms: default_acknowledge_time_ms(),
            max_message_bytes: default_max_message_bytes(),
            write_stall_timeout_ms: default_write_stall_timeout_ms(),
        }
    }
}

impl ChannelConfig {
    pub fn acknowledge_time(&self) -> Duration {
        Duration::from_millis(self.acknowledge_time_ms)
    }

    pub fn write_stall_timeout(&self) -> Duration {
        Duration::from_millis(self.write_stall_timeout_ms)
    }

    /// Largest WebSocket frame payload a client may announce: one full
    /// protocol message.
    pub fn max_frame_bytes(&self) -> u64 {
        u64::from(self.max_message_bytes) + HEADER_LENGTH as u64
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeConfig {
    /// Server identity sent in the `sign` reply.
    #[serde(default = "default_sign_data")]
    pub sign_data: String,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            sign_data: default_sign_data(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CompressionConfig {
    #[serde(default = "default_permessage_deflate")]
    pub permessage_deflate: bool,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            permessage_deflate: default_permessage_deflate(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionRuntimeConfig {
    #[serde(default = "default_runtime_program")]
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_runtime_log_level")]
    pub log_level: String,
    /// Forces `trace` logging inside the runtime.
    #[serde(default)]
    pub verbose: bool,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl Default for ExtensionRuntimeConfig {
    fn default() -> Self {
        Self {
            program: default_runtime_program(),
            args: Vec::new(),
            log_level: default_runtime_log_level(),
            verbose: false,
            env: BTreeMap::new(),
        }
    }
}

impl ExtensionRuntimeConfig {
    pub fn effective_log_level(&self) -> &str {
        if self.verbose { "trace" } else { &self.log_level }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HostConfig {
    #[serde(default = "default_version")]
    pub version: u32,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub reconnection: ReconnectionConfig,

    #[serde(default)]
    pub channel: ChannelConfig,

    #[serde(default)]
    pub handshake: HandshakeConfig,

    #[serde(default)]
    pub compression: CompressionConfig,

    #[serde(default)]
    pub extension_runtime: ExtensionRuntimeConfig,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            server: ServerConfig::default(),
            reconnection: ReconnectionConfig::default(),
            channel: ChannelConfig::default(),
            handshake: HandshakeConfig::default(),
            compression: CompressionConfig::default(),
            extension_runtime: ExtensionRuntimeConfig::default(),
        }
    }
}

// ============================================
// DEFAULT FUNCTIONS
// ============================================

fn default_version() -> u32 {
    CONFIG_VERSION
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    3000
}
fn default_grace_time_ms() -> u64 {
    3 * 60 * 60 * 1000
}
fn default_short_grace_time_ms() -> u64 {
    5 * 60 * 1000
}
fn default_acknowledge_time_ms() -> u64 {
    2000
}
fn default_max_message_bytes() -> u32 {
    256 * 1024 * 1024
}
fn default_write_stall_timeout_ms() -> u64 {
    10_000
}
fn default_sign_data() -> String {
    "Remote Host Server".to_string()
}
fn default_permessage_deflate() -> bool {
    true
}
fn default_runtime_program() -> String {
    "extension-runtime".to_string()
}
fn default_runtime_log_level() -> String {
    "info".to_string()
}

// ============================================
// IMPLEMENTATION
// ============================================

impl HostConfig {
    /// Load config from {config_dir}/config.json.
    ///
    /// # Returns
    ///
    /// Returns defaults if the file is missing.
    /// Returns `Err(ConfigError)` if the file exists but is corrupted or invalid.
    pub fn load(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE_NAME);

        if !config_path.exists() {
            info!(
                "Config file not found at {}, using defaults",
                config_path.display()
            );
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(&config_path).map_err(|e| {
            warn!("Failed to read config file: {}", e);
            ConfigError::Read {
                location: ErrorLocation::from(Location::caller()),
                path: config_path.clone(),
                source: e,
            }
        })?;

        let config: HostConfig = serde_json::from_str(&contents).map_err(|e| {
            warn!("Failed to parse config JSON: {}", e);
            ConfigError::Parse {
                location: ErrorLocation::from(Location::caller()),
                path: config_path.clone(),
                reason: e.to_string(),
            }
        })?;

        config.validate()?;

        info!("Config loaded from {}", config_path.display());
        Ok(config)
    }

    /// Save config to {config_dir}/config.json through a temp file and a rename.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        self.validate()?;

        std::fs::create_dir_all(config_dir).map_err(|e| ConfigError::Write {
            location: ErrorLocation::from(Location::caller()),
            path: config_dir.to_path_buf(),
            source: e,
        })?;

        let config_path = config_dir.join(CONFIG_FILE_NAME);
        let temp_path = config_dir.join(format!("{}.tmp", CONFIG_FILE_NAME));

        let json = serde_json::to_string_pretty(self).map_err(|e| ConfigError::Serialize {
            location: ErrorLocation::from(Location::caller()),
            reason: e.to_string(),
        })?;

        std::fs::write(&temp_path, json).map_err(|e| ConfigError::Write {
            location: ErrorLocation::from(Location::caller()),
            path: temp_path.clone(),
            source: e,
        })?;

        std::fs::rename(&temp_path, &config_path).map_err(|e| ConfigError::Write {
            location: ErrorLocation::from(Location::caller()),
            path: config_path.clone(),
            source: e,
        })?;

        info!("Config saved to {}", config_path.display());
        Ok(())
    }

    /// Validate config values.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.version == 0 || self.version > CONFIG_VERSION {
            return Err(invalid(
                "version",
                format!("{} (expected 1-{})", self.version, CONFIG_VERSION),
            ));
        }

        if self.server.host.trim().is_empty() {
            return Err(invalid("server.host", "cannot be empty".to_string()));
        }

        let reconnection = &self.reconnection;
        if reconnection.short_grace_time_ms == 0 {
            return Err(invalid(
                "reconnection.shortGraceTimeMs",
                "must be greater than zero".to_string(),
            ));
        }
        if reconnection.short_grace_time_ms >= reconnection.grace_time_ms {
            return Err(invalid(
                "reconnection.shortGraceTimeMs",
                format!(
                    "{} must be strictly smaller than graceTimeMs ({})",
                    reconnection.short_grace_time_ms, reconnection.grace_time_ms
                ),
            ));
        }

        if self.channel.acknowledge_time_ms == 0 {
            return Err(invalid(
                "channel.acknowledgeTimeMs",
                "must be greater than zero".to_string(),
            ));
        }
        if self.channel.max_message_bytes == 0 {
            return Err(invalid(
                "channel.maxMessageBytes",
                "must be greater than zero".to_string(),
            ));
        }
        if self.channel.write_stall_timeout_ms == 0 {
            return Err(invalid(
                "channel.writeStallTimeoutMs",
                "must be greater than zero".to_string(),
            ));
        }

        if self.handshake.sign_data.is_empty() {
            return Err(invalid("handshake.signData", "cannot be empty".to_string()));
        }

        let runtime = &self.extension_runtime;
        if runtime.program.trim().is_empty() {
            return Err(invalid(
                "extensionRuntime.program",
                "cannot be empty".to_string(),
            ));
        }
        if !LOG_LEVELS.contains(&runtime.log_level.as_str()) {
            return Err(invalid(
                "extensionRuntime.logLevel",
                format!("{} (expected one of {:?})", runtime.log_level, LOG_LEVELS),
            ));
        }

        Ok(())
    }
}

#[track_caller]
fn invalid(field: &'static str, reason: String) -> ConfigError {
    ConfigError::Validation {
        location: ErrorLocation::from(Location::caller()),
        field,
        reason,
    }
}
