//! Where the executable keeps its files, and environment overrides.
//!
//! Every `REMOTE_HOST_*` variable may also come from a `.env` file in the
//! working directory; [`load_dotenv`] must run before anything here reads
//! the environment.

use crate::error::RemoteHostError;

use host_core::HostConfig;

use common::ErrorLocation;

use std::env;
use std::fs::create_dir_all;
use std::net::IpAddr;
use std::panic::Location;
use std::path::{Path, PathBuf};

use log::{debug, error, info};

pub const CONFIG_DIR_ENV: &str = "REMOTE_HOST_CONFIG_DIR";
pub const LOG_DIR_ENV: &str = "REMOTE_HOST_LOG_DIR";
pub const HOST_ENV: &str = "REMOTE_HOST_HOST";
pub const PORT_ENV: &str = "REMOTE_HOST_PORT";
pub const LOG_LEVEL_ENV: &str = "REMOTE_HOST_LOG_LEVEL";
pub const RUNTIME_PROGRAM_ENV: &str = "REMOTE_HOST_RUNTIME_PROGRAM";

const APP_DIR_NAME: &str = "remote-host";
const LOG_DIR_NAME: &str = "logs";

/// Load `.env` if present. A missing file is not an error.
pub fn load_dotenv() -> Option<PathBuf> {
    dotenvy::dotenv().ok()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPaths {
    pub config_dir: PathBuf,
    pub log_dir: PathBuf,
}

impl HostPaths {
    /// Resolve from the process environment, falling back to platform directories.
    pub fn resolve() -> Result<Self, RemoteHostError> {
        Self::resolve_with(|key| env::var(key).ok())
    }

    pub fn resolve_with(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, RemoteHostError> {
        let config_dir = match non_empty(lookup(CONFIG_DIR_ENV)) {
            Some(dir) => PathBuf::from(dir),
            None => dirs::config_dir()
                .map(|dir| dir.join(APP_DIR_NAME))
                .ok_or_else(|| paths_error("Failed to determine the config directory"))?,
        };
        let log_dir = match non_empty(lookup(LOG_DIR_ENV)) {
            Some(dir) => PathBuf::from(dir),
            None => dirs::data_local_dir()
                .map(|dir| dir.join(APP_DIR_NAME).join(LOG_DIR_NAME))
                .ok_or_else(|| paths_error("Failed to determine the log directory"))?,
        };
        Ok(Self {
            config_dir,
            log_dir,
        })
    }

    /// Create both directories if they are missing.
    pub fn ensure(&self) -> Result<(), RemoteHostError> {
        for dir in [&self.config_dir, &self.log_dir] {
            ensure_dir(dir)?;
        }
        Ok(())
    }
}

fn ensure_dir(dir: &Path) -> Result<(), RemoteHostError> {
    create_dir_all(dir).map_err(|e| RemoteHostError::Paths {
        message: format!("Failed to create {}: {e}", dir.display()),
        location: ErrorLocation::from(Location::caller()),
    })
}

/// Apply `REMOTE_HOST_*` overrides from the process environment.
pub fn apply_env_overrides(config: &mut HostConfig) -> Result<(), RemoteHostError> {
    apply_overrides(config, |key| env::var(key).ok())
}

/// Apply overrides from `lookup`. Unset and empty variables are ignored.
///
/// # Errors
///
/// Returns [`RemoteHostError::Environment`] when a host is not an IP address or
/// a port is not a number.
pub fn apply_overrides(
    config: &mut HostConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<(), RemoteHostError> {
    if let Some(host) = non_empty(lookup(HOST_ENV)) {
        host.parse::<IpAddr>()
            .map_err(|e| env_error(HOST_ENV, &host, &e.to_string()))?;
        debug!("{HOST_ENV} overrides server.host with {host}");
        config.server.host = host;
    }

    if let Some(port) = non_empty(lookup(PORT_ENV)) {
        config.server.port = port
            .parse::<u16>()
            .map_err(|e| env_error(PORT_ENV, &port, &e.to_string()))?;
        debug!("{PORT_ENV} overrides server.port with {port}");
    }

    if let Some(program) = non_empty(lookup(RUNTIME_PROGRAM_ENV)) {
        debug!("{RUNTIME_PROGRAM_ENV} overrides extensionRuntime.program with {program}");
        config.extension_runtime.program = program;
    }

    Ok(())
}

/// Load `config.json`, apply overrides and validate. A broken file is logged
/// and replaced by defaults.
pub fn load_config(config_dir: &Path) -> Result<HostConfig, RemoteHostError> {
    let mut config = match HostConfig::load(config_dir) {
        Ok(config) => config,
        Err(e) => {
            error!("Ignoring unusable config file, using defaults: {e}");
            HostConfig::default()
        }
    };
    apply_env_overrides(&mut config)?;
    config.validate().map_err(|e| RemoteHostError::Host {
        message: e.to_string(),
        location: ErrorLocation::from(Location::caller()),
    })?;
    info!(
        "Reconnection grace time {}ms, short grace time {}ms",
        config.reconnection.grace_time_ms, config.reconnection.short_grace_time_ms
    );
    Ok(config)
}

/// The host shown in the listening banner.
pub fn display_host(host: &str) -> &str {
    match host {
        "0.0.0.0" | "127.0.0.1" | "::" | "::1" => "localhost",
        other => other,
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}

#[track_caller]
fn paths_error(message: &str) -> RemoteHostError {
    RemoteHostError::Paths {
        message: message.to_string(),
        location: ErrorLocation::from(Location::caller()),
    }
}

#[track_caller]
fn env_error(key: &str, value: &str, reason: &str) -> RemoteHostError {
    RemoteHostError::Environment {
        message: format!("{key}={value} is invalid: {reason}"),
        location: ErrorLocation::from(Location::caller()),
    }
}
