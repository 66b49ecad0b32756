//! Building the extension runtime command line and environment.

use crate::config::ExtensionRuntimeConfig;
use crate::error::runtime::RuntimeError;
use crate::handshake::messages::ExtensionRuntimeParams;
use crate::session::token::ClientToken;

use common::ErrorLocation;

use std::env::temp_dir;
use std::net::{Ipv4Addr, SocketAddr};
use std::panic::Location;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use const_format::concatcp;
use log::{debug, info};
use tokio::net::TcpListener;
use tokio::process::Child as TokioChild;
use tokio::process::Command as TokioCommand;
use uuid::Uuid;

const ENV_PREFIX: &str = "REMOTE_HOST_";
pub const IPC_HOOK_ENV: &str = concatcp!(ENV_PREFIX, "IPC_HOOK");
pub const PIPE_LOGGING_ENV: &str = concatcp!(ENV_PREFIX, "PIPE_LOGGING");
pub const VERBOSE_LOGGING_ENV: &str = concatcp!(ENV_PREFIX, "VERBOSE_LOGGING");
pub const WILL_SEND_SOCKET_ENV: &str = concatcp!(ENV_PREFIX, "WILL_SEND_SOCKET");
pub const HANDLES_UNCAUGHT_ERRORS_ENV: &str = concatcp!(ENV_PREFIX, "HANDLES_UNCAUGHT_ERRORS");
pub const LOG_LEVEL_ENV: &str = concatcp!(ENV_PREFIX, "LOG_LEVEL");
pub const LANGUAGE_ENV: &str = concatcp!(ENV_PREFIX, "LANGUAGE");
pub const TOKEN_ENV: &str = concatcp!(ENV_PREFIX, "TOKEN");
pub const INSPECT_ENV: &str = concatcp!(ENV_PREFIX, "INSPECT");
pub const DEBUG_PORT_ENV: &str = concatcp!(ENV_PREFIX, "DEBUG_PORT");

const IPC_SOCKET_PREFIX: &str = "remote-host-ipc-";
const IPC_SOCKET_SUFFIX: &str = ".sock";
const DEBUG_PORT_SEARCH_SPAN: u16 = 10;
const ENABLED: &str = "true";

/// A fresh, unused IPC hook path in the temp directory.
pub fn ipc_socket_path() -> PathBuf {
    temp_dir().join(format!(
        "{IPC_SOCKET_PREFIX}{}{IPC_SOCKET_SUFFIX}",
        Uuid::new_v4().simple()
    ))
}

/// Pick the debug port to report back to the client.
///
/// `Some(p)` with `p > 0` tries `p` and the next few ports on loopback,
/// `Some(0)` asks the OS for one. Returns `Some(0)` when nothing was free.
pub async fn negotiate_debug_port(requested: Option<u16>) -> Option<u16> {
    let requested = requested?;
    let candidates: Vec<u16> = if requested == 0 {
        vec![0]
    } else {
        (requested..=requested.saturating_add(DEBUG_PORT_SEARCH_SPAN)).collect()
    };

    for candidate in candidates {
        let address = SocketAddr::from((Ipv4Addr::LOCALHOST, candidate));
        if let Ok(listener) = TcpListener::bind(address).await {
            if let Ok(bound) = listener.local_addr() {
                debug!("Debug port {} is free", bound.port());
                return Some(bound.port());
            }
        }
    }
    Some(0)
}

/// `--inspect` style flag for the runtime's debugger.
pub fn inspect_flag(params: &ExtensionRuntimeParams, debug_port: Option<u16>) -> Option<String> {
    match debug_port? {
        0 => Some("--inspect-port=0".to_string()),
        port if params.break_on_start => Some(format!("--inspect-brk={port}")),
        port => Some(format!("--inspect={port}")),
    }
}

pub struct RuntimeLaunch<'a> {
    pub token: &'a ClientToken,
    pub config: &'a ExtensionRuntimeConfig,
    pub params: &'a ExtensionRuntimeParams,
    pub ipc_path: &'a Path,
    pub debug_port: Option<u16>,
}

impl RuntimeLaunch<'_> {
    pub fn command(&self) -> TokioCommand {
        let mut cmd = TokioCommand::new(&self.config.program);
        cmd.args(&self.config.args)
            .envs(&self.config.env)
            .envs(&self.params.env)
            .env(IPC_HOOK_ENV, self.ipc_path)
            .env(PIPE_LOGGING_ENV, ENABLED)
            .env(VERBOSE_LOGGING_ENV, self.config.verbose.to_string())
            .env(WILL_SEND_SOCKET_ENV, ENABLED)
            .env(HANDLES_UNCAUGHT_ERRORS_ENV, ENABLED)
            .env(LOG_LEVEL_ENV, self.config.effective_log_level())
            .env(LANGUAGE_ENV, &self.params.language)
            .env(TOKEN_ENV, self.token.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(flag) = inspect_flag(self.params, self.debug_port) {
            cmd.env(INSPECT_ENV, flag);
        }
        if let Some(port) = self.debug_port {
            cmd.env(DEBUG_PORT_ENV, port.to_string());
        }
        cmd
    }

    pub fn spawn(&self) -> Result<TokioChild, RuntimeError> {
        let program = &self.config.program;
        let child = self.command().spawn().map_err(|e| RuntimeError::Spawn {
            message: format!("Failed to spawn {program}: {e}"),
            location: ErrorLocation::from(Location::caller()),
            source: e,
        })?;
        info!(
            "[{}] Spawned extension runtime {program} (PID: {:?})",
            self.token,
            child.id()
        );
        Ok(child)
    }
}
