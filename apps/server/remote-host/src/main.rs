use remote_host::error::RemoteHostError;
use remote_host::logger::{initialize as LoggerInitialize, level_from};
use remote_host::settings::{HostPaths, LOG_LEVEL_ENV, display_host, load_config, load_dotenv};

use host_core::{HostEvent, start_host_server};

use common::ErrorLocation;

use std::env;
use std::panic::Location;
use std::process::ExitCode;

use log::{debug, error, info, warn};
use tokio::signal::ctrl_c;
use tokio::sync::mpsc::UnboundedReceiver;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), RemoteHostError> {
    let dotenv = load_dotenv();

    let paths = HostPaths::resolve()?;
    paths.ensure()?;

    // Initialize logger FIRST
    let level = level_from(env::var(LOG_LEVEL_ENV).ok().as_deref());
    LoggerInitialize(&paths.log_dir, level)?;

    info!("Remote host starting");
    if let Some(dotenv) = dotenv {
        info!("Loaded environment from {}", dotenv.display());
    }
    info!("Config directory: {}", paths.config_dir.display());
    info!("Log directory: {}", paths.log_dir.display());

    let config = load_config(&paths.config_dir)?;
    let host = config.server.host.clone();

    let mut handle = start_host_server(config)
        .await
        .map_err(|e| RemoteHostError::Host {
            message: format!("Failed to start host server: {e}"),
            location: ErrorLocation::from(Location::caller()),
        })?;

    let port = handle.local_addr().port();
    info!("Server available at http://{}:{port}", display_host(&host));

    let Some(events) = handle.take_events() else {
        return Err(RemoteHostError::Host {
            message: "Host event stream already taken".to_string(),
            location: ErrorLocation::from(Location::caller()),
        });
    };
    let event_log = tokio::spawn(log_events(events));

    if let Err(e) = ctrl_c().await {
        warn!("Failed to listen for ctrl-c, shutting down: {e}");
    }
    info!("Shutting down");
    handle.shutdown().await;
    event_log.abort();
    Ok(())
}

async fn log_events(mut events: UnboundedReceiver<HostEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            HostEvent::ManagementConnected(connection) => {
                info!("[{}] Management channel established", connection.token);
                // No RPC layer is attached here; keep the channel open until
                // the client leaves.
                tokio::spawn(drain_management(connection));
            }
            HostEvent::ManagementDisconnected { token, reason } => {
                info!("[{token}] Management channel closed ({reason:?})");
            }
            HostEvent::ExtensionRuntimeStarted { token, pid } => {
                info!("[{token}] Extension runtime started (PID: {pid})");
            }
            HostEvent::ExtensionRuntimeExited { token, pid, exit } => {
                if exit.normal {
                    info!("[{token}] Extension runtime {pid} exited");
                } else {
                    warn!("[{token}] Extension runtime {pid} exited abnormally: {exit:?}");
                }
            }
        }
    }
}

async fn drain_management(mut connection: host_core::session::ManagementConnection) {
    while let Some(message) = connection.messages.recv().await {
        debug!(
            "[{}] {} byte management message without a consumer",
            connection.token,
            message.len()
        );
    }
}
