//! The TCP accept loop that ties upgrade, handshake and supervision together.

pub mod context;
pub mod events;
pub mod handle;

pub use context::HostContext;
pub use events::HostEvent;
pub use handle::HostServerHandle;

use crate::config::HostConfig;
use crate::error::HostError;
use crate::handshake::driver::run_connection;
use crate::handshake::verifier::{HandshakeVerifier, TokenPossession};
use crate::session::registry::SessionRegistry;
use crate::transport::upgrade::accept_upgrade;

use common::ErrorLocation;

use std::panic::Location;
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::net::TcpListener;
use tokio::spawn as TokioSpawn;
use tokio::sync::mpsc;

/// Start the host server with the default verifier.
///
/// Binds `server.host:server.port` and spawns the accept loop. Each accepted
/// stream gets its own task that performs the upgrade and the handshake, and
/// then hands the connection to the management or runtime supervisor.
///
/// # Errors
///
/// - [`HostError::Config`] if `config` does not validate
/// - [`HostError::Listener`] if the address cannot be bound
pub async fn start_host_server(config: HostConfig) -> Result<HostServerHandle, HostError> {
    start_host_server_with_verifier(config, Arc::new(TokenPossession)).await
}

/// Start the host server with a custom [`HandshakeVerifier`].
pub async fn start_host_server_with_verifier(
    config: HostConfig,
    verifier: Arc<dyn HandshakeVerifier>,
) -> Result<HostServerHandle, HostError> {
    config.validate()?;

    let address = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&address)
        .await
        .map_err(|e| HostError::Listener {
            message: format!("Failed to bind {address}: {e}"),
            location: ErrorLocation::from(Location::caller()),
        })?;
    let local_addr = listener.local_addr()?;
    info!("Host server listening on {local_addr}");

    let registry = SessionRegistry::new();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let context = HostContext::new(Arc::new(config), registry.clone(), verifier, events_tx);

    let accept_task = TokioSpawn(async move {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(error) => {
                    warn!("Accept failed: {error}");
                    continue;
                }
            };
            debug!("Connection from {peer}");
            let context = context.clone();
            TokioSpawn(async move {
                if let Ok(connection) = accept_upgrade(stream, peer, &context.config).await {
                    run_connection(connection, context).await;
                }
            });
        }
    });

    Ok(HostServerHandle::new(
        local_addr,
        registry,
        events_rx,
        accept_task,
    ))
}
