//! Handle to a running host server.

use crate::server::events::HostEvent;
use crate::session::registry::SessionRegistry;

use std::net::SocketAddr;

use log::info;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Returned by [`start_host_server`](crate::server::start_host_server).
///
/// Dropping the handle does not stop the server; call [`HostServerHandle::shutdown`].
pub struct HostServerHandle {
    local_addr: SocketAddr,
    registry: SessionRegistry,
    events: Option<mpsc::UnboundedReceiver<HostEvent>>,
    accept_task: JoinHandle<()>,
}

impl HostServerHandle {
    pub(crate) fn new(
        local_addr: SocketAddr,
        registry: SessionRegistry,
        events: mpsc::UnboundedReceiver<HostEvent>,
        accept_task: JoinHandle<()>,
    ) -> Self {
        Self {
            local_addr,
            registry,
            events: Some(events),
            accept_task,
        }
    }

    /// The bound address. Useful when the configured port was `0`.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// The lifecycle event stream. Yields `Some` once.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<HostEvent>> {
        self.events.take()
    }

    /// Stop accepting, dispose every management channel and terminate every runtime.
    pub async fn shutdown(self) {
        self.accept_task.abort();
        self.registry.dispose_all().await;
        info!("Host server on {} stopped", self.local_addr);
    }
}
