use crate::config::HostConfig;
use crate::handshake::verifier::HandshakeVerifier;
use crate::server::events::HostEvent;
use crate::session::registry::SessionRegistry;

use std::sync::Arc;

use log::trace;
use tokio::sync::mpsc;

/// Everything a connection task needs, cloned into each one.
#[derive(Clone)]
pub struct HostContext {
    pub config: Arc<HostConfig>,
    pub registry: SessionRegistry,
    pub verifier: Arc<dyn HandshakeVerifier>,
    events: mpsc::UnboundedSender<HostEvent>,
}

impl HostContext {
    pub fn new(
        config: Arc<HostConfig>,
        registry: SessionRegistry,
        verifier: Arc<dyn HandshakeVerifier>,
        events: mpsc::UnboundedSender<HostEvent>,
    ) -> Self {
        Self {
            config,
            registry,
            verifier,
            events,
        }
    }

    pub fn emit(&self, event: HostEvent) {
        if let Err(unsent) = self.events.send(event) {
            trace!("[{}] No listener for host events", unsent.0.token());
        }
    }
}
