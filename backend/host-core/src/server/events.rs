//! Lifecycle notifications for the embedding application.

use crate::runtime::supervisor::RuntimeExit;
use crate::session::management::{DisposeReason, ManagementConnection};
use crate::session::token::ClientToken;

pub enum HostEvent {
    /// A management channel is established. The RPC layer attaches here.
    ManagementConnected(ManagementConnection),
    ManagementDisconnected {
        token: ClientToken,
        reason: DisposeReason,
    },
    ExtensionRuntimeStarted {
        token: ClientToken,
        pid: u32,
    },
    ExtensionRuntimeExited {
        token: ClientToken,
        pid: u32,
        exit: RuntimeExit,
    },
}

impl HostEvent {
    pub fn token(&self) -> &ClientToken {
        match self {
            HostEvent::ManagementConnected(connection) => &connection.token,
            HostEvent::ManagementDisconnected { token, .. }
            | HostEvent::ExtensionRuntimeStarted { token, .. }
            | HostEvent::ExtensionRuntimeExited { token, .. } => token,
        }
    }
}
