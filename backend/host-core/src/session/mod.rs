//! Per-client session state: tokens, the registry, grace timers and the
//! management channel supervisor.

pub mod grace;
pub mod management;
pub mod registry;
pub mod token;

pub use grace::{GraceStatus, GraceTimer};
pub use management::{DisposeReason, ManagementConnection, ManagementHandle, ManagementSender};
pub use registry::{ClientSnapshot, ReduceGraceReport, SessionRegistry};
pub use token::ClientToken;

use crate::channel::persistent::PersistentChannel;
use crate::error::session::SessionError;
use crate::handshake::messages::ControlMessage;

use log::{debug, warn};

/// Answer a dispatch with an `error` control message and close the transport.
pub(crate) async fn refuse(mut channel: PersistentChannel, token: &ClientToken, error: SessionError) {
    warn!("[{token}] {error}");
    let reply = ControlMessage::error(error.reason()).encode();
    if let Err(error) = channel.send_control(reply).await {
        debug!("[{token}] Error reply not delivered: {error}");
    }
    channel.close().await;
}
