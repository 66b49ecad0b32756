//! Runs the handshake for one upgraded connection and routes the result.

use crate::channel::persistent::PersistentChannel;
use crate::error::handshake::HandshakeError;
use crate::handshake::machine::{ConnectionRequest, HandshakeMachine, HandshakeStep};
use crate::handshake::messages::{ConnectionKind, ControlMessage, ExtensionRuntimeParams};
use crate::runtime::supervisor;
use crate::server::context::HostContext;
use crate::session::management;
use crate::session::token::ClientToken;
use crate::transport::upgrade::UpgradedConnection;

use log::{debug, error, info, warn};

/// Drive `connection` through the control handshake to its supervisor.
///
/// Every way the handshake can end without a dispatch closes the transport here.
pub async fn run_connection(connection: UpgradedConnection, context: HostContext) {
    let UpgradedConnection {
        peer,
        request,
        transport,
    } = connection;
    let token = request.token.clone();

    let mut channel = PersistentChannel::new(transport, &context.config.channel);
    let mut machine = HandshakeMachine::new(
        token.clone(),
        request.reconnection,
        context.config.handshake.sign_data.clone(),
        context.verifier.clone(),
    );

    loop {
        let payload = match channel.recv_control().await {
            Ok(Some(payload)) => payload,
            Ok(None) => {
                debug!("[{token}] Connection from {peer} ended during the handshake");
                channel.close().await;
                return;
            }
            Err(error) => {
                warn!("[{token}] Handshake read failed: {error}");
                channel.close().await;
                return;
            }
        };

        match machine.on_message(&payload) {
            HandshakeStep::Reply(reply) => {
                if let Err(error) = channel.send_control(reply.encode()).await {
                    warn!("[{token}] Could not send `{}`: {error}", reply.type_name());
                    channel.close().await;
                    return;
                }
            }
            HandshakeStep::Dispatch(request) => {
                dispatch(&context, token, channel, request).await;
                return;
            }
            HandshakeStep::Fail(error) => {
                fail(channel, &token, error).await;
                return;
            }
        }
    }
}

async fn fail(mut channel: PersistentChannel, token: &ClientToken, error: HandshakeError) {
    match &error {
        HandshakeError::Peer { message, .. } => {
            error!("[{token}] error control message: {message}");
        }
        other => {
            warn!("[{token}] Handshake failed: {other}");
            let reply = ControlMessage::error(other.reason()).encode();
            if let Err(send_error) = channel.send_control(reply).await {
                debug!("[{token}] Error reply not delivered: {send_error}");
            }
        }
    }
    channel.close().await;
}

async fn dispatch(
    context: &HostContext,
    token: ClientToken,
    channel: PersistentChannel,
    request: ConnectionRequest,
) {
    let dispatch = context.registry.lock_dispatch().await;

    let report = context.registry.publish_reduce_grace_time(&token).await;
    if report.management_shortened > 0 || report.runtimes_notified > 0 {
        debug!(
            "[{token}] Reduced grace time for {} management connections, notified {} extension runtimes",
            report.management_shortened, report.runtimes_notified
        );
    }

    match (request.kind, request.reconnection) {
        (ConnectionKind::Management, false) => {
            management::establish(context, token, channel).await;
        }
        (ConnectionKind::Management, true) => {
            management::reconnect(context, token, channel, dispatch).await;
        }
        (ConnectionKind::ExtensionRuntime, reconnection) => {
            let params = match ExtensionRuntimeParams::from_args(request.args.as_ref()) {
                Ok(params) => params,
                Err(error) => {
                    warn!("[{token}] Ignoring malformed extension runtime args: {error}");
                    ExtensionRuntimeParams::default()
                }
            };
            if reconnection {
                info!("[{token}] Reconnecting to the extension runtime");
                supervisor::reconnect(context, token, channel, params).await;
            } else {
                supervisor::establish(context, token, channel, params).await;
            }
        }
    }
}
