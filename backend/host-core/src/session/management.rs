//! Management channel supervision.
//!
//! Each established management channel is owned by one [`ManagementSession`]
//! task. The task also owns both grace timers, and every exit from its loop
//! goes through a single dispose, so cleanup runs exactly once per session.
//!
//! | event                     | effect                                      |
//! |---------------------------|---------------------------------------------|
//! | transport closes          | arm the long timer, keep the logical channel |
//! | another client dispatches | arm the short timer if only the long one runs |
//! | reconnection accepted     | cancel both timers, adopt the new transport |
//! | either timer fires        | dispose                                     |

use crate::channel::persistent::{Delivery, PersistentChannel};
use crate::error::channel::ChannelError;
use crate::error::session::SessionError;
use crate::handshake::messages::ControlMessage;
use crate::server::context::HostContext;
use crate::server::events::HostEvent;
use crate::session::grace::{GraceStatus, GraceTimer};
use crate::session::refuse;
use crate::session::registry::DispatchGuard;
use crate::session::token::ClientToken;
use crate::transport::websocket::WebSocketTransport;

use common::ErrorLocation;

use std::panic::Location;

use log::{debug, error, info, trace, warn};
use tokio::spawn as TokioSpawn;
use tokio::sync::{mpsc, oneshot, watch};

pub(crate) enum ManagementCommand {
    Send(Vec<u8>),
    AcceptReconnection {
        carrier: WebSocketTransport,
        initial_data_chunk: Vec<u8>,
        reply: oneshot::Sender<Result<(), ChannelError>>,
    },
    ReduceGraceTime,
    Dispose,
}

/// Why a management session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisposeReason {
    GraceExpired,
    ShortGraceExpired,
    PeerDisconnected,
    Requested,
    HandlesDropped,
}

/// Registry-side handle to a running management session.
#[derive(Clone)]
pub struct ManagementHandle {
    generation: u64,
    commands: mpsc::UnboundedSender<ManagementCommand>,
    status: watch::Receiver<GraceStatus>,
}

impl ManagementHandle {
    pub(crate) fn new(
        generation: u64,
        commands: mpsc::UnboundedSender<ManagementCommand>,
        status: watch::Receiver<GraceStatus>,
    ) -> Self {
        Self {
            generation,
            commands,
            status,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn grace_status(&self) -> GraceStatus {
        *self.status.borrow()
    }

    pub fn is_alive(&self) -> bool {
        !self.commands.is_closed()
    }

    pub(crate) fn reduce_grace_time(&self) -> bool {
        self.commands.send(ManagementCommand::ReduceGraceTime).is_ok()
    }

    pub(crate) fn dispose(&self) -> bool {
        self.commands.send(ManagementCommand::Dispose).is_ok()
    }

    /// Queue a new carrier for the session. The session adopts it when it
    /// next handles a command.
    pub(crate) fn accept_reconnection(
        &self,
        carrier: WebSocketTransport,
        initial_data_chunk: Vec<u8>,
    ) -> Result<PendingReconnection, ChannelError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(ManagementCommand::AcceptReconnection {
                carrier,
                initial_data_chunk,
                reply,
            })
            .map_err(|_| session_gone())?;
        Ok(PendingReconnection { response })
    }
}

/// A queued reconnection, resolved once the session has adopted the carrier.
pub(crate) struct PendingReconnection {
    response: oneshot::Receiver<Result<(), ChannelError>>,
}

impl PendingReconnection {
    pub(crate) async fn outcome(self) -> Result<(), ChannelError> {
        self.response.await.map_err(|_| session_gone())?
    }
}

#[track_caller]
fn session_gone() -> ChannelError {
    ChannelError::Closed {
        message: "management session has been disposed".to_string(),
        location: ErrorLocation::from(Location::caller()),
    }
}

/// Outbound side of an established management channel, for the RPC layer.
#[derive(Clone)]
pub struct ManagementSender {
    token: ClientToken,
    commands: mpsc::UnboundedSender<ManagementCommand>,
}

impl ManagementSender {
    pub fn token(&self) -> &ClientToken {
        &self.token
    }

    /// Queue a regular message. It survives transport drops until acknowledged.
    pub fn send(&self, data: Vec<u8>) -> bool {
        self.commands.send(ManagementCommand::Send(data)).is_ok()
    }

    pub fn disconnect(&self) -> bool {
        self.commands.send(ManagementCommand::Dispose).is_ok()
    }

    pub fn is_connected(&self) -> bool {
        !self.commands.is_closed()
    }
}

/// Handed to the embedding application once a management channel is established.
pub struct ManagementConnection {
    pub token: ClientToken,
    pub sender: ManagementSender,
    /// Regular messages from the client, in order, each exactly once.
    pub messages: mpsc::UnboundedReceiver<Vec<u8>>,
}

/// Establish a new management channel for `token`.
pub(crate) async fn establish(context: &HostContext, token: ClientToken, mut channel: PersistentChannel) {
    if context.registry.has_management(&token).await {
        refuse(channel, &token, SessionError::management_already_running()).await;
        return;
    }

    if let Err(error) = channel.send_control(ControlMessage::ok(None).encode()).await {
        warn!("[{token}] Could not confirm the management connection: {error}");
        channel.close().await;
        return;
    }
    channel.stop_recording_inflate();
    channel.activate();

    let generation = context.registry.next_generation();
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (status_tx, status_rx) = watch::channel(GraceStatus {
        connected: true,
        ..GraceStatus::default()
    });
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

    let handle = ManagementHandle::new(generation, command_tx.clone(), status_rx);
    if let Err(error) = context.registry.insert_management(token.clone(), handle).await {
        error!("[{token}] Management entry appeared during dispatch: {error}");
        channel.close().await;
        return;
    }

    let reconnection = &context.config.reconnection;
    let session = ManagementSession {
        token: token.clone(),
        generation,
        channel,
        grace: GraceTimer::new(reconnection.grace_time()),
        short_grace: GraceTimer::new(reconnection.short_grace_time()),
        commands: command_rx,
        inbound: inbound_tx,
        status: status_tx,
        context: context.clone(),
    };
    TokioSpawn(session.run());

    info!("[{token}] Management connection is connected");
    context.emit(HostEvent::ManagementConnected(ManagementConnection {
        token: token.clone(),
        sender: ManagementSender {
            token,
            commands: command_tx,
        },
        messages: inbound_rx,
    }));
}

/// Resume an existing management channel on the transport of `channel`.
///
/// `dispatch` is released as soon as the carrier is queued. The session may
/// still be finishing a write on its old carrier, and that must not hold up
/// handshakes for other tokens.
pub(crate) async fn reconnect(
    context: &HostContext,
    token: ClientToken,
    mut channel: PersistentChannel,
    dispatch: DispatchGuard,
) {
    let Some(handle) = context.registry.management(&token).await else {
        refuse(channel, &token, SessionError::management_not_running()).await;
        return;
    };

    if let Err(error) = channel.send_control(ControlMessage::ok(None).encode()).await {
        warn!("[{token}] Could not confirm the management reconnection: {error}");
        channel.close().await;
        return;
    }

    let Some((carrier, replay)) = channel.take_for_reconnection() else {
        warn!("[{token}] Transport closed before the reconnection completed");
        return;
    };
    debug!(
        "[{token}] Handing {} replayed bytes to the existing management channel",
        replay.len()
    );

    let queued = handle.accept_reconnection(carrier, replay);
    drop(dispatch);

    let outcome = match queued {
        Ok(pending) => pending.outcome().await,
        Err(error) => Err(error),
    };
    match outcome {
        Ok(()) => info!("[{token}] Management connection is reconnected"),
        Err(error) => warn!("[{token}] Management reconnection failed: {error}"),
    }
}

pub(crate) struct ManagementSession {
    token: ClientToken,
    generation: u64,
    channel: PersistentChannel,
    grace: GraceTimer,
    short_grace: GraceTimer,
    commands: mpsc::UnboundedReceiver<ManagementCommand>,
    inbound: mpsc::UnboundedSender<Vec<u8>>,
    status: watch::Sender<GraceStatus>,
    context: HostContext,
}

impl ManagementSession {
    async fn run(mut self) {
        let reason = loop {
            let grace_deadline = self.grace.deadline();
            let short_grace_deadline = self.short_grace.deadline();
            let ack_deadline = self.channel.ack_deadline();

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => {
                        if let Some(reason) = self.handle_command(command).await {
                            break reason;
                        }
                    }
                    None => break DisposeReason::HandlesDropped,
                },
                chunk = self.channel.read_chunk() => {
                    let accepted = match chunk {
                        Ok(chunk) => self.channel.accept_chunk(chunk).await,
                        Err(error) => Err(error),
                    };
                    match accepted {
                        Ok(deliveries) => {
                            if let Some(reason) = self.deliver(deliveries) {
                                break reason;
                            }
                        }
                        Err(error) => {
                            warn!("[{}] Socket failed: {error}", self.token);
                            self.on_socket_closed();
                        }
                    }
                }
                _ = GraceTimer::expired(grace_deadline) => break DisposeReason::GraceExpired,
                _ = GraceTimer::expired(short_grace_deadline) => break DisposeReason::ShortGraceExpired,
                _ = GraceTimer::expired(ack_deadline) => {
                    if let Err(error) = self.channel.send_ack_if_needed().await {
                        debug!("[{}] Ack not delivered: {error}", self.token);
                        self.on_socket_closed();
                    }
                }
            }
        };

        self.dispose(reason).await;
    }

    async fn handle_command(&mut self, command: ManagementCommand) -> Option<DisposeReason> {
        match command {
            ManagementCommand::Send(data) => {
                if let Err(error) = self.channel.send(data).await {
                    debug!("[{}] Message queued, transport failed: {error}", self.token);
                    self.on_socket_closed();
                }
            }
            ManagementCommand::AcceptReconnection {
                carrier,
                initial_data_chunk,
                reply,
            } => {
                self.grace.cancel();
                self.short_grace.cancel();
                self.channel
                    .begin_accept_reconnection(carrier, initial_data_chunk);
                let result = self.channel.end_accept_reconnection().await;
                self.publish_status();
                match result {
                    Ok(deliveries) => {
                        let _ = reply.send(Ok(()));
                        return self.deliver(deliveries);
                    }
                    Err(error) => {
                        self.on_socket_closed();
                        let _ = reply.send(Err(error));
                    }
                }
            }
            ManagementCommand::ReduceGraceTime => {
                if self.grace.is_scheduled() && !self.short_grace.is_scheduled() {
                    info!(
                        "[{}] Waiting at most {}ms more for the client to reconnect",
                        self.token,
                        self.short_grace.delay().as_millis()
                    );
                    self.short_grace.schedule();
                    self.publish_status();
                }
            }
            ManagementCommand::Dispose => return Some(DisposeReason::Requested),
        }
        None
    }

    fn deliver(&mut self, deliveries: Vec<Delivery>) -> Option<DisposeReason> {
        for delivery in deliveries {
            match delivery {
                Delivery::Message(data) => {
                    if self.inbound.send(data).is_err() {
                        trace!("[{}] No consumer for management message", self.token);
                    }
                }
                Delivery::Control(data) => debug!(
                    "[{}] Ignoring {} byte control message on an established channel",
                    self.token,
                    data.len()
                ),
                Delivery::PeerDisconnected => return Some(DisposeReason::PeerDisconnected),
                Delivery::SocketClosed => self.on_socket_closed(),
            }
        }
        None
    }

    fn on_socket_closed(&mut self) {
        self.channel.lose_carrier();
        info!(
            "[{}] The client has disconnected, waiting {}ms for it to reconnect",
            self.token,
            self.grace.delay().as_millis()
        );
        self.grace.schedule();
        self.publish_status();
    }

    fn publish_status(&self) {
        self.status.send_replace(GraceStatus {
            connected: self.channel.has_carrier(),
            grace_scheduled: self.grace.is_scheduled(),
            short_grace_scheduled: self.short_grace.is_scheduled(),
        });
    }

    async fn dispose(mut self, reason: DisposeReason) {
        match reason {
            DisposeReason::GraceExpired => warn!(
                "[{}] The reconnection grace time of {}ms has expired",
                self.token,
                self.grace.delay().as_millis()
            ),
            DisposeReason::ShortGraceExpired => warn!(
                "[{}] The reconnection short grace time of {}ms has expired",
                self.token,
                self.short_grace.delay().as_millis()
            ),
            DisposeReason::PeerDisconnected => info!("[{}] The client asked to disconnect", self.token),
            DisposeReason::Requested | DisposeReason::HandlesDropped => {
                debug!("[{}] Management connection disposal requested", self.token)
            }
        }

        self.grace.cancel();
        self.short_grace.cancel();
        self.commands.close();
        self.context
            .registry
            .remove_management(&self.token, self.generation)
            .await;

        self.channel.send_disconnect().await;
        self.channel.close().await;
        self.status.send_replace(GraceStatus::default());

        info!("[{}] Management connection is disposed", self.token);
        self.context.emit(HostEvent::ManagementDisconnected {
            token: self.token.clone(),
            reason,
        });
    }
}
