//! Extension runtime supervision.
//!
//! One [`RuntimeSession`] task owns each runtime process, its IPC hook and
//! any transport waiting to be handed over. The process's exit is the only
//! way out of the loop, so cleanup runs once.

use crate::channel::persistent::{ChannelHandoff, PersistentChannel};
use crate::error::runtime::RuntimeError;
use crate::error::session::{RUNTIME_NOT_RUNNING, SessionError};
use crate::handshake::messages::{ControlMessage, ExtensionRuntimeParams};
use crate::runtime::ipc::HostIpc;
use crate::runtime::launch::{RuntimeLaunch, ipc_socket_path, negotiate_debug_port};
use crate::runtime::protocol::{HostMessage, RuntimeMessage};
use crate::server::context::HostContext;
use crate::server::events::HostEvent;
use crate::session::refuse;
use crate::session::token::ClientToken;

use std::io::Result as IoResult;
use std::os::fd::AsFd;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;

use log::{debug, error, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::process::Child as TokioChild;
use tokio::spawn as TokioSpawn;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendError;

const SUPERSEDED_REASON: &str = "Superseded by a newer connection.";
const HANDOFF_FAILED_REASON: &str = "Could not hand the connection to the extension host.";

pub(crate) enum RuntimeCommand {
    Handoff(ChannelHandoff),
    ReduceGraceTime,
    Terminate,
}

/// Registry-side handle to a running extension runtime.
#[derive(Clone)]
pub struct RuntimeHandle {
    generation: u64,
    pid: u32,
    commands: mpsc::UnboundedSender<RuntimeCommand>,
}

impl RuntimeHandle {
    pub(crate) fn new(
        generation: u64,
        pid: u32,
        commands: mpsc::UnboundedSender<RuntimeCommand>,
    ) -> Self {
        Self {
            generation,
            pid,
            commands,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn is_alive(&self) -> bool {
        !self.commands.is_closed()
    }

    pub(crate) fn reduce_grace_time(&self) -> bool {
        self.commands.send(RuntimeCommand::ReduceGraceTime).is_ok()
    }

    pub(crate) fn terminate(&self) -> bool {
        self.commands.send(RuntimeCommand::Terminate).is_ok()
    }

    /// Queue a transport for the runtime. Gives the handoff back if the session is gone.
    pub(crate) fn hand_off(&self, handoff: ChannelHandoff) -> Result<(), ChannelHandoff> {
        match self.commands.send(RuntimeCommand::Handoff(handoff)) {
            Ok(()) => Ok(()),
            Err(SendError(RuntimeCommand::Handoff(handoff))) => Err(handoff),
            Err(SendError(_)) => Ok(()),
        }
    }
}

/// How a runtime process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    /// Exit code 0, SIGTERM, or a termination the host asked for.
    pub normal: bool,
}

impl RuntimeExit {
    pub fn from_status(status: &ExitStatus, terminate_requested: bool) -> Self {
        let code = status.code();
        let signal = status.signal();
        Self {
            code,
            signal,
            normal: code == Some(0) || signal == Some(libc::SIGTERM) || terminate_requested,
        }
    }

    fn unknown() -> Self {
        Self {
            code: None,
            signal: None,
            normal: false,
        }
    }
}

/// Start a runtime for `token` and queue the channel's transport for it.
pub(crate) async fn establish(
    context: &HostContext,
    token: ClientToken,
    mut channel: PersistentChannel,
    params: ExtensionRuntimeParams,
) {
    if context.registry.has_extension_runtime(&token).await {
        refuse(channel, &token, SessionError::runtime_already_running()).await;
        return;
    }

    let debug_port = negotiate_debug_port(params.port).await;
    if let Err(error) = channel
        .send_control(ControlMessage::ok(debug_port).encode())
        .await
    {
        warn!("[{token}] Could not confirm the extension runtime connection: {error}");
        channel.close().await;
        return;
    }

    let handoff = match channel.prepare_handoff().await {
        Ok(handoff) => handoff,
        Err(error) => {
            warn!("[{token}] Could not pause the transport for the extension runtime: {error}");
            return;
        }
    };

    let ipc_path = ipc_socket_path();
    let listener = match UnixListener::bind(&ipc_path) {
        Ok(listener) => listener,
        Err(error) => {
            error!(
                "[{token}] Failed to open IPC hook {}: {error}",
                ipc_path.display()
            );
            handoff
                .reject(ControlMessage::error(error.to_string()).encode())
                .await;
            return;
        }
    };

    let launch = RuntimeLaunch {
        token: &token,
        config: &context.config.extension_runtime,
        params: &params,
        ipc_path: &ipc_path,
        debug_port,
    };
    let mut child = match launch.spawn() {
        Ok(child) => child,
        Err(spawn_error) => {
            error!("[{token}] Failed to start the extension runtime process: {spawn_error}");
            remove_socket_file(&ipc_path);
            handoff
                .reject(ControlMessage::error(spawn_error.to_string()).encode())
                .await;
            return;
        }
    };
    let pid = child.id().unwrap_or_default();

    if let Some(stdout) = child.stdout.take() {
        relay_output(token.clone(), pid, "stdout", stdout);
    }
    if let Some(stderr) = child.stderr.take() {
        relay_output(token.clone(), pid, "stderr", stderr);
    }

    let generation = context.registry.next_generation();
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let handle = RuntimeHandle::new(generation, pid, command_tx);
    if let Err(error) = context
        .registry
        .insert_extension_runtime(token.clone(), handle)
        .await
    {
        error!("[{token}] Extension runtime entry appeared during dispatch: {error}");
        if let Err(kill_error) = child.start_kill() {
            debug!("[{token}] Kill failed: {kill_error}");
        }
        remove_socket_file(&ipc_path);
        handoff
            .reject(ControlMessage::error(error.reason()).encode())
            .await;
        return;
    }

    let session = RuntimeSession {
        token: token.clone(),
        generation,
        pid,
        child,
        listener: Some(listener),
        ipc: None,
        ipc_path,
        pending: Some(handoff),
        ready: false,
        handoffs: 0,
        terminate_requested: false,
        commands: command_rx,
        commands_open: true,
        context: context.clone(),
    };
    TokioSpawn(session.run());

    info!("[{token}] Extension runtime is started");
    context.emit(HostEvent::ExtensionRuntimeStarted { token, pid });
}

/// Hand a new transport to the runtime already running for `token`.
pub(crate) async fn reconnect(
    context: &HostContext,
    token: ClientToken,
    mut channel: PersistentChannel,
    params: ExtensionRuntimeParams,
) {
    let Some(handle) = context.registry.extension_runtime(&token).await else {
        refuse(channel, &token, SessionError::runtime_not_running()).await;
        return;
    };

    if let Err(error) = channel
        .send_control(ControlMessage::ok(params.port).encode())
        .await
    {
        warn!("[{token}] Could not confirm the extension runtime reconnection: {error}");
        channel.close().await;
        return;
    }

    let handoff = match channel.prepare_handoff().await {
        Ok(handoff) => handoff,
        Err(error) => {
            warn!("[{token}] Could not pause the transport for the extension runtime: {error}");
            return;
        }
    };

    if let Err(handoff) = handle.hand_off(handoff) {
        warn!("[{token}] Extension runtime exited before the reconnection completed");
        handoff
            .reject(ControlMessage::error(RUNTIME_NOT_RUNNING).encode())
            .await;
    }
}

fn relay_output<R>(token: ClientToken, pid: u32, stream: &'static str, reader: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    TokioSpawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            info!("[{token}][extension runtime][{pid}][{stream}] {line}");
        }
    });
}

fn remove_socket_file(path: &Path) {
    if let Err(error) = std::fs::remove_file(path) {
        debug!("Could not remove IPC hook {}: {error}", path.display());
    }
}

async fn accept(listener: Option<&UnixListener>) -> IoResult<UnixStream> {
    match listener {
        Some(listener) => listener.accept().await.map(|(stream, _)| stream),
        None => std::future::pending().await,
    }
}

async fn recv(ipc: Option<&mut HostIpc>) -> Result<Option<RuntimeMessage>, RuntimeError> {
    match ipc {
        Some(ipc) => ipc.recv().await,
        None => std::future::pending().await,
    }
}

struct RuntimeSession {
    token: ClientToken,
    generation: u64,
    pid: u32,
    child: TokioChild,
    listener: Option<UnixListener>,
    ipc: Option<HostIpc>,
    ipc_path: PathBuf,
    /// Transport waiting for the first `ready`. A newer one replaces it.
    pending: Option<ChannelHandoff>,
    ready: bool,
    handoffs: usize,
    terminate_requested: bool,
    commands: mpsc::UnboundedReceiver<RuntimeCommand>,
    commands_open: bool,
    context: HostContext,
}

impl RuntimeSession {
    async fn run(mut self) {
        let status = loop {
            tokio::select! {
                accepted = accept(self.listener.as_ref()) => {
                    self.listener = None;
                    match accepted {
                        Ok(stream) => {
                            debug!("[{}] Extension runtime connected to the IPC hook", self.token);
                            self.ipc = Some(HostIpc::new(stream));
                        }
                        Err(error) => warn!("[{}] IPC hook accept failed: {error}", self.token),
                    }
                    remove_socket_file(&self.ipc_path);
                }
                message = recv(self.ipc.as_mut()) => match message {
                    Ok(Some(message)) => self.on_runtime_message(message).await,
                    Ok(None) => {
                        debug!("[{}] Extension runtime closed the IPC hook", self.token);
                        self.ipc = None;
                    }
                    Err(error @ RuntimeError::Message { .. }) => {
                        warn!("[{}] Bad message from the extension runtime: {error}", self.token);
                    }
                    Err(error) => {
                        warn!("[{}] IPC hook failed: {error}", self.token);
                        self.ipc = None;
                    }
                },
                command = self.commands.recv(), if self.commands_open => match command {
                    Some(command) => self.on_command(command).await,
                    None => {
                        self.commands_open = false;
                        self.terminate();
                    }
                },
                status = self.child.wait() => break status,
            }
        };

        self.dispose(status).await;
    }

    async fn on_runtime_message(&mut self, message: RuntimeMessage) {
        match message {
            RuntimeMessage::Ready => {
                if self.ready {
                    debug!("[{}] Ignoring repeated ready from the extension runtime", self.token);
                    return;
                }
                self.ready = true;
                if let Some(handoff) = self.pending.take() {
                    self.deliver(handoff).await;
                }
            }
            RuntimeMessage::Console { arguments } => info!(
                "[{}][extension runtime][{}][console] {arguments}",
                self.token, self.pid
            ),
        }
    }

    async fn on_command(&mut self, command: RuntimeCommand) {
        match command {
            RuntimeCommand::Handoff(handoff) => {
                if self.ready {
                    self.deliver(handoff).await;
                } else if let Some(superseded) = self.pending.replace(handoff) {
                    info!(
                        "[{}] Replacing the transport that was waiting for the extension runtime",
                        self.token
                    );
                    superseded
                        .reject(ControlMessage::error(SUPERSEDED_REASON).encode())
                        .await;
                }
            }
            RuntimeCommand::ReduceGraceTime => match self.ipc.as_mut() {
                Some(ipc) if self.ready => {
                    if let Err(error) = ipc.send(&HostMessage::ReduceGraceTime).await {
                        debug!("[{}] Reduce grace time notice not delivered: {error}", self.token);
                    }
                }
                _ => debug!(
                    "[{}] Extension runtime not ready for a reduce grace time notice",
                    self.token
                ),
            },
            RuntimeCommand::Terminate => self.terminate(),
        }
    }

    async fn deliver(&mut self, mut handoff: ChannelHandoff) {
        let Some(ipc) = self.ipc.as_mut() else {
            warn!("[{}] Extension runtime has no IPC hook for the transport", self.token);
            handoff
                .reject(ControlMessage::error(RUNTIME_NOT_RUNNING).encode())
                .await;
            return;
        };

        let (transport, initial_data_chunk) = handoff.detach();
        let message = HostMessage::Socket {
            initial_data_chunk,
            pending_frame_bytes: transport.pending_frame_bytes,
            skip_frames: transport.skip_frames,
            compression_enabled: transport.compression_enabled,
            inflate_bytes: transport.inflate_bytes,
        };

        // The runtime holds its own descriptor once this succeeds; dropping
        // `handoff` afterwards only closes the host's copy.
        match ipc.send_with_fd(&message, handoff.as_fd()).await {
            Ok(()) => {
                self.handoffs += 1;
                if self.handoffs == 1 {
                    info!("[{}] Extension runtime is connected", self.token);
                } else {
                    info!("[{}] Extension runtime is reconnected", self.token);
                }
            }
            Err(error) => {
                warn!("[{}] Transport handoff failed: {error}", self.token);
                handoff
                    .reject(ControlMessage::error(HANDOFF_FAILED_REASON).encode())
                    .await;
            }
        }
    }

    fn terminate(&mut self) {
        self.terminate_requested = true;
        let Some(pid) = self.child.id() else {
            return;
        };
        match libc::pid_t::try_from(pid) {
            Ok(pid) => {
                if unsafe { libc::kill(pid, libc::SIGTERM) } != 0 {
                    debug!(
                        "[{}] SIGTERM failed: {}",
                        self.token,
                        std::io::Error::last_os_error()
                    );
                }
            }
            Err(_) => {
                if let Err(error) = self.child.start_kill() {
                    debug!("[{}] Kill failed: {error}", self.token);
                }
            }
        }
    }

    async fn dispose(mut self, status: IoResult<ExitStatus>) {
        let exit = match &status {
            Ok(status) => RuntimeExit::from_status(status, self.terminate_requested),
            Err(error) => {
                error!("[{}] Extension runtime failed with: {error}", self.token);
                RuntimeExit::unknown()
            }
        };
        if !exit.normal {
            error!(
                "[{}] Extension runtime exited with code: {:?} and signal: {:?}",
                self.token, exit.code, exit.signal
            );
        }

        self.commands.close();
        self.context
            .registry
            .remove_extension_runtime(&self.token, self.generation)
            .await;
        if self.listener.take().is_some() {
            remove_socket_file(&self.ipc_path);
        }
        if let Some(pending) = self.pending.take() {
            pending
                .reject(ControlMessage::error(RUNTIME_NOT_RUNNING).encode())
                .await;
        }
        while let Ok(command) = self.commands.try_recv() {
            if let RuntimeCommand::Handoff(handoff) = command {
                handoff
                    .reject(ControlMessage::error(RUNTIME_NOT_RUNNING).encode())
                    .await;
            }
        }

        info!("[{}] Extension runtime is disconnected", self.token);
        self.context.emit(HostEvent::ExtensionRuntimeExited {
            token: self.token.clone(),
            pid: self.pid,
            exit,
        });
    }
}
