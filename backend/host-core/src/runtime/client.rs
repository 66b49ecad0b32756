//! The runtime's end of a handoff: connect to the IPC hook, say `ready`,
//! and rebuild transports from the descriptors the host sends.

use crate::error::runtime::RuntimeError;
use crate::runtime::ipc::RuntimeIpc;
use crate::runtime::launch::IPC_HOOK_ENV;
use crate::runtime::protocol::{HostMessage, RuntimeMessage};
use crate::transport::websocket::{FrameCodec, FrameMode, WebSocketTransport};

use common::ErrorLocation;

use std::env;
use std::os::fd::OwnedFd;
use std::panic::Location;
use std::path::{Path, PathBuf};

use log::debug;
use serde_json::Value;
use tokio::net::TcpStream;

/// A transport adopted from the host, plus the protocol bytes it had already read.
pub struct AdoptedTransport {
    pub transport: WebSocketTransport,
    pub initial_data_chunk: Vec<u8>,
}

pub enum RuntimeEvent {
    Transport(AdoptedTransport),
    ReduceGraceTime,
}

pub struct RuntimeClient {
    ipc: RuntimeIpc,
}

impl RuntimeClient {
    /// Connect to the hook named by `REMOTE_HOST_IPC_HOOK`.
    pub async fn connect_from_env() -> Result<Self, RuntimeError> {
        let path = env::var_os(IPC_HOOK_ENV)
            .map(PathBuf::from)
            .ok_or_else(|| RuntimeError::Ipc {
                message: format!("{IPC_HOOK_ENV} is not set"),
                location: ErrorLocation::from(Location::caller()),
            })?;
        Self::connect(&path).await
    }

    pub async fn connect(path: &Path) -> Result<Self, RuntimeError> {
        debug!("Connecting to IPC hook {}", path.display());
        Ok(Self {
            ipc: RuntimeIpc::connect(path).await?,
        })
    }

    pub async fn send_ready(&mut self) -> Result<(), RuntimeError> {
        self.ipc.send(&RuntimeMessage::Ready).await
    }

    pub async fn send_console(&mut self, arguments: Value) -> Result<(), RuntimeError> {
        self.ipc.send(&RuntimeMessage::Console { arguments }).await
    }

    /// Next instruction from the host; `None` once the host hangs up.
    pub async fn next_event(&mut self) -> Result<Option<RuntimeEvent>, RuntimeError> {
        let Some((message, fd)) = self.ipc.recv().await? else {
            return Ok(None);
        };
        match message {
            HostMessage::ReduceGraceTime => Ok(Some(RuntimeEvent::ReduceGraceTime)),
            HostMessage::Socket {
                initial_data_chunk,
                pending_frame_bytes,
                skip_frames,
                compression_enabled,
                inflate_bytes,
            } => {
                let Some(fd) = fd else {
                    return Err(RuntimeError::Handoff {
                        message: "socket message without a descriptor".to_string(),
                        location: ErrorLocation::from(Location::caller()),
                    });
                };
                let transport = adopt_transport(
                    fd,
                    pending_frame_bytes,
                    skip_frames,
                    compression_enabled,
                    &inflate_bytes,
                )?;
                Ok(Some(RuntimeEvent::Transport(AdoptedTransport {
                    transport,
                    initial_data_chunk,
                })))
            }
        }
    }
}

fn adopt_transport(
    fd: OwnedFd,
    pending_frame_bytes: Vec<u8>,
    skip_frames: bool,
    compression_enabled: bool,
    inflate_bytes: &[u8],
) -> Result<WebSocketTransport, RuntimeError> {
    let stream = std::net::TcpStream::from(fd);
    stream.set_nonblocking(true)?;
    let stream = TcpStream::from_std(stream)?;

    let mode = if skip_frames {
        FrameMode::Raw
    } else {
        FrameMode::WebSocket
    };
    let codec = FrameCodec::resume(mode, compression_enabled, inflate_bytes).map_err(|e| {
        RuntimeError::Handoff {
            message: format!("Failed to restore the inflate window: {e}"),
            location: ErrorLocation::from(Location::caller()),
        }
    })?;
    debug!(
        "Adopted transport ({} pending frame bytes, {} inflate bytes)",
        pending_frame_bytes.len(),
        inflate_bytes.len()
    );
    Ok(WebSocketTransport::new(stream, codec, pending_frame_bytes))
}
