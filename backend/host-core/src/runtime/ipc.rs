//! Both ends of the runtime IPC hook.
//!
//! The host listens on a Unix socket whose path the runtime finds in
//! `REMOTE_HOST_IPC_HOOK`. Messages are JSON lines. The `socket` message
//! carries the transport descriptor as ancillary data on its first bytes.

use crate::error::runtime::RuntimeError;
use crate::runtime::fd_passing::{recv_with_fds, send_with_fd};
use crate::runtime::protocol::{HostMessage, RuntimeMessage, decode_line, encode_line};

use common::ErrorLocation;

use std::collections::VecDeque;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd};
use std::panic::Location;
use std::path::Path;

use log::trace;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Interest, Lines};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Host side of an accepted IPC connection.
pub struct HostIpc {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl HostIpc {
    pub fn new(stream: UnixStream) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            lines: BufReader::new(reader).lines(),
            writer,
        }
    }

    /// Next message from the runtime; `None` once it hangs up. Cancel safe.
    pub async fn recv(&mut self) -> Result<Option<RuntimeMessage>, RuntimeError> {
        loop {
            let Some(line) = self.lines.next_line().await? else {
                return Ok(None);
            };
            if line.trim().is_empty() {
                continue;
            }
            return decode_line(line.as_bytes()).map(Some);
        }
    }

    pub async fn send(&mut self, message: &HostMessage) -> Result<(), RuntimeError> {
        let line = encode_line(message)?;
        self.writer.write_all(&line).await?;
        Ok(())
    }

    /// Send `message` with `fd` attached to its first byte.
    pub async fn send_with_fd(
        &mut self,
        message: &HostMessage,
        fd: BorrowedFd<'_>,
    ) -> Result<(), RuntimeError> {
        let line = encode_line(message)?;
        let stream: &UnixStream = self.writer.as_ref();
        let socket = stream.as_raw_fd();
        let raw_fd = fd.as_raw_fd();

        let sent = stream
            .async_io(Interest::WRITABLE, || send_with_fd(socket, &line, raw_fd))
            .await?;
        if sent == 0 {
            return Err(RuntimeError::Ipc {
                message: "IPC hook accepted no bytes of the handoff".to_string(),
                location: ErrorLocation::from(Location::caller()),
            });
        }
        trace!("Handoff descriptor sent with {sent} of {} bytes", line.len());
        self.writer.write_all(&line[sent..]).await?;
        Ok(())
    }
}

/// Runtime side of the IPC hook.
pub struct RuntimeIpc {
    stream: UnixStream,
    buffer: Vec<u8>,
    fds: VecDeque<OwnedFd>,
}

impl RuntimeIpc {
    pub async fn connect(path: &Path) -> Result<Self, RuntimeError> {
        let stream = UnixStream::connect(path).await.map_err(|e| RuntimeError::Ipc {
            message: format!("Failed to connect to IPC hook {}: {e}", path.display()),
            location: ErrorLocation::from(Location::caller()),
        })?;
        Ok(Self {
            stream,
            buffer: Vec::new(),
            fds: VecDeque::new(),
        })
    }

    pub async fn send(&mut self, message: &RuntimeMessage) -> Result<(), RuntimeError> {
        let line = encode_line(message)?;
        self.stream.write_all(&line).await?;
        Ok(())
    }

    /// Next message from the host, plus the descriptor when it is a `socket`.
    ///
    /// Descriptors are matched to `socket` messages in arrival order.
    pub async fn recv(&mut self) -> Result<Option<(HostMessage, Option<OwnedFd>)>, RuntimeError> {
        loop {
            if let Some(end) = self.buffer.iter().position(|byte| *byte == b'\n') {
                let line: Vec<u8> = self.buffer.drain(..=end).collect();
                let line = &line[..line.len() - 1];
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                let message: HostMessage = decode_line(line)?;
                let fd = match message {
                    HostMessage::Socket { .. } => Some(self.fds.pop_front().ok_or_else(|| {
                        RuntimeError::Handoff {
                            message: "socket message arrived without a descriptor".to_string(),
                            location: ErrorLocation::from(Location::caller()),
                        }
                    })?),
                    HostMessage::ReduceGraceTime => None,
                };
                return Ok(Some((message, fd)));
            }

            let mut chunk = vec![0u8; READ_BUFFER_SIZE];
            let socket = self.stream.as_raw_fd();
            let (read, fds) = self
                .stream
                .async_io(Interest::READABLE, || recv_with_fds(socket, &mut chunk))
                .await?;
            self.fds.extend(fds);
            if read == 0 {
                return Ok(None);
            }
            self.buffer.extend_from_slice(&chunk[..read]);
        }
    }
}
