//! Server-side WebSocket framing over a raw TCP stream.
//!
//! The handshake is done by hand in [`super::upgrade`] and the frames are
//! decoded here, not by `tokio_tungstenite::WebSocketStream`. The host has to
//! know exactly which bytes it has consumed, so that a paused transport can
//! be handed to another process with nothing lost.

use crate::error::channel::ChannelError;
use crate::transport::deflate::{Deflater, Inflater};

use common::ErrorLocation;

use std::io::Cursor;
use std::os::fd::{AsFd, BorrowedFd};
use std::panic::Location;
use std::time::Duration;

use log::{debug, trace};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::frame::FrameHeader;
use tokio_tungstenite::tungstenite::protocol::frame::coding::{Control, Data, OpCode};

const READ_CHUNK_SIZE: usize = 64 * 1024;
const DEFAULT_MAX_FRAME_BYTES: u64 = 256 * 1024 * 1024;
const DEFAULT_WRITE_STALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Whether bytes on the wire are wrapped in WebSocket frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameMode {
    WebSocket,
    /// `skipWebSocketFrames=true`: the persistent protocol runs directly on TCP.
    Raw,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Inbound {
    Data(Vec<u8>),
    Ping(Vec<u8>),
    Pong,
    Close,
}

struct PartialMessage {
    compressed: bool,
    payload: Vec<u8>,
}

/// Incremental frame decoder/encoder.
///
/// Holds every byte received but not yet part of a complete frame, so the
/// remainder can travel with a handed-off transport.
pub struct FrameCodec {
    mode: FrameMode,
    pending: Vec<u8>,
    fragments: Option<PartialMessage>,
    deflater: Option<Deflater>,
    inflater: Option<Inflater>,
    max_frame_bytes: u64,
}

impl FrameCodec {
    pub fn new(mode: FrameMode, compression: bool, record_inflate: bool) -> Self {
        let compression = compression && mode == FrameMode::WebSocket;
        Self {
            mode,
            pending: Vec::new(),
            fragments: None,
            deflater: compression.then(Deflater::new),
            inflater: compression.then(|| Inflater::new(record_inflate)),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }

    /// Refuse frames, and fragmented messages, whose payload exceeds `max`.
    pub fn with_max_frame_bytes(mut self, max: u64) -> Self {
        self.max_frame_bytes = max;
        self
    }

    /// Rebuild a codec on the receiving side of a handoff.
    ///
    /// The inflater replays `inflate_bytes` so its window matches the peer's
    /// deflater. Undecoded frame bytes go to [`WebSocketTransport::new`].
    pub fn resume(mode: FrameMode, compression: bool, inflate_bytes: &[u8]) -> Result<Self, ChannelError> {
        let mut codec = Self::new(mode, compression, false);
        if let Some(inflater) = codec.inflater.as_mut() {
            inflater.prime(inflate_bytes)?;
        }
        Ok(codec)
    }

    pub fn mode(&self) -> FrameMode {
        self.mode
    }

    pub fn compression_enabled(&self) -> bool {
        self.deflater.is_some()
    }

    pub fn stop_recording_inflate(&mut self) {
        if let Some(inflater) = self.inflater.as_mut() {
            inflater.stop_recording();
        }
    }

    pub fn recorded_inflate_bytes(&self) -> Vec<u8> {
        self.inflater
            .as_ref()
            .map(|inflater| inflater.recorded().to_vec())
            .unwrap_or_default()
    }

    /// Undecoded bytes. A fragmented message in flight is re-encoded in front.
    pub fn take_pending(&mut self) -> Vec<u8> {
        let mut pending = Vec::new();
        if let Some(partial) = self.fragments.take() {
            let header = FrameHeader {
                is_final: false,
                rsv1: partial.compressed,
                rsv2: false,
                rsv3: false,
                opcode: OpCode::Data(Data::Binary),
                mask: Some([0; 4]),
            };
            if header
                .format(partial.payload.len() as u64, &mut pending)
                .is_ok()
            {
                pending.extend_from_slice(&partial.payload);
            }
        }
        pending.append(&mut self.pending);
        pending
    }

    pub fn decode(&mut self, chunk: &[u8]) -> Result<Vec<Inbound>, ChannelError> {
        if self.mode == FrameMode::Raw {
            if chunk.is_empty() {
                return Ok(Vec::new());
            }
            return Ok(vec![Inbound::Data(chunk.to_vec())]);
        }

        self.pending.extend_from_slice(chunk);
        let mut inbound = Vec::new();

        loop {
            let mut cursor = Cursor::new(self.pending.as_slice());
            let Some((header, length)) = FrameHeader::parse(&mut cursor)? else {
                break;
            };
            let header_length = cursor.position() as usize;
            if length > self.max_frame_bytes {
                return Err(ChannelError::Frame {
                    message: format!(
                        "frame length {length} exceeds the limit of {} bytes",
                        self.max_frame_bytes
                    ),
                    location: ErrorLocation::from(Location::caller()),
                });
            }
            let length = usize::try_from(length).map_err(|_| ChannelError::Frame {
                message: format!("frame length {length} does not fit in memory"),
                location: ErrorLocation::from(Location::caller()),
            })?;
            if self.pending.len() < header_length + length {
                break;
            }

            let mut payload = self.pending[header_length..header_length + length].to_vec();
            self.pending.drain(..header_length + length);

            let Some(mask) = header.mask else {
                return Err(ChannelError::Frame {
                    message: "client frame is not masked".to_string(),
                    location: ErrorLocation::from(Location::caller()),
                });
            };
            apply_mask(&mut payload, mask);

            if let Some(message) = self.accept_frame(&header, payload)? {
                inbound.push(message);
            }
        }

        Ok(inbound)
    }

    fn accept_frame(
        &mut self,
        header: &FrameHeader,
        payload: Vec<u8>,
    ) -> Result<Option<Inbound>, ChannelError> {
        match header.opcode {
            OpCode::Data(Data::Binary) | OpCode::Data(Data::Text) => {
                if self.fragments.is_some() {
                    return Err(ChannelError::Frame {
                        message: "new data frame while a fragmented message is open".to_string(),
                        location: ErrorLocation::from(Location::caller()),
                    });
                }
                if header.is_final {
                    self.finish_message(header.rsv1, payload).map(Some)
                } else {
                    self.fragments = Some(PartialMessage {
                        compressed: header.rsv1,
                        payload,
                    });
                    Ok(None)
                }
            }
            OpCode::Data(Data::Continue) => {
                let Some(mut partial) = self.fragments.take() else {
                    return Err(ChannelError::Frame {
                        message: "continuation frame without a message".to_string(),
                        location: ErrorLocation::from(Location::caller()),
                    });
                };
                let total = (partial.payload.len() + payload.len()) as u64;
                if total > self.max_frame_bytes {
                    return Err(ChannelError::Frame {
                        message: format!(
                            "fragmented message of {total} bytes exceeds the limit of {} bytes",
                            self.max_frame_bytes
                        ),
                        location: ErrorLocation::from(Location::caller()),
                    });
                }
                partial.payload.extend_from_slice(&payload);
                if header.is_final {
                    self.finish_message(partial.compressed, partial.payload)
                        .map(Some)
                } else {
                    self.fragments = Some(partial);
                    Ok(None)
                }
            }
            OpCode::Control(Control::Ping) => Ok(Some(Inbound::Ping(payload))),
            OpCode::Control(Control::Pong) => Ok(Some(Inbound::Pong)),
            OpCode::Control(Control::Close) => Ok(Some(Inbound::Close)),
            opcode => Err(ChannelError::Frame {
                message: format!("unsupported opcode {opcode:?}"),
                location: ErrorLocation::from(Location::caller()),
            }),
        }
    }

    fn finish_message(&mut self, compressed: bool, payload: Vec<u8>) -> Result<Inbound, ChannelError> {
        if !compressed {
            return Ok(Inbound::Data(payload));
        }
        let Some(inflater) = self.inflater.as_mut() else {
            return Err(ChannelError::Frame {
                message: "compressed frame on a connection without permessage-deflate".to_string(),
                location: ErrorLocation::from(Location::caller()),
            });
        };
        inflater.inflate(&payload).map(Inbound::Data)
    }

    pub fn encode_binary(&mut self, payload: &[u8]) -> Result<Vec<u8>, ChannelError> {
        match self.mode {
            FrameMode::Raw => Ok(payload.to_vec()),
            FrameMode::WebSocket => match self.deflater.as_mut() {
                Some(deflater) => {
                    let compressed = deflater.deflate(payload)?;
                    encode_frame(OpCode::Data(Data::Binary), true, &compressed)
                }
                None => encode_frame(OpCode::Data(Data::Binary), false, payload),
            },
        }
    }

    pub fn encode_pong(&self, payload: &[u8]) -> Result<Vec<u8>, ChannelError> {
        encode_frame(OpCode::Control(Control::Pong), false, payload)
    }

    pub fn encode_close(&self) -> Result<Vec<u8>, ChannelError> {
        encode_frame(OpCode::Control(Control::Close), false, &[])
    }
}

fn encode_frame(opcode: OpCode, rsv1: bool, payload: &[u8]) -> Result<Vec<u8>, ChannelError> {
    let header = FrameHeader {
        is_final: true,
        rsv1,
        rsv2: false,
        rsv3: false,
        opcode,
        mask: None,
    };
    let mut frame = Vec::with_capacity(payload.len() + 14);
    header.format(payload.len() as u64, &mut frame)?;
    frame.extend_from_slice(payload);
    Ok(frame)
}

fn apply_mask(payload: &mut [u8], mask: [u8; 4]) {
    for (index, byte) in payload.iter_mut().enumerate() {
        *byte ^= mask[index % 4];
    }
}

/// Result of feeding one chunk through the codec.
#[derive(Debug, Default)]
pub struct TransportRead {
    pub payload: Vec<u8>,
    /// The peer sent a Close frame; the transport must not be read again.
    pub closed: bool,
}

/// Codec state another process needs to continue a paused transport.
///
/// The stream itself travels as a file descriptor next to it.
pub struct TransportHandoff {
    pub pending_frame_bytes: Vec<u8>,
    pub skip_frames: bool,
    pub compression_enabled: bool,
    pub inflate_bytes: Vec<u8>,
}

/// A TCP stream plus the codec state for its framing.
pub struct WebSocketTransport {
    stream: TcpStream,
    codec: FrameCodec,
    backlog: Option<Vec<u8>>,
    write_stall_timeout: Duration,
}

impl WebSocketTransport {
    /// `leftover` holds bytes that arrived after the HTTP head in the same read.
    pub fn new(stream: TcpStream, codec: FrameCodec, leftover: Vec<u8>) -> Self {
        Self {
            stream,
            codec,
            backlog: (!leftover.is_empty()).then_some(leftover),
            write_stall_timeout: DEFAULT_WRITE_STALL_TIMEOUT,
        }
    }

    /// Fail a write once the peer has accepted no bytes for `stall`.
    pub fn with_write_stall_timeout(mut self, stall: Duration) -> Self {
        self.write_stall_timeout = stall;
        self
    }

    pub fn codec(&self) -> &FrameCodec {
        &self.codec
    }

    pub fn stop_recording_inflate(&mut self) {
        self.codec.stop_recording_inflate();
    }

    /// Read the next raw chunk. An empty chunk means end of stream.
    ///
    /// Cancel safe: nothing is consumed unless the future completes.
    pub async fn read_chunk(&mut self) -> Result<Vec<u8>, ChannelError> {
        if let Some(backlog) = self.backlog.take() {
            return Ok(backlog);
        }
        let mut buffer = vec![0u8; READ_CHUNK_SIZE];
        let read = self.stream.read(&mut buffer).await?;
        buffer.truncate(read);
        Ok(buffer)
    }

    /// Decode a chunk, answering pings and closes inline.
    pub async fn process(&mut self, chunk: &[u8]) -> Result<TransportRead, ChannelError> {
        let mut read = TransportRead::default();
        for inbound in self.codec.decode(chunk)? {
            match inbound {
                Inbound::Data(data) => read.payload.extend_from_slice(&data),
                Inbound::Ping(data) => {
                    let pong = self.codec.encode_pong(&data)?;
                    self.write_frame(&pong).await?;
                }
                Inbound::Pong => trace!("Ignoring pong frame"),
                Inbound::Close => {
                    debug!("Peer sent a close frame");
                    let close = self.codec.encode_close()?;
                    let _ = self.write_frame(&close).await;
                    read.closed = true;
                    break;
                }
            }
        }
        Ok(read)
    }

    pub async fn write_payload(&mut self, payload: &[u8]) -> Result<(), ChannelError> {
        let frame = self.codec.encode_binary(payload)?;
        self.write_frame(&frame).await
    }

    /// `write_all`, except that a peer which stops reading fails the write
    /// after the stall timeout instead of blocking the owner forever.
    async fn write_frame(&mut self, mut frame: &[u8]) -> Result<(), ChannelError> {
        while !frame.is_empty() {
            let written = match timeout(self.write_stall_timeout, self.stream.write(frame)).await {
                Ok(written) => written?,
                Err(_) => {
                    return Err(ChannelError::Io {
                        message: format!(
                            "peer accepted no data for {}ms",
                            self.write_stall_timeout.as_millis()
                        ),
                        location: ErrorLocation::from(Location::caller()),
                    });
                }
            };
            if written == 0 {
                return Err(ChannelError::Closed {
                    message: "peer stopped accepting data".to_string(),
                    location: ErrorLocation::from(Location::caller()),
                });
            }
            frame = &frame[written..];
        }
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<(), ChannelError> {
        self.stream.flush().await?;
        Ok(())
    }

    /// Best-effort close: a Close frame in WebSocket mode, then a FIN.
    pub async fn shutdown(&mut self) {
        if self.codec.mode() == FrameMode::WebSocket {
            if let Ok(close) = self.codec.encode_close() {
                let _ = self.write_frame(&close).await;
            }
        }
        let _ = self.stream.shutdown().await;
    }

    /// Take the codec state another owner needs to continue this stream.
    ///
    /// Undecoded bytes move into the handoff, so the stream must not be read
    /// here afterwards. It can still be written, to reject the transfer.
    pub fn detach(&mut self) -> TransportHandoff {
        let mut pending_frame_bytes = self.codec.take_pending();
        if let Some(mut backlog) = self.backlog.take() {
            pending_frame_bytes.append(&mut backlog);
        }
        TransportHandoff {
            pending_frame_bytes,
            skip_frames: self.codec.mode() == FrameMode::Raw,
            compression_enabled: self.codec.compression_enabled(),
            inflate_bytes: self.codec.recorded_inflate_bytes(),
        }
    }
}

impl AsFd for WebSocketTransport {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.stream.as_fd()
    }
}
