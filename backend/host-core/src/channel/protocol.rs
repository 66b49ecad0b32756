//! Wire format of the persistent protocol.
//!
//! Each message is a 13-byte big-endian header `[type u8][id u32][ack u32][length u32]`
//! followed by `length` bytes of body.

use crate::error::channel::ChannelError;

use common::ErrorLocation;

use std::panic::Location;

pub const HEADER_LENGTH: usize = 13;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    None = 0,
    Regular = 1,
    Control = 2,
    Ack = 3,
    KeepAlive = 4,
    Disconnect = 5,
    ReplayRequest = 6,
}

impl TryFrom<u8> for MessageType {
    type Error = ChannelError;

    #[track_caller]
    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MessageType::None),
            1 => Ok(MessageType::Regular),
            2 => Ok(MessageType::Control),
            3 => Ok(MessageType::Ack),
            4 => Ok(MessageType::KeepAlive),
            5 => Ok(MessageType::Disconnect),
            6 => Ok(MessageType::ReplayRequest),
            other => Err(ChannelError::Protocol {
                message: format!("unknown message type {other}"),
                location: ErrorLocation::from(Location::caller()),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolMessage {
    pub kind: MessageType,
    pub id: u32,
    pub ack: u32,
    pub data: Vec<u8>,
}

impl ProtocolMessage {
    pub fn regular(id: u32, ack: u32, data: Vec<u8>) -> Self {
        Self {
            kind: MessageType::Regular,
            id,
            ack,
            data,
        }
    }

    pub fn control(data: Vec<u8>) -> Self {
        Self::empty(MessageType::Control).with_data(data)
    }

    pub fn ack(ack: u32) -> Self {
        Self {
            ack,
            ..Self::empty(MessageType::Ack)
        }
    }

    pub fn disconnect() -> Self {
        Self::empty(MessageType::Disconnect)
    }

    pub fn replay_request() -> Self {
        Self::empty(MessageType::ReplayRequest)
    }

    fn empty(kind: MessageType) -> Self {
        Self {
            kind,
            id: 0,
            ack: 0,
            data: Vec::new(),
        }
    }

    fn with_data(mut self, data: Vec<u8>) -> Self {
        self.data = data;
        self
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_LENGTH + self.data.len());
        bytes.push(self.kind as u8);
        bytes.extend_from_slice(&self.id.to_be_bytes());
        bytes.extend_from_slice(&self.ack.to_be_bytes());
        bytes.extend_from_slice(&(self.data.len() as u32).to_be_bytes());
        bytes.extend_from_slice(&self.data);
        bytes
    }
}

/// Accumulates payload bytes and splits them into messages.
///
/// Whatever has not been returned by [`ProtocolReader::next_message`] is the
/// replay buffer: [`ProtocolReader::read_entire_buffer`] hands it over intact.
pub struct ProtocolReader {
    buffer: Vec<u8>,
    max_message_bytes: u32,
}

impl ProtocolReader {
    pub fn new(max_message_bytes: u32) -> Self {
        Self {
            buffer: Vec::new(),
            max_message_bytes,
        }
    }

    pub fn with_initial_chunk(max_message_bytes: u32, chunk: Vec<u8>) -> Self {
        Self {
            buffer: chunk,
            max_message_bytes,
        }
    }

    pub fn accept_chunk(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Put bytes back in front of the buffer.
    pub fn prepend(&mut self, bytes: Vec<u8>) {
        if bytes.is_empty() {
            return;
        }
        self.buffer.splice(0..0, bytes);
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn next_message(&mut self) -> Result<Option<ProtocolMessage>, ChannelError> {
        if self.buffer.len() < HEADER_LENGTH {
            return Ok(None);
        }

        let kind = MessageType::try_from(self.buffer[0])?;
        let id = read_u32(&self.buffer[1..5]);
        let ack = read_u32(&self.buffer[5..9]);
        let length = read_u32(&self.buffer[9..13]);

        if length > self.max_message_bytes {
            return Err(ChannelError::Protocol {
                message: format!(
                    "message of {length} bytes exceeds the {} byte limit",
                    self.max_message_bytes
                ),
                location: ErrorLocation::from(Location::caller()),
            });
        }

        let total = HEADER_LENGTH + length as usize;
        if self.buffer.len() < total {
            return Ok(None);
        }

        let data = self.buffer[HEADER_LENGTH..total].to_vec();
        self.buffer.drain(..total);
        Ok(Some(ProtocolMessage {
            kind,
            id,
            ack,
            data,
        }))
    }

    pub fn read_entire_buffer(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buffer)
    }
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(bytes);
    u32::from_be_bytes(word)
}
