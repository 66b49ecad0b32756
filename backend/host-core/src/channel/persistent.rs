//! Reliable, reconnectable message channel on top of a framed transport.
//!
//! Regular messages carry sequence ids and piggy-backed acks. Outgoing
//! messages stay queued until acknowledged, so swapping the carrier after a
//! disconnect loses nothing: the queue is re-sent on the new carrier and
//! duplicates are dropped on receipt.

use crate::channel::protocol::{MessageType, ProtocolMessage, ProtocolReader};
use crate::config::ChannelConfig;
use crate::error::channel::ChannelError;
use crate::transport::websocket::{TransportHandoff, WebSocketTransport};

use common::ErrorLocation;

use std::collections::VecDeque;
use std::os::fd::{AsFd, BorrowedFd};
use std::panic::Location;
use std::time::Duration;

use log::{debug, trace, warn};
use tokio::time::Instant;

const REPLAY_REQUEST_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Open,
    /// Flushing before the transport is handed to another owner.
    Draining,
    Closed,
}

/// What the channel produced from inbound bytes.
#[derive(Debug, PartialEq, Eq)]
pub enum Delivery {
    Message(Vec<u8>),
    Control(Vec<u8>),
    /// The peer sent an explicit disconnect; the logical channel is over.
    PeerDisconnected,
    /// Only the carrier is gone; the logical channel survives.
    SocketClosed,
}

pub struct PersistentChannel {
    carrier: Option<WebSocketTransport>,
    reader: ProtocolReader,
    /// Non-control messages seen while only control messages were being consumed.
    deferred: Vec<u8>,
    state: ChannelState,
    unacknowledged: VecDeque<ProtocolMessage>,
    outgoing_msg_id: u32,
    outgoing_ack_id: u32,
    incoming_msg_id: u32,
    incoming_ack_id: u32,
    acknowledge_time: Duration,
    ack_deadline: Option<Instant>,
    last_replay_request: Option<Instant>,
    max_message_bytes: u32,
}

impl PersistentChannel {
    pub fn new(carrier: WebSocketTransport, config: &ChannelConfig) -> Self {
        Self::resume(carrier, Vec::new(), config)
    }

    /// Channel whose reader starts with bytes another owner already consumed.
    pub fn resume(
        carrier: WebSocketTransport,
        initial_data_chunk: Vec<u8>,
        config: &ChannelConfig,
    ) -> Self {
        Self {
            carrier: Some(carrier),
            reader: ProtocolReader::with_initial_chunk(config.max_message_bytes, initial_data_chunk),
            deferred: Vec::new(),
            state: ChannelState::Open,
            unacknowledged: VecDeque::new(),
            outgoing_msg_id: 0,
            outgoing_ack_id: 0,
            incoming_msg_id: 0,
            incoming_ack_id: 0,
            acknowledge_time: config.acknowledge_time(),
            ack_deadline: None,
            last_replay_request: None,
            max_message_bytes: config.max_message_bytes,
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn has_carrier(&self) -> bool {
        self.carrier.is_some()
    }

    pub fn unacknowledged_count(&self) -> usize {
        self.unacknowledged.len()
    }

    /// When an explicit ack is due, if one is owed.
    pub fn ack_deadline(&self) -> Option<Instant> {
        self.ack_deadline
    }

    pub fn stop_recording_inflate(&mut self) {
        if let Some(carrier) = self.carrier.as_mut() {
            carrier.stop_recording_inflate();
        }
    }

    /// Wait for the next control message, reading no further than needed.
    ///
    /// Returns `Ok(None)` once the transport is gone or the peer disconnects.
    pub async fn recv_control(&mut self) -> Result<Option<Vec<u8>>, ChannelError> {
        loop {
            while let Some(message) = self.reader.next_message()? {
                match message.kind {
                    MessageType::Control => return Ok(Some(message.data)),
                    MessageType::Disconnect => {
                        self.state = ChannelState::Closed;
                        return Ok(None);
                    }
                    _ => self.deferred.extend_from_slice(&message.encode()),
                }
            }

            let Some(carrier) = self.carrier.as_mut() else {
                return Ok(None);
            };
            let chunk = carrier.read_chunk().await?;
            if chunk.is_empty() {
                self.carrier = None;
                return Ok(None);
            }
            let read = carrier.process(&chunk).await?;
            self.reader.accept_chunk(&read.payload);
            if read.closed {
                self.carrier = None;
            }
        }
    }

    /// Switch from control-only consumption to full delivery.
    pub fn activate(&mut self) {
        let deferred = std::mem::take(&mut self.deferred);
        self.reader.prepend(deferred);
    }

    pub async fn send_control(&mut self, data: Vec<u8>) -> Result<(), ChannelError> {
        if self.carrier.is_none() {
            return Err(ChannelError::Closed {
                message: "cannot send a control message without a transport".to_string(),
                location: ErrorLocation::from(Location::caller()),
            });
        }
        self.write(&ProtocolMessage::control(data)).await
    }

    /// Queue a regular message and write it if a carrier is attached.
    ///
    /// The message stays queued until the peer acknowledges it, even when the
    /// write fails.
    pub async fn send(&mut self, data: Vec<u8>) -> Result<(), ChannelError> {
        self.outgoing_msg_id = self.outgoing_msg_id.wrapping_add(1);
        let message = ProtocolMessage::regular(self.outgoing_msg_id, self.incoming_msg_id, data);
        self.unacknowledged.push_back(message.clone());
        self.write(&message).await?;
        if self.carrier.is_some() {
            self.mark_acknowledged();
        }
        Ok(())
    }

    /// Send the explicit ack if one is owed.
    ///
    /// Without a carrier the deadline is dropped; the ack goes out with the
    /// re-sent queue once a new carrier is adopted.
    pub async fn send_ack_if_needed(&mut self) -> Result<(), ChannelError> {
        if self.incoming_msg_id == self.outgoing_ack_id || self.carrier.is_none() {
            self.ack_deadline = None;
            return Ok(());
        }
        self.write(&ProtocolMessage::ack(self.incoming_msg_id))
            .await?;
        if self.carrier.is_some() {
            self.mark_acknowledged();
        }
        Ok(())
    }

    pub async fn send_disconnect(&mut self) {
        if let Err(error) = self.write(&ProtocolMessage::disconnect()).await {
            debug!("Disconnect notice not delivered: {error}");
        }
    }

    /// Read the next raw chunk from the carrier. Pending forever without one.
    ///
    /// Cancel safe, so it can sit in a `select!` next to timers and commands.
    pub async fn read_chunk(&mut self) -> Result<Vec<u8>, ChannelError> {
        match self.carrier.as_mut() {
            Some(carrier) => carrier.read_chunk().await,
            None => std::future::pending().await,
        }
    }

    /// Feed a chunk returned by [`PersistentChannel::read_chunk`].
    pub async fn accept_chunk(&mut self, chunk: Vec<u8>) -> Result<Vec<Delivery>, ChannelError> {
        if chunk.is_empty() {
            self.lose_carrier();
            return Ok(vec![Delivery::SocketClosed]);
        }
        let Some(carrier) = self.carrier.as_mut() else {
            return Ok(vec![Delivery::SocketClosed]);
        };

        let read = carrier.process(&chunk).await?;
        self.reader.accept_chunk(&read.payload);
        let mut deliveries = self.drain_messages().await?;

        if read.closed {
            self.lose_carrier();
            deliveries.push(Delivery::SocketClosed);
        }
        Ok(deliveries)
    }

    /// Drop the carrier after a transport failure; queued messages survive.
    pub fn lose_carrier(&mut self) {
        self.ack_deadline = None;
        if self.carrier.take().is_some() {
            trace!("Carrier dropped with {} unacknowledged messages", self.unacknowledged.len());
        }
    }

    /// Everything consumed from the transport but not delivered, in arrival order.
    pub fn read_entire_buffer(&mut self) -> Vec<u8> {
        let mut buffer = std::mem::take(&mut self.deferred);
        buffer.append(&mut self.reader.read_entire_buffer());
        buffer
    }

    /// Give up the transport and the replay buffer so another channel can adopt them.
    pub fn take_for_reconnection(&mut self) -> Option<(WebSocketTransport, Vec<u8>)> {
        let carrier = self.carrier.take()?;
        let replay = self.read_entire_buffer();
        self.state = ChannelState::Closed;
        Some((carrier, replay))
    }

    /// Adopt a new carrier. Bytes the new carrier's previous owner already read come first.
    ///
    /// The adopted carrier belongs to a live management channel from here on,
    /// so its inflate recording stops.
    pub fn begin_accept_reconnection(
        &mut self,
        mut carrier: WebSocketTransport,
        initial_data_chunk: Vec<u8>,
    ) {
        carrier.stop_recording_inflate();
        if self.carrier.replace(carrier).is_some() {
            debug!("Replacing a carrier that was still attached");
        }
        self.reader = ProtocolReader::with_initial_chunk(self.max_message_bytes, initial_data_chunk);
        self.deferred.clear();
        self.state = ChannelState::Open;
    }

    /// Re-send everything unacknowledged and deliver what the replay buffer held.
    pub async fn end_accept_reconnection(&mut self) -> Result<Vec<Delivery>, ChannelError> {
        self.send_ack_if_needed().await?;
        self.resend_unacknowledged().await?;
        self.deliver_buffered().await
    }

    /// Deliver complete messages already sitting in the reader, without reading.
    pub async fn deliver_buffered(&mut self) -> Result<Vec<Delivery>, ChannelError> {
        self.drain_messages().await
    }

    /// Flush and detach the carrier for a transfer to another process.
    pub async fn prepare_handoff(mut self) -> Result<ChannelHandoff, ChannelError> {
        self.state = ChannelState::Draining;
        let Some(mut carrier) = self.carrier.take() else {
            return Err(ChannelError::Closed {
                message: "no transport to hand off".to_string(),
                location: ErrorLocation::from(Location::caller()),
            });
        };
        carrier.flush().await?;
        let initial_data_chunk = self.read_entire_buffer();
        self.state = ChannelState::Closed;
        Ok(ChannelHandoff {
            carrier,
            initial_data_chunk,
        })
    }

    pub async fn close(&mut self) {
        self.state = ChannelState::Closed;
        if let Some(mut carrier) = self.carrier.take() {
            carrier.shutdown().await;
        }
    }

    async fn drain_messages(&mut self) -> Result<Vec<Delivery>, ChannelError> {
        let mut deliveries = Vec::new();
        let mut replay_requested = false;
        let mut gap_detected = false;

        while let Some(message) = self.reader.next_message()? {
            if message.kind != MessageType::Control {
                self.acknowledge(message.ack);
            }
            match message.kind {
                MessageType::Regular => {
                    if message.id <= self.incoming_msg_id {
                        trace!("Dropping duplicate message {}", message.id);
                        continue;
                    }
                    if message.id != self.incoming_msg_id.wrapping_add(1) {
                        gap_detected = true;
                        continue;
                    }
                    self.incoming_msg_id = message.id;
                    if self.ack_deadline.is_none() {
                        self.ack_deadline = Some(Instant::now() + self.acknowledge_time);
                    }
                    deliveries.push(Delivery::Message(message.data));
                }
                MessageType::Control => deliveries.push(Delivery::Control(message.data)),
                MessageType::Disconnect => deliveries.push(Delivery::PeerDisconnected),
                MessageType::ReplayRequest => replay_requested = true,
                MessageType::Ack | MessageType::KeepAlive | MessageType::None => {}
            }
        }

        if replay_requested {
            self.resend_unacknowledged().await?;
        }
        if gap_detected {
            self.request_replay().await?;
        }
        Ok(deliveries)
    }

    fn acknowledge(&mut self, ack: u32) {
        if ack <= self.incoming_ack_id {
            return;
        }
        self.incoming_ack_id = ack;
        while self
            .unacknowledged
            .front()
            .is_some_and(|message| message.id <= ack)
        {
            self.unacknowledged.pop_front();
        }
    }

    async fn resend_unacknowledged(&mut self) -> Result<(), ChannelError> {
        if self.unacknowledged.is_empty() {
            return Ok(());
        }
        debug!("Re-sending {} unacknowledged messages", self.unacknowledged.len());
        let pending: Vec<ProtocolMessage> = self.unacknowledged.iter().cloned().collect();
        for mut message in pending {
            message.ack = self.incoming_msg_id;
            self.write(&message).await?;
        }
        if self.carrier.is_some() {
            self.mark_acknowledged();
        }
        Ok(())
    }

    async fn request_replay(&mut self) -> Result<(), ChannelError> {
        let now = Instant::now();
        if self
            .last_replay_request
            .is_some_and(|last| now.duration_since(last) < REPLAY_REQUEST_INTERVAL)
        {
            return Ok(());
        }
        warn!(
            "Missing messages after id {}, requesting a replay",
            self.incoming_msg_id
        );
        self.last_replay_request = Some(now);
        self.write(&ProtocolMessage::replay_request()).await
    }

    fn mark_acknowledged(&mut self) {
        self.outgoing_ack_id = self.incoming_msg_id;
        self.ack_deadline = None;
    }

    /// Write if a carrier is attached. A failed write drops the carrier.
    async fn write(&mut self, message: &ProtocolMessage) -> Result<(), ChannelError> {
        let Some(carrier) = self.carrier.as_mut() else {
            return Ok(());
        };
        if let Err(error) = carrier.write_payload(&message.encode()).await {
            self.lose_carrier();
            return Err(error);
        }
        Ok(())
    }
}

/// A drained channel: the paused transport plus its replay buffer.
pub struct ChannelHandoff {
    carrier: WebSocketTransport,
    initial_data_chunk: Vec<u8>,
}

impl ChannelHandoff {
    pub fn initial_data_chunk(&self) -> &[u8] {
        &self.initial_data_chunk
    }

    /// Take the codec state and replay buffer for the new owner.
    ///
    /// The transport stays here until the handoff is dropped, so a failed
    /// transfer can still be rejected on it.
    pub fn detach(&mut self) -> (TransportHandoff, Vec<u8>) {
        let transport = self.carrier.detach();
        (transport, std::mem::take(&mut self.initial_data_chunk))
    }

    /// Send a final control message on the still-owned transport and close it.
    pub async fn reject(mut self, control_message: Vec<u8>) {
        let message = ProtocolMessage::control(control_message);
        if let Err(error) = self.carrier.write_payload(&message.encode()).await {
            debug!("Rejection not delivered: {error}");
        }
        self.carrier.shutdown().await;
    }
}

impl AsFd for ChannelHandoff {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.carrier.as_fd()
    }
}
