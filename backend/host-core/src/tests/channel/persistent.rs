use crate::channel::persistent::{Delivery, PersistentChannel};
use crate::channel::protocol::{HEADER_LENGTH, MessageType, ProtocolMessage};
use crate::config::ChannelConfig;
use crate::transport::deflate::Deflater;
use crate::transport::websocket::{FrameCodec, FrameMode, WebSocketTransport};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::protocol::frame::FrameHeader;
use tokio_tungstenite::tungstenite::protocol::frame::coding::{Data, OpCode};

const MASK: [u8; 4] = [0x0a, 0x0b, 0x0c, 0x0d];

/// A raw-mode transport on the host side and the plain TCP peer.
async fn raw_pair() -> (WebSocketTransport, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let address = listener.local_addr().expect("address");
    let client = TcpStream::connect(address).await.expect("connect");
    let (server, _) = listener.accept().await.expect("accept");
    let transport = WebSocketTransport::new(server, FrameCodec::new(FrameMode::Raw, false, false), Vec::new());
    (transport, client)
}

/// A WebSocket transport with permessage-deflate that records inflate input,
/// as every freshly upgraded transport does.
async fn deflate_pair() -> (WebSocketTransport, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let address = listener.local_addr().expect("address");
    let client = TcpStream::connect(address).await.expect("connect");
    let (server, _) = listener.accept().await.expect("accept");
    let codec = FrameCodec::new(FrameMode::WebSocket, true, true);
    (WebSocketTransport::new(server, codec, Vec::new()), client)
}

/// A masked, compressed, final binary frame.
fn compressed_frame(deflater: &mut Deflater, payload: &[u8]) -> Vec<u8> {
    let compressed = deflater.deflate(payload).expect("deflate");
    let header = FrameHeader {
        is_final: true,
        rsv1: true,
        rsv2: false,
        rsv3: false,
        opcode: OpCode::Data(Data::Binary),
        mask: Some(MASK),
    };
    let mut frame = Vec::new();
    header.format(compressed.len() as u64, &mut frame).expect("format");
    frame.extend(compressed.iter().enumerate().map(|(i, b)| b ^ MASK[i % 4]));
    frame
}

async fn read_message(peer: &mut TcpStream) -> ProtocolMessage {
    let mut header = [0u8; HEADER_LENGTH];
    peer.read_exact(&mut header).await.expect("header");
    let kind = MessageType::try_from(header[0]).expect("type");
    let id = u32::from_be_bytes([header[1], header[2], header[3], header[4]]);
    let ack = u32::from_be_bytes([header[5], header[6], header[7], header[8]]);
    let length = u32::from_be_bytes([header[9], header[10], header[11], header[12]]) as usize;
    let mut data = vec![0u8; length];
    peer.read_exact(&mut data).await.expect("body");
    ProtocolMessage { kind, id, ack, data }
}

/// **VALUE**: Verifies that regular messages sent during the handshake are held
/// back and delivered, in order, once the channel goes live.
///
/// **WHY THIS MATTERS**: Clients pipeline their first RPC right behind
/// `connectionType`. Dropping it leaves the client waiting forever.
///
/// **BUG THIS CATCHES**: Would catch `recv_control` discarding non-control
/// messages or `activate` forgetting to re-queue them.
#[tokio::test]
async fn given_regular_before_control_when_activated_then_regular_is_delivered() {
    // GIVEN: A client that sends a regular message and then a control message
    let (transport, mut client) = raw_pair().await;
    let mut channel = PersistentChannel::new(transport, &ChannelConfig::default());
    let mut bytes = ProtocolMessage::regular(1, 0, b"early".to_vec()).encode();
    bytes.extend(ProtocolMessage::control(b"ctl".to_vec()).encode());
    client.write_all(&bytes).await.expect("write");

    // WHEN: Reading the control message, then activating
    let control = channel.recv_control().await.expect("recv").expect("control");
    channel.activate();
    let deliveries = channel.deliver_buffered().await.expect("deliver");

    // THEN: The deferred regular message comes out afterwards
    assert_eq!(control, b"ctl");
    assert_eq!(deliveries, vec![Delivery::Message(b"early".to_vec())]);
}

/// **VALUE**: Verifies that a message with an already-seen id is dropped.
///
/// **WHY THIS MATTERS**: After a reconnection the client re-sends everything it
/// has not seen acknowledged. The application must see each message once.
///
/// **BUG THIS CATCHES**: Would catch a missing duplicate check on `incoming_msg_id`.
#[tokio::test]
async fn given_duplicate_regular_when_accepted_then_delivered_once() {
    // GIVEN: A live channel
    let (transport, _client) = raw_pair().await;
    let mut channel = PersistentChannel::new(transport, &ChannelConfig::default());
    channel.activate();
    let message = ProtocolMessage::regular(1, 0, b"once".to_vec()).encode();

    // WHEN: The same message arrives twice
    let first = channel.accept_chunk(message.clone()).await.expect("first");
    let second = channel.accept_chunk(message).await.expect("second");

    // THEN: Only the first is delivered
    assert_eq!(first, vec![Delivery::Message(b"once".to_vec())]);
    assert!(second.is_empty());
}

/// **VALUE**: Verifies that outgoing messages stay queued until the peer
/// acknowledges them.
///
/// **WHY THIS MATTERS**: The unacknowledged queue is what a reconnection re-sends.
///
/// **BUG THIS CATCHES**: Would catch acks that clear too much or nothing at all.
#[tokio::test]
async fn given_two_sent_messages_when_first_is_acked_then_one_stays_queued() {
    // GIVEN: Two messages sent to the client
    let (transport, mut client) = raw_pair().await;
    let mut channel = PersistentChannel::new(transport, &ChannelConfig::default());
    channel.activate();
    channel.send(b"a".to_vec()).await.expect("send a");
    channel.send(b"b".to_vec()).await.expect("send b");
    let sent = read_message(&mut client).await;
    assert_eq!(sent.id, 1);

    // WHEN: The client acknowledges id 1
    channel
        .accept_chunk(ProtocolMessage::ack(1).encode())
        .await
        .expect("ack");

    // THEN: Only id 2 is left
    assert_eq!(channel.unacknowledged_count(), 1);
}

/// **VALUE**: Verifies the reconnection path end to end on the channel: messages
/// queued while disconnected go out on the new carrier, and bytes the new
/// carrier's previous owner read are delivered.
///
/// **WHY THIS MATTERS**: This is the guarantee a management client relies on
/// when its network drops.
///
/// **BUG THIS CATCHES**: Would catch a reconnection that forgets to re-send the
/// queue, or drops the replay buffer.
#[tokio::test]
async fn given_queued_message_when_reconnection_accepted_then_resent_and_replay_delivered() {
    // GIVEN: A channel whose carrier dropped with one message queued
    let (transport, _old_client) = raw_pair().await;
    let mut channel = PersistentChannel::new(transport, &ChannelConfig::default());
    channel.activate();
    channel.lose_carrier();
    channel.send(b"while away".to_vec()).await.expect("queue");
    assert!(!channel.has_carrier());

    // WHEN: A new carrier arrives with a buffered client message
    let (new_transport, mut new_client) = raw_pair().await;
    let replay = ProtocolMessage::regular(1, 0, b"buffered".to_vec()).encode();
    channel.begin_accept_reconnection(new_transport, replay);
    let deliveries = channel.end_accept_reconnection().await.expect("accept");

    // THEN: The queued message is re-sent and the buffered one delivered
    let resent = read_message(&mut new_client).await;
    assert_eq!(resent.kind, MessageType::Regular);
    assert_eq!(resent.data, b"while away");
    assert_eq!(deliveries, vec![Delivery::Message(b"buffered".to_vec())]);
}

/// **VALUE**: Verifies that a handoff carries the deferred and buffered bytes
/// in arrival order.
///
/// **WHY THIS MATTERS**: These bytes become `initialDataChunk`. The runtime
/// reads them before anything else from the socket.
///
/// **BUG THIS CATCHES**: Would catch deferred messages being lost by `prepare_handoff`.
#[tokio::test]
async fn given_deferred_regular_when_preparing_handoff_then_initial_chunk_contains_it() {
    // GIVEN: A regular message that arrived before the dispatching control message
    let (transport, mut client) = raw_pair().await;
    let mut channel = PersistentChannel::new(transport, &ChannelConfig::default());
    let regular = ProtocolMessage::regular(1, 0, b"for runtime".to_vec()).encode();
    let mut bytes = regular.clone();
    bytes.extend(ProtocolMessage::control(b"ctl".to_vec()).encode());
    client.write_all(&bytes).await.expect("write");
    channel.recv_control().await.expect("recv").expect("control");

    // WHEN: Preparing the handoff
    let handoff = channel.prepare_handoff().await.expect("handoff");

    // THEN: The initial chunk is exactly the deferred message
    assert_eq!(handoff.initial_data_chunk(), regular.as_slice());
}

/// **VALUE**: Verifies that an explicit disconnect is reported as the end of
/// the logical channel, not as a transport loss.
///
/// **BUG THIS CATCHES**: Would catch Disconnect being treated like a socket close,
/// which would leave a management session waiting out its full grace time.
#[tokio::test]
async fn given_disconnect_message_when_accepted_then_peer_disconnected_is_delivered() {
    // GIVEN: A live channel
    let (transport, _client) = raw_pair().await;
    let mut channel = PersistentChannel::new(transport, &ChannelConfig::default());
    channel.activate();

    // WHEN: The client says goodbye
    let deliveries = channel
        .accept_chunk(ProtocolMessage::disconnect().encode())
        .await
        .expect("accept");

    // THEN: The channel reports the peer disconnect
    assert_eq!(deliveries, vec![Delivery::PeerDisconnected]);
}

/// **VALUE**: Verifies that an empty chunk (EOF) is surfaced as a socket close.
///
/// **BUG THIS CATCHES**: Would catch EOF being treated as an empty message.
#[tokio::test]
async fn given_eof_when_accepted_then_socket_closed_and_carrier_dropped() {
    let (transport, _client) = raw_pair().await;
    let mut channel = PersistentChannel::new(transport, &ChannelConfig::default());
    channel.activate();

    let deliveries = channel.accept_chunk(Vec::new()).await.expect("accept");

    assert_eq!(deliveries, vec![Delivery::SocketClosed]);
    assert!(!channel.has_carrier());
}

/// **VALUE**: Verifies that losing the carrier drops a pending ack deadline.
///
/// **WHY THIS MATTERS**: The management loop wakes on the ack deadline. A
/// deadline that stays in the past while no carrier is attached wakes it on
/// every iteration for the whole grace time.
///
/// **BUG THIS CATCHES**: Would catch the session spinning a core while a
/// client is away, and the owed ack being lost instead of sent on reconnection.
#[tokio::test]
async fn given_owed_ack_when_carrier_lost_then_deadline_cleared_and_ack_sent_on_reconnection() {
    // GIVEN: A channel that received a message and owes an ack
    let (transport, _old_client) = raw_pair().await;
    let mut channel = PersistentChannel::new(transport, &ChannelConfig::default());
    channel.activate();
    let deliveries = channel
        .accept_chunk(ProtocolMessage::regular(1, 0, b"needs ack".to_vec()).encode())
        .await
        .expect("accept");
    assert_eq!(deliveries, vec![Delivery::Message(b"needs ack".to_vec())]);
    assert!(channel.ack_deadline().is_some());

    // WHEN: The carrier drops before the ack went out
    channel.lose_carrier();

    // THEN: Nothing is scheduled while disconnected, even after a stray ack attempt
    assert!(channel.ack_deadline().is_none());
    channel.send_ack_if_needed().await.expect("no carrier");
    assert!(channel.ack_deadline().is_none());

    // WHEN: A new carrier is adopted
    let (new_transport, mut new_client) = raw_pair().await;
    channel.begin_accept_reconnection(new_transport, Vec::new());
    channel.end_accept_reconnection().await.expect("accept");

    // THEN: The owed ack goes out on it
    let ack = read_message(&mut new_client).await;
    assert_eq!(ack.kind, MessageType::Ack);
    assert_eq!(ack.ack, 1);
}

/// **VALUE**: Verifies that a carrier adopted by a reconnection stops
/// recording its inflate input.
///
/// **WHY THIS MATTERS**: Every upgraded transport starts out recording, in case
/// it is handed to an extension runtime. Once it carries a live management
/// channel, the recording only grows.
///
/// **BUG THIS CATCHES**: Would catch a reconnected management channel keeping
/// every compressed payload it ever receives in memory.
#[tokio::test]
async fn given_recording_carrier_when_adopted_by_reconnection_then_recording_stops() {
    // GIVEN: A management channel without a carrier and a fresh compressed carrier
    let (transport, _old_client) = raw_pair().await;
    let mut channel = PersistentChannel::new(transport, &ChannelConfig::default());
    channel.activate();
    channel.lose_carrier();
    let (carrier, mut client) = deflate_pair().await;

    // WHEN: The carrier is adopted and compressed messages arrive on it
    channel.begin_accept_reconnection(carrier, Vec::new());
    channel.end_accept_reconnection().await.expect("accept");
    let mut deflater = Deflater::new();
    let mut bytes = Vec::new();
    for id in 1..=20 {
        let message = ProtocolMessage::regular(id, 0, format!("message {id}").into_bytes());
        bytes.extend(compressed_frame(&mut deflater, &message.encode()));
    }
    client.write_all(&bytes).await.expect("write");

    let mut delivered = 0;
    while delivered < 20 {
        let chunk = channel.read_chunk().await.expect("read");
        delivered += channel.accept_chunk(chunk).await.expect("accept").len();
    }

    // THEN: Everything was inflated but nothing was recorded
    let (carrier, _) = channel.take_for_reconnection().expect("carrier");
    assert!(carrier.codec().compression_enabled());
    assert!(carrier.codec().recorded_inflate_bytes().is_empty());
}

/// **VALUE**: Verifies a detached handoff can still be rejected on its transport.
///
/// **WHY THIS MATTERS**: If passing the descriptor to the runtime fails, the
/// host still owns the socket and must tell the client why it is closing.
///
/// **BUG THIS CATCHES**: Would catch detaching consuming the stream, which
/// leaves a failed handoff to close silently.
#[tokio::test]
async fn given_detached_handoff_when_rejected_then_client_gets_error_and_close() {
    // GIVEN: A drained channel whose transport state was taken for a runtime
    let (transport, mut client) = raw_pair().await;
    let channel = PersistentChannel::new(transport, &ChannelConfig::default());
    let mut handoff = channel.prepare_handoff().await.expect("handoff");
    let (state, initial_data_chunk) = handoff.detach();
    assert!(state.skip_frames);
    assert!(initial_data_chunk.is_empty());

    // WHEN: The transfer is abandoned
    handoff.reject(b"{\"type\":\"error\"}".to_vec()).await;

    // THEN: The client reads the control message and then EOF
    let message = read_message(&mut client).await;
    assert_eq!(message.kind, MessageType::Control);
    assert_eq!(message.data, b"{\"type\":\"error\"}");
    let mut rest = Vec::new();
    client.read_to_end(&mut rest).await.expect("eof");
    assert!(rest.is_empty());
}
