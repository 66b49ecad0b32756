use crate::error::channel::ChannelError;
use crate::transport::deflate::Deflater;
use crate::transport::websocket::{FrameCodec, FrameMode, Inbound};

use tokio_tungstenite::tungstenite::protocol::frame::FrameHeader;
use tokio_tungstenite::tungstenite::protocol::frame::coding::{Control, Data, OpCode};

const MASK: [u8; 4] = [0x11, 0x22, 0x33, 0x44];

/// A client-to-server frame, masked as RFC 6455 requires.
fn client_frame(opcode: OpCode, is_final: bool, rsv1: bool, payload: &[u8]) -> Vec<u8> {
    let header = FrameHeader {
        is_final,
        rsv1,
        rsv2: false,
        rsv3: false,
        opcode,
        mask: Some(MASK),
    };
    let mut frame = Vec::new();
    header.format(payload.len() as u64, &mut frame).expect("format");
    frame.extend(payload.iter().enumerate().map(|(i, b)| b ^ MASK[i % 4]));
    frame
}

/// **VALUE**: Verifies masked binary frames are unmasked.
///
/// **BUG THIS CATCHES**: Would catch a mask applied with the wrong key offset.
#[test]
fn given_masked_binary_frame_when_decoded_then_returns_plain_payload() {
    // GIVEN: A masked binary frame
    let mut codec = FrameCodec::new(FrameMode::WebSocket, false, false);
    let frame = client_frame(OpCode::Data(Data::Binary), true, false, b"payload");

    // WHEN: Decoding it
    let inbound = codec.decode(&frame).expect("decode");

    // THEN: The plain payload comes out
    assert_eq!(inbound, vec![Inbound::Data(b"payload".to_vec())]);
}

/// **VALUE**: Verifies that unmasked client frames are rejected.
///
/// **WHY THIS MATTERS**: RFC 6455 requires the server to fail the connection.
///
/// **BUG THIS CATCHES**: Would catch a decoder that silently accepts unmasked data.
#[test]
fn given_unmasked_frame_when_decoded_then_returns_error() {
    // GIVEN: An unmasked frame
    let header = FrameHeader::default();
    let mut frame = Vec::new();
    header.format(3, &mut frame).expect("format");
    frame.extend_from_slice(b"abc");
    let mut codec = FrameCodec::new(FrameMode::WebSocket, false, false);

    // WHEN / THEN: Decoding fails
    assert!(codec.decode(&frame).is_err());
}

/// **VALUE**: Verifies fragmented messages are reassembled and control frames
/// interleaved between fragments are still surfaced.
///
/// **BUG THIS CATCHES**: Would catch continuation frames being delivered on their own.
#[test]
fn given_fragmented_message_with_ping_when_decoded_then_reassembled_and_ping_surfaced() {
    // GIVEN: Two fragments with a ping between them
    let mut bytes = client_frame(OpCode::Data(Data::Binary), false, false, b"hel");
    bytes.extend(client_frame(OpCode::Control(Control::Ping), true, false, b"p"));
    bytes.extend(client_frame(OpCode::Data(Data::Continue), true, false, b"lo"));
    let mut codec = FrameCodec::new(FrameMode::WebSocket, false, false);

    // WHEN: Decoding everything
    let inbound = codec.decode(&bytes).expect("decode");

    // THEN: The ping comes first, then the whole message
    assert_eq!(
        inbound,
        vec![Inbound::Ping(b"p".to_vec()), Inbound::Data(b"hello".to_vec())]
    );
}

/// **VALUE**: Verifies that bytes of an incomplete frame are kept for handoff.
///
/// **WHY THIS MATTERS**: A frame can be cut mid-way when the host pauses the
/// transport. The runtime must receive exactly those bytes.
///
/// **BUG THIS CATCHES**: Would catch partial frames being dropped by `take_pending`.
#[test]
fn given_partial_frame_when_taking_pending_then_bytes_are_returned_verbatim() {
    // GIVEN: A frame of which only the first half arrived
    let frame = client_frame(OpCode::Data(Data::Binary), true, false, b"0123456789");
    let mut codec = FrameCodec::new(FrameMode::WebSocket, false, false);
    let inbound = codec.decode(&frame[..8]).expect("decode");
    assert!(inbound.is_empty());

    // WHEN: Taking the pending bytes
    let pending = codec.take_pending();

    // THEN: They are the received half
    assert_eq!(pending, frame[..8].to_vec());
}

/// **VALUE**: Verifies that an open fragmented message is re-encoded so a new
/// codec can finish it.
///
/// **BUG THIS CATCHES**: Would catch the first fragment being lost on handoff.
#[test]
fn given_open_fragment_when_resumed_elsewhere_then_message_completes() {
    // GIVEN: A codec that saw only the first fragment
    let mut codec = FrameCodec::new(FrameMode::WebSocket, false, false);
    codec
        .decode(&client_frame(OpCode::Data(Data::Binary), false, false, b"first "))
        .expect("decode");
    let pending = codec.take_pending();

    // WHEN: A new codec decodes the pending bytes followed by the last fragment
    let mut resumed = FrameCodec::resume(FrameMode::WebSocket, false, &[]).expect("resume");
    let mut bytes = pending;
    bytes.extend(client_frame(OpCode::Data(Data::Continue), true, false, b"second"));
    let inbound = resumed.decode(&bytes).expect("decode");

    // THEN: The full message is delivered
    assert_eq!(inbound, vec![Inbound::Data(b"first second".to_vec())]);
}

/// **VALUE**: Verifies compressed frames are inflated and recorded.
///
/// **BUG THIS CATCHES**: Would catch RSV1 being ignored on inbound frames.
#[test]
fn given_compressed_frame_when_decoded_then_inflated_and_recorded() {
    // GIVEN: A permessage-deflate frame
    let mut client_deflater = Deflater::new();
    let compressed = client_deflater.deflate(b"compressed hello").expect("deflate");
    let frame = client_frame(OpCode::Data(Data::Binary), true, true, &compressed);
    let mut codec = FrameCodec::new(FrameMode::WebSocket, true, true);

    // WHEN: Decoding it
    let inbound = codec.decode(&frame).expect("decode");

    // THEN: The plain text comes out and the input was recorded
    assert_eq!(inbound, vec![Inbound::Data(b"compressed hello".to_vec())]);
    assert!(!codec.recorded_inflate_bytes().is_empty());
}

/// **VALUE**: Verifies raw mode passes bytes through unframed.
///
/// **BUG THIS CATCHES**: Would catch `skipWebSocketFrames` connections being
/// parsed as WebSocket frames.
#[test]
fn given_raw_mode_when_encoding_and_decoding_then_bytes_pass_through() {
    let mut codec = FrameCodec::new(FrameMode::Raw, true, true);

    let encoded = codec.encode_binary(b"raw").expect("encode");
    let decoded = codec.decode(b"raw").expect("decode");

    assert_eq!(encoded, b"raw");
    assert_eq!(decoded, vec![Inbound::Data(b"raw".to_vec())]);
    assert!(!codec.compression_enabled());
}

/// **VALUE**: Verifies server frames are unmasked binary frames.
///
/// **BUG THIS CATCHES**: Would catch the server masking its frames, which
/// browsers treat as a protocol error.
#[test]
fn given_payload_when_encoded_then_frame_is_final_unmasked_binary() {
    let mut codec = FrameCodec::new(FrameMode::WebSocket, false, false);

    let frame = codec.encode_binary(b"out").expect("encode");

    assert_eq!(frame[0], 0x82);
    assert_eq!(frame[1], 3);
    assert_eq!(&frame[2..], b"out");
}

/// **VALUE**: Verifies a frame announcing more than the limit is refused from
/// its header alone.
///
/// **WHY THIS MATTERS**: The announced length arrives before the payload. A
/// codec that waits for the bytes buffers whatever the client streams.
///
/// **BUG THIS CATCHES**: Would catch the limit being checked only after the
/// payload has been buffered, or not at all.
#[test]
fn given_oversized_frame_header_when_decoded_then_frame_error() {
    // GIVEN: A codec limited to 16 bytes and a header announcing 1 MiB
    let mut codec = FrameCodec::new(FrameMode::WebSocket, false, false).with_max_frame_bytes(16);
    let header = FrameHeader {
        mask: Some(MASK),
        ..FrameHeader::default()
    };
    let mut bytes = Vec::new();
    header.format(1024 * 1024, &mut bytes).expect("format");

    // WHEN: Only the header has arrived
    let result = codec.decode(&bytes);

    // THEN: The frame is refused
    assert!(matches!(result, Err(ChannelError::Frame { .. })));
}

/// **VALUE**: Verifies the limit also covers a message split into small fragments.
///
/// **BUG THIS CATCHES**: Would catch a client bypassing the limit by sending
/// an endless run of continuation frames.
#[test]
fn given_fragments_beyond_limit_when_decoded_then_frame_error() {
    let mut codec = FrameCodec::new(FrameMode::WebSocket, false, false).with_max_frame_bytes(16);
    let mut bytes = client_frame(OpCode::Data(Data::Binary), false, false, b"0123456789");
    bytes.extend(client_frame(OpCode::Data(Data::Continue), false, false, b"0123456789"));

    let result = codec.decode(&bytes);

    assert!(matches!(result, Err(ChannelError::Frame { .. })));
}

/// **VALUE**: Verifies frames within the limit still decode.
#[test]
fn given_frame_at_limit_when_decoded_then_delivered() {
    let mut codec = FrameCodec::new(FrameMode::WebSocket, false, false).with_max_frame_bytes(4);

    let inbound = codec
        .decode(&client_frame(OpCode::Data(Data::Binary), true, false, b"four"))
        .expect("decode");

    assert_eq!(inbound, vec![Inbound::Data(b"four".to_vec())]);
}
