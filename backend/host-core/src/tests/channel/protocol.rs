use crate::channel::protocol::{HEADER_LENGTH, MessageType, ProtocolMessage, ProtocolReader};
use crate::error::channel::ChannelError;

const MAX: u32 = 1024;

/// **VALUE**: Verifies the 13-byte big-endian header layout.
///
/// **WHY THIS MATTERS**: Clients parse this header byte for byte. Any drift in
/// field order or endianness breaks every connection.
///
/// **BUG THIS CATCHES**: Would catch little-endian encoding or swapped id/ack fields.
#[test]
fn given_regular_message_when_encoded_then_header_is_big_endian_type_id_ack_length() {
    // GIVEN: A regular message with distinct id and ack
    let message = ProtocolMessage::regular(0x0102_0304, 0x0a0b_0c0d, b"hi".to_vec());

    // WHEN: Encoding it
    let bytes = message.encode();

    // THEN: Header fields are laid out in order, big-endian
    assert_eq!(bytes.len(), HEADER_LENGTH + 2);
    assert_eq!(bytes[0], MessageType::Regular as u8);
    assert_eq!(&bytes[1..5], &[0x01, 0x02, 0x03, 0x04]);
    assert_eq!(&bytes[5..9], &[0x0a, 0x0b, 0x0c, 0x0d]);
    assert_eq!(&bytes[9..13], &[0, 0, 0, 2]);
    assert_eq!(&bytes[13..], b"hi");
}

/// **VALUE**: Verifies that messages split across chunks are reassembled.
///
/// **WHY THIS MATTERS**: TCP and WebSocket frames do not align with protocol
/// messages; a header can arrive one byte at a time.
///
/// **BUG THIS CATCHES**: Would catch a reader that assumes one message per chunk.
#[test]
fn given_message_split_across_chunks_when_reading_then_returns_it_once_complete() {
    // GIVEN: An encoded message fed in three pieces
    let bytes = ProtocolMessage::control(b"{\"type\":\"auth\"}".to_vec()).encode();
    let mut reader = ProtocolReader::new(MAX);

    // WHEN: Feeding the first two pieces
    reader.accept_chunk(&bytes[..5]);
    let after_first = reader.next_message().expect("read");
    reader.accept_chunk(&bytes[5..HEADER_LENGTH + 3]);
    let after_second = reader.next_message().expect("read");

    // THEN: Nothing is returned until the last piece arrives
    assert!(after_first.is_none());
    assert!(after_second.is_none());

    reader.accept_chunk(&bytes[HEADER_LENGTH + 3..]);
    let message = reader.next_message().expect("read").expect("complete");
    assert_eq!(message.kind, MessageType::Control);
    assert_eq!(message.data, b"{\"type\":\"auth\"}");
    assert_eq!(reader.buffered_len(), 0);
}

/// **VALUE**: Verifies that unread bytes survive as the replay buffer.
///
/// **WHY THIS MATTERS**: A reconnection or handoff carries exactly these bytes
/// to the next owner. Losing or reordering them loses client messages.
///
/// **BUG THIS CATCHES**: Would catch a reader that discards a partial trailing message.
#[test]
fn given_one_full_and_one_partial_message_when_draining_then_replay_buffer_holds_the_partial() {
    // GIVEN: A complete message followed by half of another
    let first = ProtocolMessage::regular(1, 0, b"one".to_vec()).encode();
    let second = ProtocolMessage::regular(2, 0, b"two".to_vec()).encode();
    let mut reader = ProtocolReader::new(MAX);
    reader.accept_chunk(&first);
    reader.accept_chunk(&second[..7]);

    // WHEN: Reading what is complete and taking the rest
    let message = reader.next_message().expect("read").expect("complete");
    let replay = reader.read_entire_buffer();

    // THEN: The partial message is handed over byte for byte
    assert_eq!(message.id, 1);
    assert_eq!(replay, second[..7].to_vec());
    assert_eq!(reader.buffered_len(), 0);
}

/// **VALUE**: Verifies that prepended bytes are read before buffered ones.
///
/// **WHY THIS MATTERS**: Messages deferred during the handshake must reach the
/// application before anything that arrived after them.
///
/// **BUG THIS CATCHES**: Would catch `prepend` appending instead of prepending.
#[test]
fn given_prepended_bytes_when_reading_then_they_come_first() {
    // GIVEN: A reader holding message 2, with message 1 prepended
    let mut reader = ProtocolReader::new(MAX);
    reader.accept_chunk(&ProtocolMessage::regular(2, 0, Vec::new()).encode());
    reader.prepend(ProtocolMessage::regular(1, 0, Vec::new()).encode());

    // WHEN: Reading both
    let first = reader.next_message().expect("read").expect("first");
    let second = reader.next_message().expect("read").expect("second");

    // THEN: Arrival order is restored
    assert_eq!((first.id, second.id), (1, 2));
}

/// **VALUE**: Verifies that an oversized length is rejected before buffering.
///
/// **WHY THIS MATTERS**: The length field is attacker-controlled. Without a cap a
/// single header could make the host wait for gigabytes.
///
/// **BUG THIS CATCHES**: Would catch removal of the `maxMessageBytes` check.
#[test]
fn given_length_over_limit_when_reading_then_returns_protocol_error() {
    // GIVEN: A header announcing more than the limit
    let mut header = vec![MessageType::Regular as u8];
    header.extend_from_slice(&1u32.to_be_bytes());
    header.extend_from_slice(&0u32.to_be_bytes());
    header.extend_from_slice(&(MAX + 1).to_be_bytes());
    let mut reader = ProtocolReader::new(MAX);
    reader.accept_chunk(&header);

    // WHEN: Reading
    let result = reader.next_message();

    // THEN: The reader refuses it
    assert!(matches!(result, Err(ChannelError::Protocol { .. })));
}

/// **VALUE**: Verifies that unknown type bytes are rejected.
///
/// **BUG THIS CATCHES**: Would catch a `TryFrom<u8>` that maps unknown values to `None`.
#[test]
fn given_unknown_type_byte_when_converting_then_returns_error() {
    assert!(MessageType::try_from(6).is_ok());
    assert!(MessageType::try_from(7).is_err());
}
