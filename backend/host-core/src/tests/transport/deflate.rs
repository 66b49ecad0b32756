use crate::transport::deflate::{DEFLATE_TAIL, Deflater, Inflater};

/// **VALUE**: Verifies that the sync-flush tail is stripped from deflated output.
///
/// **WHY THIS MATTERS**: RFC 7692 requires the sender to remove `00 00 ff ff`.
/// Browsers reject frames that still carry it.
///
/// **BUG THIS CATCHES**: Would catch the tail being left in place.
#[test]
fn given_payload_when_deflated_then_tail_is_stripped() {
    // GIVEN: A fresh deflater
    let mut deflater = Deflater::new();

    // WHEN: Compressing a payload
    let compressed = deflater.deflate(b"hello hello hello").expect("deflate");

    // THEN: The output does not end with the sync-flush tail
    assert!(!compressed.ends_with(&DEFLATE_TAIL));
}

/// **VALUE**: Verifies context takeover across messages.
///
/// **WHY THIS MATTERS**: With context takeover the second message can reference
/// the first. The inflater must keep its window between messages.
///
/// **BUG THIS CATCHES**: Would catch an inflater that resets per message.
#[test]
fn given_two_messages_when_inflated_in_order_then_both_round_trip() {
    // GIVEN: Two related messages compressed on one stream
    let mut deflater = Deflater::new();
    let first = deflater.deflate(b"the quick brown fox").expect("first");
    let second = deflater.deflate(b"the quick brown fox again").expect("second");
    let mut inflater = Inflater::new(false);

    // WHEN: Inflating them in order
    let first = inflater.inflate(&first).expect("inflate first");
    let second = inflater.inflate(&second).expect("inflate second");

    // THEN: Both come back intact
    assert_eq!(first, b"the quick brown fox");
    assert_eq!(second, b"the quick brown fox again");
}

/// **VALUE**: Verifies that a recording primes a fresh inflater to the same
/// window state.
///
/// **WHY THIS MATTERS**: This is how a runtime continues a compressed stream it
/// did not see the start of. If priming is wrong, the first message after the
/// handoff inflates to garbage.
///
/// **BUG THIS CATCHES**: Would catch recording without the re-appended tail, or
/// priming that discards the window.
#[test]
fn given_recorded_input_when_priming_new_inflater_then_it_continues_the_stream() {
    // GIVEN: A recording inflater that has seen one message
    let mut deflater = Deflater::new();
    let handshake = deflater.deflate(b"{\"type\":\"auth\",\"padding\":\"abcabcabc\"}").expect("first");
    let mut recording = Inflater::new(true);
    recording.inflate(&handshake).expect("inflate handshake");
    let recorded = recording.recorded().to_vec();

    // WHEN: A fresh inflater is primed and fed the next message
    let next = deflater.deflate(b"{\"type\":\"auth\",\"padding\":\"abcabcabc\"} later").expect("next");
    let mut resumed = Inflater::new(false);
    resumed.prime(&recorded).expect("prime");
    let output = resumed.inflate(&next).expect("inflate next");

    // THEN: It decodes exactly what was sent
    assert_eq!(output, b"{\"type\":\"auth\",\"padding\":\"abcabcabc\"} later");
}

/// **VALUE**: Verifies that stopping the recording drops it.
///
/// **BUG THIS CATCHES**: Would catch a management channel recording forever and
/// growing without bound.
#[test]
fn given_recording_inflater_when_stopped_then_no_longer_records() {
    let mut inflater = Inflater::new(true);
    assert!(inflater.is_recording());

    inflater.stop_recording();

    assert!(!inflater.is_recording());
    assert!(inflater.recorded().is_empty());
}
