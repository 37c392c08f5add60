//! Property-based tests for frame layout
//!
//! These cover every payload length a frame can carry, both flag values
//! and arbitrary frame lengths, rather than hand-picked examples.

use proptest::prelude::*;
use tagwire_proto::{
    FrameHeader, HEADER_LENGTH, MAC_LENGTH, MAX_FRAME_LENGTH, MAX_PAYLOAD_LENGTH, MIN_FRAME_LENGTH,
    ProtocolError, decode_frame, encode_frame, frame_aad, frame_iv, plaintext_capacity,
};

#[test]
fn every_payload_length_round_trips() {
    for len in 0..=MAX_PAYLOAD_LENGTH {
        let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8 + 1).collect();
        for is_final in [false, true] {
            let mut buf = Vec::new();
            encode_frame(&mut buf, &payload, is_final, MAX_FRAME_LENGTH).unwrap();

            let decoded = decode_frame(&buf, MAX_FRAME_LENGTH).unwrap();
            assert_eq!(decoded.payload, payload.as_slice(), "len {len} final {is_final}");
            assert_eq!(decoded.is_final, is_final);
        }
    }
}

#[test]
fn prop_round_trip_any_frame_length() {
    proptest!(|(
        frame_length in MIN_FRAME_LENGTH..=MAX_FRAME_LENGTH,
        payload in prop::collection::vec(any::<u8>(), 0..=MAX_PAYLOAD_LENGTH),
        is_final in any::<bool>(),
    )| {
        let max = frame_length - HEADER_LENGTH - MAC_LENGTH;
        let payload = &payload[..payload.len().min(max)];

        let mut buf = Vec::new();
        let written = encode_frame(&mut buf, payload, is_final, frame_length).unwrap();
        prop_assert_eq!(written, buf.len());
        if !is_final {
            prop_assert_eq!(written, plaintext_capacity(frame_length));
        }

        let decoded = decode_frame(&buf, frame_length).unwrap();
        prop_assert_eq!(decoded.payload, payload);
        prop_assert_eq!(decoded.is_final, is_final);
    });
}

#[test]
fn prop_oversized_payload_rejected() {
    proptest!(|(frame_length in MIN_FRAME_LENGTH..=MAX_FRAME_LENGTH, extra in 1usize..64)| {
        let max = frame_length - HEADER_LENGTH - MAC_LENGTH;
        let payload = vec![0u8; max + extra];

        let mut buf = Vec::new();
        let result = encode_frame(&mut buf, &payload, true, frame_length);
        prop_assert!(
            matches!(result, Err(ProtocolError::PayloadTooLarge { .. })),
            "expected PayloadTooLarge, got {:?}",
            result
        );
    });
}

#[test]
fn prop_header_never_panics_on_garbage() {
    proptest!(|(bytes in prop::collection::vec(any::<u8>(), 0..64), frame_length in 0usize..2048)| {
        // Any outcome is fine as long as it is a value, not a panic
        let _ = FrameHeader::from_bytes(&bytes, frame_length);
        let _ = decode_frame(&bytes, frame_length);
    });
}

#[test]
fn prop_iv_and_aad_bind_frame_number() {
    proptest!(|(a in any::<u32>(), b in any::<u32>(), len in any::<u16>())| {
        prop_assume!(a != b);
        prop_assert_ne!(frame_iv(a), frame_iv(b));
        prop_assert_ne!(frame_aad(a, len), frame_aad(b, len));
    });
}
