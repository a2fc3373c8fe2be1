//! Property-based tests for the CMUX frame codec
//!
//! The transport below the codec delivers bytes in chunks of arbitrary
//! size with no alignment to frame boundaries, so decoding must be
//! invariant under any split of the input stream.

use modem_protocol::frame::{Frame, FrameCodec, FrameType};
use proptest::prelude::*;

fn frame_type() -> impl Strategy<Value = FrameType> {
    prop_oneof![
        Just(FrameType::Sabm),
        Just(FrameType::Ua),
        Just(FrameType::Dm),
        Just(FrameType::Disc),
        Just(FrameType::Uih),
        Just(FrameType::Ui),
        Just(FrameType::I),
    ]
}

fn arb_frame() -> impl Strategy<Value = Frame> {
    (
        0u8..=61,
        frame_type(),
        any::<bool>(),
        prop::collection::vec(any::<u8>(), 0..200),
    )
        .prop_map(|(dlci, frame_type, poll_final, payload)| Frame {
            dlci,
            frame_type,
            poll_final,
            payload,
        })
}

fn decode_all(codec: &mut FrameCodec) -> Vec<Frame> {
    std::iter::from_fn(|| codec.next_frame()).collect()
}

proptest! {
    #[test]
    fn encode_decode_round_trip(frame in arb_frame()) {
        let mut codec = FrameCodec::new();
        codec.push_bytes(&frame.encode());
        prop_assert_eq!(decode_all(&mut codec), vec![frame]);
    }

    #[test]
    fn chunk_boundary_invariance(
        frames in prop::collection::vec(arb_frame(), 1..4),
        splits in prop::collection::vec(1usize..16, 0..32),
    ) {
        let mut stream = Vec::new();
        for frame in &frames {
            stream.extend_from_slice(&frame.encode());
        }

        // Reference: feed the whole stream at once
        let mut whole = FrameCodec::new();
        whole.push_bytes(&stream);
        let expected = decode_all(&mut whole);

        // Feed the same stream split at arbitrary points
        let mut chunked = FrameCodec::new();
        let mut offset = 0;
        for len in splits {
            if offset >= stream.len() {
                break;
            }
            let end = (offset + len).min(stream.len());
            chunked.push_bytes(&stream[offset..end]);
            offset = end;
        }
        chunked.push_bytes(&stream[offset..]);

        prop_assert_eq!(decode_all(&mut chunked), expected);
    }

    #[test]
    fn flipped_checksum_drops_only_that_frame(frame in arb_frame()) {
        let mut bytes = frame.encode();
        let fcs_pos = bytes.len() - 2;
        bytes[fcs_pos] ^= 0xFF;

        let follow = Frame::uih(2, b"AT\r".to_vec());
        let mut codec = FrameCodec::new();
        codec.push_bytes(&bytes);
        codec.push_bytes(&follow.encode());

        // Exactly the valid frame comes out; the corrupted one is
        // dropped, never emitted as garbage.
        prop_assert_eq!(decode_all(&mut codec), vec![follow]);
    }
}
