//! Property-based tests for the codec and reassembly using proptest.

mod common;

use common::Pair;
use muxline_tunnel::{frame::encode_frame, Flags, FrameType, Header, MuxConfig, HEADER_SIZE};
use proptest::prelude::*;

fn frame_type() -> impl Strategy<Value = FrameType> {
    prop_oneof![
        Just(FrameType::Data),
        Just(FrameType::WindowUpdate),
        Just(FrameType::Ping),
        Just(FrameType::GoAway),
    ]
}

proptest! {
    /// Any header survives the wire, including unknown flag bits.
    #[test]
    fn test_header_round_trip(
        ty in frame_type(),
        flags in any::<u16>(),
        stream_id in any::<u32>(),
        length in any::<u32>(),
    ) {
        let h = Header::new(ty, Flags::from_bits_retain(flags), stream_id, length);
        let raw = h.encode();
        prop_assert_eq!(raw.len(), HEADER_SIZE);
        prop_assert_eq!(Header::decode(&raw).unwrap(), h);
    }

    /// Delivery does not depend on how the byte stream is cut into reads.
    #[test]
    fn test_reassembly_is_split_invariant(
        payloads in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..3000), 1..12),
        cuts in prop::collection::vec(1usize..4000, 1..20),
    ) {
        let mut pair = Pair::sink(MuxConfig::default(), true);
        let id = pair.open(false);
        pair.pump(usize::MAX);

        let mut raw = Vec::new();
        let mut expected = Vec::new();
        for p in &payloads {
            encode_frame(&Header::data(Flags::empty(), id, p.len() as u32), p, &mut raw);
            expected.extend_from_slice(p);
        }

        let mut rest = &raw[..];
        let mut i = 0;
        while !rest.is_empty() {
            let n = cuts[i % cuts.len()].min(rest.len());
            pair.server.on_receive_data(&mut pair.s_io, &rest[..n]);
            rest = &rest[n..];
            i += 1;
        }

        prop_assert_eq!(pair.server_log.borrow().bytes(id), expected);
        prop_assert_eq!(pair.server.buffered_fragment(), 0);
        prop_assert!(!pair.server.is_terminated());
    }

    /// With acknowledgements flowing, every byte arrives in order and the
    /// receiver never sees its window exceeded.
    #[test]
    fn test_window_accounting(
        window_kib in 1u32..64,
        sends in prop::collection::vec(1usize..20_000, 1..10),
        read_size in 1usize..9000,
    ) {
        let window = window_kib * 1024;
        let threshold = window / 4;
        let cfg = MuxConfig::default()
            .initial_window(window)
            .window_update_threshold(threshold);
        let mut pair = Pair::sink(cfg, true);
        let id = pair.open(false);

        let mut expected = Vec::new();
        for (n, len) in sends.iter().enumerate() {
            let chunk = vec![n as u8; *len];
            pair.client.send(&mut pair.c_io, id, &chunk).unwrap();
            expected.extend_from_slice(&chunk);

            let s = pair.client.stream(id).unwrap();
            prop_assert!(s.send_window() <= window);
            pair.pump(read_size);
        }

        prop_assert_eq!(pair.server_log.borrow().bytes(id), expected);
        prop_assert!(pair.server_log.borrow().closed.is_empty());
        let s = pair.server.stream(id).unwrap();
        prop_assert!(s.recv_window() <= window);
        prop_assert!(window - s.recv_window() < threshold);
        prop_assert_eq!(pair.client.stream(id).unwrap().pending_bytes(), 0);
    }
}
