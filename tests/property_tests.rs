//! Property-based tests using proptest.
//!
//! These pin down the codec and resolver invariants that the rest of
//! the client leans on.

use bytes::BytesMut;
use caravel::protocol::{PacketHeader, PacketParser};
use caravel::vbucket::{crc32, VbucketConfig};
use proptest::prelude::*;

fn arb_magic() -> impl Strategy<Value = u8> {
    prop_oneof![Just(0x80u8), Just(0x81u8)]
}

proptest! {
    /// decode ∘ encode is the identity on every 24-byte header with a
    /// valid magic.
    #[test]
    fn header_roundtrips_through_the_codec(
        magic in arb_magic(),
        rest in prop::array::uniform23(any::<u8>()),
    ) {
        let mut raw = vec![magic];
        raw.extend_from_slice(&rest);

        let header = PacketHeader::deserialize(&raw).unwrap();
        let mut encoded = BytesMut::new();
        header.serialize(&mut encoded);
        prop_assert_eq!(&encoded[..], &raw[..]);
    }

    /// Resolution is a pure function of (key, configuration), and the
    /// resulting vbucket id is always within the mask.
    #[test]
    fn resolution_is_pure_and_bounded(key in prop::collection::vec(any::<u8>(), 0..64)) {
        let servers = (0..4).map(|i| format!("node{i}:11210")).collect();
        let map = (0..256_usize).map(|vb| vec![(vb % 4) as i32]).collect();
        let config = VbucketConfig::new(servers, map, None).unwrap();

        let first = config.resolve(&key, None).unwrap();
        let second = config.resolve(&key, None).unwrap();
        prop_assert_eq!(first, second);

        let (vbucket, master) = first;
        prop_assert!(usize::from(vbucket) < config.num_vbuckets());
        prop_assert!(master < config.num_servers());
        prop_assert_eq!(u32::from(vbucket), crc32(&key) & 255);
    }

    /// The streaming parser never panics on arbitrary input, however
    /// it is sliced up.
    #[test]
    fn parser_survives_arbitrary_bytes(
        data in prop::collection::vec(any::<u8>(), 0..512),
        split in 1usize..64,
    ) {
        let mut parser = PacketParser::new();
        'feed: for chunk in data.chunks(split) {
            parser.extend(chunk);
            // Parse until it either stalls or rejects the stream.
            loop {
                match parser.parse() {
                    Ok(Some(_)) => {}
                    Ok(None) => break,
                    Err(_) => break 'feed,
                }
            }
        }
    }
}
