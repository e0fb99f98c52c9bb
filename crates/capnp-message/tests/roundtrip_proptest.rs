//! Property tests: arbitrary struct field values survive a
//! build -> finish -> encode_frame -> decode_frame -> read round trip.

use bytes::Bytes;
use capnp_message::{decode_frame, encode_frame, AnyPointerReader, MessageBuilder};
use proptest::prelude::*;

fn round_trip_struct(
    a: u64,
    b: u32,
    c: i64,
    flag: bool,
    text: &str,
    data: &[u8],
) -> (u64, u32, i64, bool, String, Vec<u8>) {
    let msg = MessageBuilder::new();
    let mut root = msg.init_root(4, 2);
    root.set_u64(0, a);
    root.set_u32(8, b);
    root.set_i64(16, c);
    root.set_bool(24 * 8, flag);
    root.set_text(0, text).unwrap();
    root.set_data(1, data).unwrap();

    let segments = msg.finish();
    let frame = encode_frame(&segments).unwrap();
    let (reader, _) = decode_frame(&Bytes::from(frame)).unwrap();
    let root = AnyPointerReader::new(&reader, 0, 0).read_struct().unwrap();

    let got_text = root
        .pointer_field(0)
        .read_text()
        .unwrap_or_default()
        .to_string();
    let got_data = root.pointer_field(1).read_data().unwrap_or_default().to_vec();

    (
        root.get_u64(0),
        root.get_u32(8),
        root.get_i64(16),
        root.get_bool(24 * 8),
        got_text,
        got_data,
    )
}

proptest! {
    #[test]
    fn scalar_and_text_fields_round_trip(
        a in any::<u64>(),
        b in any::<u32>(),
        c in any::<i64>(),
        flag in any::<bool>(),
        text in "\\PC*",
        data in prop::collection::vec(any::<u8>(), 0..64),
    ) {
        let (got_a, got_b, got_c, got_flag, got_text, got_data) =
            round_trip_struct(a, b, c, flag, &text, &data);
        prop_assert_eq!(got_a, a);
        prop_assert_eq!(got_b, b);
        prop_assert_eq!(got_c, c);
        prop_assert_eq!(got_flag, flag);
        prop_assert_eq!(got_text, text);
        prop_assert_eq!(got_data, data);
    }

    #[test]
    fn empty_text_and_data_read_back_as_empty(a in any::<u64>()) {
        let (got_a, _, _, _, got_text, got_data) = round_trip_struct(a, 0, 0, false, "", &[]);
        prop_assert_eq!(got_a, a);
        prop_assert_eq!(got_text, "");
        prop_assert!(got_data.is_empty());
    }
}
