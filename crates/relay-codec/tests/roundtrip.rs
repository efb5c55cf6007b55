use bytes::{Bytes, BytesMut};
use proptest::prelude::*;
use relay_codec::{LengthPrefixedCodec, LineCodec};
use tokio_util::codec::{Decoder, Encoder};

proptest! {
    #[test]
    fn line_codec_round_trips_any_line_without_embedded_newline(s in "[^\n\r]{0,500}") {
        let mut codec = LineCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(s.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap();
        prop_assert_eq!(decoded, Some(s));
    }

    #[test]
    fn length_prefixed_codec_round_trips_arbitrary_bytes(bytes in proptest::collection::vec(any::<u8>(), 0..2000)) {
        let mut codec = LengthPrefixedCodec::default();
        let mut buf = BytesMut::new();
        let payload = Bytes::from(bytes.clone());
        codec.encode(payload.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap();
        prop_assert_eq!(decoded, Some(payload));
    }
}
