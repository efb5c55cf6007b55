use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{CodecError, DEFAULT_MAX_FRAME_BYTES};

const HEADER_LEN: usize = 4;

/// 4-byte big-endian length prefix followed by the payload. Used on the
/// companion WebSocket gateway, where payload bytes are opaque to the
/// transport and may contain newlines.
pub struct LengthPrefixedCodec {
    max_frame_bytes: usize,
}

impl LengthPrefixedCodec {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self { max_frame_bytes }
    }
}

impl Default for LengthPrefixedCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl Decoder for LengthPrefixedCodec {
    type Item = Bytes;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, CodecError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let len = u32::from_be_bytes(src[..HEADER_LEN].try_into().unwrap()) as usize;
        if len > self.max_frame_bytes {
            src.advance(HEADER_LEN);
            return Err(CodecError::FrameTooLarge {
                size: len,
                limit: self.max_frame_bytes,
            });
        }

        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        Ok(Some(src.split_to(len).freeze()))
    }
}

impl Encoder<Bytes> for LengthPrefixedCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), CodecError> {
        if item.len() > self.max_frame_bytes {
            return Err(CodecError::FrameTooLarge {
                size: item.len(),
                limit: self.max_frame_bytes,
            });
        }
        dst.reserve(HEADER_LEN + item.len());
        dst.put_u32(item.len() as u32);
        dst.extend_from_slice(&item);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn waits_for_full_header_before_deciding() {
        let mut codec = LengthPrefixedCodec::default();
        let mut buf = BytesMut::from(&[0u8, 0, 0][..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn waits_for_full_payload() {
        let mut codec = LengthPrefixedCodec::default();
        let mut buf = BytesMut::new();
        buf.put_u32(5);
        buf.extend_from_slice(b"hel");
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn rejects_oversized_declared_length() {
        let mut codec = LengthPrefixedCodec::new(4);
        let mut buf = BytesMut::new();
        buf.put_u32(100);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(CodecError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn encode_decode_round_trip() {
        let mut codec = LengthPrefixedCodec::default();
        let mut buf = BytesMut::new();
        codec
            .encode(Bytes::from_static(b"payload"), &mut buf)
            .unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, Bytes::from_static(b"payload"));
    }
}
