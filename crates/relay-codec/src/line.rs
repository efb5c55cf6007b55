use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{CodecError, DEFAULT_MAX_FRAME_BYTES};

/// Newline-delimited JSON framing: each `ProtocolEnvelope` is one line.
/// Used on the broker's stdio transport, where the frame boundary must stay
/// human-readable under `tail -f`.
pub struct LineCodec {
    max_frame_bytes: usize,
}

impl LineCodec {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self { max_frame_bytes }
    }
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>, CodecError> {
        let Some(newline_at) = src.iter().position(|&b| b == b'\n') else {
            if src.len() > self.max_frame_bytes {
                return Err(CodecError::FrameTooLarge {
                    size: src.len(),
                    limit: self.max_frame_bytes,
                });
            }
            return Ok(None);
        };

        if newline_at > self.max_frame_bytes {
            src.advance(newline_at + 1);
            return Err(CodecError::FrameTooLarge {
                size: newline_at,
                limit: self.max_frame_bytes,
            });
        }

        let mut line = src.split_to(newline_at + 1);
        line.truncate(line.len() - 1);
        if line.last() == Some(&b'\r') {
            line.truncate(line.len() - 1);
        }

        let text = std::str::from_utf8(&line)?.to_string();
        Ok(Some(text))
    }
}

impl Encoder<String> for LineCodec {
    type Error = CodecError;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<(), CodecError> {
        if item.len() > self.max_frame_bytes {
            return Err(CodecError::FrameTooLarge {
                size: item.len(),
                limit: self.max_frame_bytes,
            });
        }
        dst.extend_from_slice(item.as_bytes());
        dst.extend_from_slice(b"\n");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_one_line_at_a_time() {
        let mut codec = LineCodec::default();
        let mut buf = BytesMut::from("first\nsecond\nthird");

        assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("first"));
        assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("second"));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert_eq!(buf, BytesMut::from("third"));
    }

    #[test]
    fn strips_trailing_carriage_return() {
        let mut codec = LineCodec::default();
        let mut buf = BytesMut::from("hello\r\n");
        assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("hello"));
    }

    #[test]
    fn rejects_oversized_line() {
        let mut codec = LineCodec::new(8);
        let mut buf = BytesMut::from("this line is far too long\n");
        assert!(matches!(
            codec.decode(&mut buf),
            Err(CodecError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn encode_round_trips() {
        let mut codec = LineCodec::default();
        let mut buf = BytesMut::new();
        codec.encode("hello world".to_string(), &mut buf).unwrap();
        assert_eq!(
            codec.decode(&mut buf).unwrap().as_deref(),
            Some("hello world")
        );
    }
}
