//! Framing for the protocol stream: one line-delimited codec (used on stdio,
//! where a human tailing the pipe should still see readable JSON) and one
//! length-prefixed codec (used on the companion WebSocket, where frames can
//! legally contain newlines). Both share a single maximum frame size so a
//! misbehaving peer can't grow an unbounded buffer.

mod length_prefixed;
mod line;

pub use length_prefixed::LengthPrefixedCodec;
pub use line::LineCodec;

/// Default ceiling on a single frame, in both codecs. Chosen generously
/// above any realistic envelope (a worker's entire recent-output buffer is
/// capped well under this) while still bounding memory against a runaway
/// or adversarial peer.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("frame of {size} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { size: usize, limit: usize },
    #[error("invalid utf-8 in frame")]
    InvalidUtf8(#[from] std::str::Utf8Error),
    #[error("malformed json: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<CodecError> for relay_types::ProtocolError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::FrameTooLarge { size, limit } => {
                relay_types::ProtocolError::FrameTooLarge { size, limit }
            }
            other => relay_types::ProtocolError::Malformed(other.to_string()),
        }
    }
}
