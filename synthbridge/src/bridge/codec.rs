//! Frame codec for worker communication.
//!
//! Wire format: `[u32 little-endian length][length bytes of UTF-8 JSON object]`.
//!
//! The free functions are pure byte transforms. [`FrameCodec`] is the same format as
//! a tokio-util `Decoder`/`Encoder`, so pipes can be wrapped in `FramedRead`/`FramedWrite`.

use std::io;

use tokio_util::bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec, LengthDelimitedCodecError};

use super::protocol::Message;

/// Size of the length prefix.
pub const HEADER_LEN: usize = 4;

/// Default upper bound for a single payload. Synthesized audio for long text is
/// large, but a prefix beyond this is a corrupt stream, not a real reply.
pub const DEFAULT_MAX_FRAME_LEN: usize = 256 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("encoding error: {0}")]
    Encoding(String),
    #[error("framing error: {0}")]
    Framing(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Serialize a message and prepend its little-endian length.
pub fn encode(message: &Message) -> Result<Bytes, CodecError> {
    let json = serde_json::to_vec(message).map_err(|e| CodecError::Encoding(e.to_string()))?;
    let len = u32::try_from(json.len()).map_err(|_| {
        CodecError::Encoding(format!(
            "payload of {} bytes does not fit a u32 length prefix",
            json.len()
        ))
    })?;

    let mut buf = BytesMut::with_capacity(HEADER_LEN + json.len());
    buf.put_u32_le(len);
    buf.put_slice(&json);
    Ok(buf.freeze())
}

/// Read the payload length from the first four bytes of `bytes`.
pub fn decode_header(bytes: &[u8]) -> Result<u32, CodecError> {
    let header: [u8; HEADER_LEN] = bytes
        .get(..HEADER_LEN)
        .and_then(|h| h.try_into().ok())
        .ok_or_else(|| {
            CodecError::Framing(format!(
                "stream ended after {} of {} header bytes",
                bytes.len(),
                HEADER_LEN
            ))
        })?;
    Ok(u32::from_le_bytes(header))
}

/// Parse exactly `length` bytes of `bytes` as a JSON object.
pub fn decode_payload(bytes: &[u8], length: usize) -> Result<Message, CodecError> {
    let payload = bytes.get(..length).ok_or_else(|| {
        CodecError::Framing(format!(
            "stream ended after {} of {} payload bytes",
            bytes.len(),
            length
        ))
    })?;
    Message::from_slice(payload).map_err(|e| CodecError::Protocol(format!("invalid JSON: {e}")))
}

/// Streaming codec for [`Message`] frames.
///
/// Framing is delegated to a little-endian `LengthDelimitedCodec`; this layer adds
/// JSON and maps framing failures onto [`CodecError`]. A stream cut mid-frame
/// surfaces as a framing error from `decode_eof`, never as a dropped tail.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    inner: LengthDelimitedCodec,
    max_frame_len: usize,
    /// A header has been consumed but its payload has not arrived yet.
    mid_frame: bool,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(HEADER_LEN)
                .little_endian()
                .max_frame_length(DEFAULT_MAX_FRAME_LEN)
                .new_codec(),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            mid_frame: false,
        }
    }

    pub fn with_max_frame_len(mut self, max: usize) -> Self {
        self.inner.set_max_frame_length(max);
        self.max_frame_len = max;
        self
    }

    fn read_error(&self, e: io::Error) -> CodecError {
        let too_big = e
            .get_ref()
            .is_some_and(|inner| inner.is::<LengthDelimitedCodecError>());
        if too_big {
            CodecError::Protocol(format!(
                "frame exceeds limit of {} bytes",
                self.max_frame_len
            ))
        } else {
            CodecError::Io(e)
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Message;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let buffered = src.len();
        let payload = match self.inner.decode(src) {
            Ok(Some(payload)) => payload,
            Ok(None) => {
                self.mid_frame |= src.len() < buffered;
                return Ok(None);
            }
            Err(e) => return Err(self.read_error(e)),
        };
        self.mid_frame = false;
        tracing::trace!(payload_bytes = payload.len(), "Decoded frame");
        decode_payload(&payload, payload.len()).map(Some)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(message) => Ok(Some(message)),
            None if src.is_empty() && !self.mid_frame => Ok(None),
            None => {
                let buffered = src.len();
                src.clear();
                Err(CodecError::Framing(format!(
                    "stream ended mid-frame with {buffered} bytes buffered"
                )))
            }
        }
    }
}

impl Encoder<Message> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_vec(&item).map_err(|e| CodecError::Encoding(e.to_string()))?;
        let payload_len = json.len();
        tracing::trace!(payload_bytes = payload_len, "Encoding frame");
        if payload_len > 100_000 {
            tracing::debug!(
                payload_bytes = payload_len,
                payload_kb = payload_len / 1024,
                "Large frame being encoded"
            );
        }
        self.inner
            .encode(Bytes::from(json), dst)
            .map_err(|e| CodecError::Encoding(e.to_string()))
    }
}
