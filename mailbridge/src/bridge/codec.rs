//! Framed codec for the extension channel.
//!
//! Wire format: a 4-byte little-endian length followed by that many bytes of
//! UTF-8 JSON. Every frame carries a JSON object. Works over any
//! AsyncRead/AsyncWrite (stdio pipes, sockets, in-memory duplex streams).

use std::io;

use bytes::{Bytes, BytesMut};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use super::protocol::Frame;

/// Largest frame body accepted or produced (1 MiB).
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

const HEADER_LEN: usize = 4;
const READ_CHUNK: usize = 8 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Send/receive failure on the underlying stream.
    #[error("transport error: {0}")]
    Io(#[from] io::Error),

    /// Malformed frame. The frame is dropped; the stream stays usable.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("encoding error: {0}")]
    Encoding(String),
}

impl CodecError {
    pub fn is_protocol(&self) -> bool {
        matches!(self, Self::Protocol(_))
    }

    /// Errors that say nothing about the health of the transport.
    pub fn is_encoding(&self) -> bool {
        matches!(self, Self::Encoding(_))
    }
}

/// Serialize `message` and prepend its length.
pub fn encode_frame<T: Serialize + ?Sized>(message: &T) -> Result<Bytes, CodecError> {
    let mut buf = BytesMut::new();
    FrameCodec::new().encode(message, &mut buf)?;
    Ok(buf.freeze())
}

/// Parse a frame body. Only JSON objects are valid messages.
pub fn parse_frame(body: &[u8]) -> Result<Frame, CodecError> {
    match serde_json::from_slice::<serde_json::Value>(body) {
        Ok(serde_json::Value::Object(map)) => Ok(map),
        Ok(_) => Err(CodecError::Protocol(
            "frame payload is not a JSON object".to_string(),
        )),
        Err(e) => Err(CodecError::Protocol(format!("invalid JSON payload: {e}"))),
    }
}

/// Length-prefixed JSON codec.
///
/// Wraps a little-endian `LengthDelimitedCodec` capped at [`MAX_FRAME_LEN`],
/// which rejects an oversized header before reserving space for the body.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    inner: LengthDelimitedCodec,
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
                .little_endian()
                .length_field_length(HEADER_LEN)
                .max_frame_length(MAX_FRAME_LEN)
                .new_codec(),
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let body = match self.inner.decode(src) {
            Ok(Some(body)) => body,
            Ok(None) => return Ok(None),
            Err(e) => {
                // The bad header is still buffered and nothing after it can
                // be trusted: drop what is buffered.
                src.clear();
                return Err(CodecError::Protocol(format!(
                    "rejected frame header ({e}), limit is {MAX_FRAME_LEN} bytes"
                )));
            }
        };

        if body.is_empty() {
            return Err(CodecError::Protocol("zero-length frame".to_string()));
        }
        parse_frame(&body).map(Some)
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(buf)? {
            Some(frame) => Ok(Some(frame)),
            None => {
                if !buf.is_empty() {
                    tracing::debug!(buffered_bytes = buf.len(), "Stream ended mid-frame");
                    buf.clear();
                }
                // Forget a header whose body never arrived.
                *self = Self::new();
                Ok(None)
            }
        }
    }
}

impl<T: Serialize> Encoder<T> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_vec(&item).map_err(|e| CodecError::Encoding(e.to_string()))?;
        let json_len = json.len();
        if json_len > MAX_FRAME_LEN {
            return Err(CodecError::Encoding(format!(
                "frame of {json_len} bytes exceeds limit of {MAX_FRAME_LEN} bytes"
            )));
        }

        tracing::trace!(json_size_bytes = json_len, "Encoding frame");
        if json_len > 256 * 1024 {
            tracing::info!(
                json_size_bytes = json_len,
                json_size_kb = json_len / 1024,
                "Large frame being encoded"
            );
        }
        self.inner.encode(Bytes::from(json), dst)?;
        Ok(())
    }
}

/// Pull-based frame reader over any byte stream.
///
/// Unlike `FramedRead`, a protocol error does not end the stream: the bad
/// frame is reported and the next call keeps reading.
pub struct FrameReader<R> {
    inner: R,
    codec: FrameCodec,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            codec: FrameCodec::new(),
            buf: BytesMut::with_capacity(READ_CHUNK),
        }
    }

    /// Read the next frame.
    ///
    /// Returns `Ok(None)` once the stream has ended, including when it ends
    /// part-way through a frame. Partial reads are retried until a whole
    /// frame is buffered.
    pub async fn read_frame(&mut self) -> Result<Option<Frame>, CodecError> {
        loop {
            if let Some(frame) = self.codec.decode(&mut self.buf)? {
                return Ok(Some(frame));
            }

            if self.inner.read_buf(&mut self.buf).await? == 0 {
                return self.codec.decode_eof(&mut self.buf);
            }
        }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}
