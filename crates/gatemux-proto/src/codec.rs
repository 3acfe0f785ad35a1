//! Envelope codecs and length-prefixed framing for async streams

use crate::{Envelope, ErrorData, ProtocolError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum frame size (16MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Encodes envelopes, and the error data carried by error envelopes, to bytes.
///
/// Error data uses the same encoding as data payloads, so one codec instance
/// serves both directions of a connection.
pub trait EnvelopeCodec: Send + Sync + fmt::Debug {
    /// Encode an envelope
    fn encode(&self, envelope: &Envelope) -> Result<Bytes, ProtocolError>;

    /// Decode an envelope
    fn decode(&self, bytes: &[u8]) -> Result<Envelope, ProtocolError>;

    /// Encode error data for an error envelope payload
    fn encode_error_data(&self, data: &ErrorData) -> Result<Bytes, ProtocolError>;

    /// Decode error data from an error envelope payload
    fn decode_error_data(&self, bytes: &[u8]) -> Result<ErrorData, ProtocolError>;
}

/// MessagePack codec
#[cfg(feature = "rmp-serde")]
#[derive(Debug, Clone, Copy, Default)]
pub struct MsgPackCodec;

#[cfg(feature = "rmp-serde")]
impl EnvelopeCodec for MsgPackCodec {
    fn encode(&self, envelope: &Envelope) -> Result<Bytes, ProtocolError> {
        rmp_serde::to_vec_named(envelope)
            .map(Bytes::from)
            .map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Envelope, ProtocolError> {
        rmp_serde::from_slice(bytes).map_err(|e| ProtocolError::Decode(e.to_string()))
    }

    fn encode_error_data(&self, data: &ErrorData) -> Result<Bytes, ProtocolError> {
        rmp_serde::to_vec_named(data)
            .map(Bytes::from)
            .map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    fn decode_error_data(&self, bytes: &[u8]) -> Result<ErrorData, ProtocolError> {
        rmp_serde::from_slice(bytes).map_err(|e| ProtocolError::Decode(e.to_string()))
    }
}

/// JSON codec
#[cfg(feature = "json")]
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

#[cfg(feature = "json")]
impl EnvelopeCodec for JsonCodec {
    fn encode(&self, envelope: &Envelope) -> Result<Bytes, ProtocolError> {
        serde_json::to_vec(envelope)
            .map(Bytes::from)
            .map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Envelope, ProtocolError> {
        serde_json::from_slice(bytes).map_err(|e| ProtocolError::Decode(e.to_string()))
    }

    fn encode_error_data(&self, data: &ErrorData) -> Result<Bytes, ProtocolError> {
        serde_json::to_vec(data)
            .map(Bytes::from)
            .map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    fn decode_error_data(&self, bytes: &[u8]) -> Result<ErrorData, ProtocolError> {
        serde_json::from_slice(bytes).map_err(|e| ProtocolError::Decode(e.to_string()))
    }
}

/// Codec used when none is configured: MessagePack if enabled, JSON otherwise
pub fn default_codec() -> Arc<dyn EnvelopeCodec> {
    #[cfg(feature = "rmp-serde")]
    {
        Arc::new(MsgPackCodec)
    }
    #[cfg(not(feature = "rmp-serde"))]
    {
        Arc::new(JsonCodec)
    }
}

/// Length-prefixed frame codec for reading and writing frames over async streams
pub struct FrameCodec {
    /// Read buffer for incoming data
    read_buf: BytesMut,
    /// Maximum frame size allowed
    max_frame_size: usize,
    /// Bytes of an oversized frame still to be skipped
    discard_remaining: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    /// Create a new frame codec with default settings
    pub fn new() -> Self {
        Self::with_max_frame_size(MAX_FRAME_SIZE)
    }

    /// Create a new frame codec with custom max frame size
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            read_buf: BytesMut::with_capacity(8192),
            max_frame_size,
            discard_remaining: 0,
        }
    }

    /// Maximum frame size accepted by this codec
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Encode a frame body to bytes with length prefix
    pub fn encode_frame(&self, frame: &[u8]) -> Result<Bytes, ProtocolError> {
        if frame.len() > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: frame.len(),
                max: self.max_frame_size,
            });
        }

        let mut buf = BytesMut::with_capacity(4 + frame.len());
        buf.put_u32(frame.len() as u32);
        buf.put_slice(frame);

        Ok(buf.freeze())
    }

    /// Write a frame to an async writer
    pub async fn write_frame<W>(&self, writer: &mut W, frame: &[u8]) -> Result<(), ProtocolError>
    where
        W: AsyncWrite + Unpin,
    {
        let encoded = self.encode_frame(frame)?;
        writer.write_all(&encoded).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Read a frame from an async reader.
    ///
    /// Returns `Ok(None)` on a clean end of stream. An oversized frame is
    /// reported once as [`ProtocolError::FrameTooLarge`] and then skipped, so
    /// the next call resumes at the following frame. Cancel safe.
    pub async fn read_frame<R>(&mut self, reader: &mut R) -> Result<Option<Bytes>, ProtocolError>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            if let Some(frame) = self.try_decode_frame()? {
                return Ok(Some(frame));
            }

            self.read_buf.reserve(8192);
            let n = reader.read_buf(&mut self.read_buf).await?;

            if n == 0 {
                // EOF reached
                if self.read_buf.is_empty() && self.discard_remaining == 0 {
                    return Ok(None);
                } else {
                    self.read_buf.clear();
                    self.discard_remaining = 0;
                    return Err(ProtocolError::InvalidFrame);
                }
            }
        }
    }

    /// Try to decode a frame from the internal buffer
    pub fn try_decode_frame(&mut self) -> Result<Option<Bytes>, ProtocolError> {
        if self.discard_remaining > 0 {
            let n = self.discard_remaining.min(self.read_buf.len());
            self.read_buf.advance(n);
            self.discard_remaining -= n;
            if self.discard_remaining > 0 {
                return Ok(None);
            }
        }

        if self.read_buf.len() < 4 {
            // Not enough data for length prefix
            return Ok(None);
        }

        let frame_len = (&self.read_buf[..4]).get_u32() as usize;

        if frame_len > self.max_frame_size {
            self.read_buf.advance(4);
            self.discard_remaining = frame_len;
            return Err(ProtocolError::FrameTooLarge {
                size: frame_len,
                max: self.max_frame_size,
            });
        }

        if self.read_buf.len() < 4 + frame_len {
            return Ok(None);
        }

        self.read_buf.advance(4);
        Ok(Some(self.read_buf.split_to(frame_len).freeze()))
    }

    /// Get the current buffer size
    pub fn buffer_size(&self) -> usize {
        self.read_buf.len()
    }
}
