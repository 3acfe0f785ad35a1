//! Serialized envelope writer shared by all exchanges of a connection

use crate::{Envelope, EnvelopeCodec, FrameCodec, ProtocolError};
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::trace;

type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// Write half of a connection.
///
/// Frames of different exchanges may interleave, but every frame is written
/// whole: the async mutex serializes writers and is held across the write so
/// the transport's own backpressure suspends the caller.
pub struct EnvelopeWriter {
    writer: Mutex<BoxedWrite>,
    frames: FrameCodec,
    codec: Arc<dyn EnvelopeCodec>,
}

impl fmt::Debug for EnvelopeWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnvelopeWriter")
            .field("codec", &self.codec)
            .field("max_frame_size", &self.frames.max_frame_size())
            .finish_non_exhaustive()
    }
}

impl EnvelopeWriter {
    /// Wrap a write half
    pub fn new<W>(writer: W, codec: Arc<dyn EnvelopeCodec>, max_frame_size: usize) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            writer: Mutex::new(Box::new(writer)),
            frames: FrameCodec::with_max_frame_size(max_frame_size),
            codec,
        }
    }

    /// Codec used for envelopes and error data
    pub fn codec(&self) -> &Arc<dyn EnvelopeCodec> {
        &self.codec
    }

    /// Encode an envelope into a frame body, checking the frame size limit
    pub fn encode(&self, envelope: &Envelope) -> Result<Bytes, ProtocolError> {
        let body = self.codec.encode(envelope)?;
        let max = self.frames.max_frame_size();
        if body.len() > max {
            return Err(ProtocolError::FrameTooLarge {
                size: body.len(),
                max,
            });
        }
        Ok(body)
    }

    /// Write an already encoded frame body
    pub async fn write_encoded(&self, body: &[u8]) -> Result<(), ProtocolError> {
        let mut writer = self.writer.lock().await;
        self.frames.write_frame(&mut *writer, body).await?;
        trace!("Wrote frame of {} bytes", body.len());
        Ok(())
    }

    /// Encode and write an envelope
    pub async fn write_envelope(&self, envelope: &Envelope) -> Result<(), ProtocolError> {
        let body = self.encode(envelope)?;
        self.write_encoded(&body).await
    }

    /// Shut down the write half; the peer observes end of stream
    pub async fn shutdown(&self) -> Result<(), ProtocolError> {
        let mut writer = self.writer.lock().await;
        writer.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::default_codec;

    #[tokio::test]
    async fn test_concurrent_writes_keep_frames_whole() {
        let (client, mut server) = tokio::io::duplex(64);
        let writer = Arc::new(EnvelopeWriter::new(client, default_codec(), 1024));

        let mut tasks = Vec::new();
        for id in 0..4u64 {
            let writer = Arc::clone(&writer);
            tasks.push(tokio::spawn(async move {
                for n in 0..10 {
                    let envelope = Envelope::data(id, format!("{}-{}", id, n));
                    writer.write_envelope(&envelope).await.unwrap();
                }
            }));
        }

        let reader = tokio::spawn(async move {
            let mut frames = FrameCodec::new();
            let codec = default_codec();
            let mut per_stream = vec![Vec::new(); 4];
            for _ in 0..40 {
                let frame = frames.read_frame(&mut server).await.unwrap().unwrap();
                let envelope = codec.decode(&frame).unwrap();
                let id = envelope.stream_id().unwrap().unwrap();
                per_stream[id as usize].push(envelope.into_payload().unwrap());
            }
            per_stream
        });

        for task in tasks {
            task.await.unwrap();
        }
        let per_stream = reader.await.unwrap();

        for (id, payloads) in per_stream.into_iter().enumerate() {
            let expected: Vec<Bytes> = (0..10).map(|n| Bytes::from(format!("{}-{}", id, n))).collect();
            assert_eq!(payloads, expected);
        }
    }

    #[test]
    fn test_encode_rejects_oversized_envelope() {
        let (client, _server) = tokio::io::duplex(64);
        let writer = EnvelopeWriter::new(client, default_codec(), 32);

        let result = writer.encode(&Envelope::data(1, vec![0u8; 128]));
        assert!(matches!(result, Err(ProtocolError::FrameTooLarge { max: 32, .. })));
    }

    #[tokio::test]
    async fn test_shutdown_signals_eof() {
        let (client, mut server) = tokio::io::duplex(64);
        let writer = EnvelopeWriter::new(client, default_codec(), 1024);
        writer.shutdown().await.unwrap();

        let mut frames = FrameCodec::new();
        assert!(frames.read_frame(&mut server).await.unwrap().is_none());
    }
}
