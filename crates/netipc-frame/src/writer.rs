use bytes::Bytes;
use futures_util::SinkExt;
use tokio::io::AsyncWrite;
use tokio_util::codec::FramedWrite;

use crate::codec::{FrameCodec, FrameConfig};
use crate::error::Result;

/// Writes complete frames to any `AsyncWrite` stream.
///
/// [`feed`](Self::feed) only buffers; nothing is guaranteed to have reached
/// the transport until [`flush`](Self::flush) returns.
pub struct FrameWriter<T> {
    inner: FramedWrite<T, FrameCodec>,
}

impl<T: AsyncWrite + Unpin> FrameWriter<T> {
    /// Create a new frame writer with default configuration.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a new frame writer with explicit configuration.
    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self {
            inner: FramedWrite::new(inner, FrameCodec::new(&config)),
        }
    }

    /// Tag and buffer one payload.
    pub async fn feed(&mut self, payload: Bytes) -> Result<()> {
        self.inner.feed(payload).await
    }

    /// Write everything buffered to the transport.
    pub async fn flush(&mut self) -> Result<()> {
        SinkExt::<Bytes>::flush(&mut self.inner).await
    }

    /// Tag, write and flush one payload.
    pub async fn send(&mut self, payload: Bytes) -> Result<()> {
        self.inner.send(payload).await
    }

    /// Flush and shut down the write side of the transport.
    pub async fn shutdown(&mut self) -> Result<()> {
        SinkExt::<Bytes>::close(&mut self.inner).await
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        self.inner.get_ref()
    }

    /// Consume the writer and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }

    /// Update maximum payload size for subsequent frame encoding.
    pub fn set_max_payload_size(&mut self, max_payload_size: usize) {
        self.inner.encoder_mut().set_max_payload(max_payload_size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FrameError;
    use crate::reader::FrameReader;

    #[tokio::test]
    async fn roundtrip_over_duplex() {
        let (left, right) = tokio::io::duplex(64 * 1024);
        let mut writer = FrameWriter::new(left);
        let mut reader = FrameReader::new(right);

        writer.send(Bytes::from_static(b"ping")).await.unwrap();
        assert_eq!(reader.read_frame().await.unwrap().unwrap().as_ref(), b"ping");
    }

    #[tokio::test]
    async fn fed_frames_arrive_in_order_after_flush() {
        let (left, right) = tokio::io::duplex(64 * 1024);
        let mut writer = FrameWriter::new(left);
        let mut reader = FrameReader::new(right);

        for i in 0..64u32 {
            writer.feed(Bytes::from(format!("msg-{i}"))).await.unwrap();
        }
        writer.flush().await.unwrap();

        for i in 0..64u32 {
            let frame = reader.read_frame().await.unwrap().unwrap();
            assert_eq!(frame.as_ref(), format!("msg-{i}").as_bytes());
        }
    }

    #[tokio::test]
    async fn concurrent_reader_and_writer_tasks() {
        let (left, right) = tokio::io::duplex(256);
        let mut writer = FrameWriter::new(left);
        let mut reader = FrameReader::new(right);

        let reader_task = tokio::spawn(async move {
            for expected in 0..500u32 {
                let frame = reader.read_frame().await.unwrap().unwrap();
                assert_eq!(frame.as_ref(), format!("payload-{expected}").as_bytes());
            }
            assert!(reader.read_frame().await.unwrap().is_none());
        });

        for i in 0..500u32 {
            writer.send(Bytes::from(format!("payload-{i}"))).await.unwrap();
        }
        writer.shutdown().await.unwrap();
        drop(writer);

        reader_task.await.unwrap();
    }

    #[tokio::test]
    async fn oversized_payload_is_rejected_before_writing() {
        let (left, _right) = tokio::io::duplex(64);
        let mut writer = FrameWriter::with_config(
            left,
            FrameConfig {
                max_payload_size: 4,
            },
        );
        let err = writer.send(Bytes::from_static(b"too long")).await.unwrap_err();
        assert!(matches!(err, FrameError::PayloadTooLarge { size: 8, max: 4 }));
    }
}
