use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use tokio::io::AsyncRead;
use tokio_util::codec::{Decoder, FramedRead};

use crate::codec::{FrameCodec, FrameConfig};
use crate::error::Result;

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;

/// Reads complete frame payloads from any `AsyncRead` stream.
///
/// Partial reads are buffered internally; callers only see complete frames.
pub struct FrameReader<T> {
    inner: FramedRead<T, FrameCodec>,
    prefix: BytesMut,
}

impl<T: AsyncRead + Unpin> FrameReader<T> {
    /// Create a new frame reader with default configuration.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a new frame reader with explicit configuration.
    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self {
            inner: FramedRead::with_capacity(
                inner,
                FrameCodec::new(&config),
                INITIAL_BUFFER_CAPACITY,
            ),
            prefix: BytesMut::new(),
        }
    }

    /// Create a reader that first consumes `prefix`, bytes already pulled
    /// off the stream (for example while sniffing a preamble).
    pub fn with_prefix(inner: T, config: FrameConfig, prefix: &[u8]) -> Self {
        let mut reader = Self::with_config(inner, config);
        reader.prefix.extend_from_slice(prefix);
        reader
    }

    /// Read the next complete frame payload.
    ///
    /// Returns `Ok(None)` on a clean EOF between frames and
    /// `Err(FrameError::ConnectionClosed)` on EOF inside a frame.
    pub async fn read_frame(&mut self) -> Result<Option<Bytes>> {
        // Frames already sitting in the prefix must not wait on the stream.
        if !self.prefix.is_empty() {
            if let Some(frame) = self.inner.decoder_mut().decode(&mut self.prefix)? {
                return Ok(Some(frame));
            }
            let rest = self.prefix.split();
            self.inner.read_buffer_mut().extend_from_slice(&rest);
        }
        self.inner.next().await.transpose()
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        self.inner.get_ref()
    }

    /// Consume the reader and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }

    /// Update maximum payload size for subsequent frame decoding.
    pub fn set_max_payload_size(&mut self, max_payload_size: usize) {
        self.inner.decoder_mut().set_max_payload(max_payload_size);
    }
}
