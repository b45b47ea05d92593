//! Envelope ⇄ frame payload conversion under the negotiated settings.

use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;

use crate::codec::DEFAULT_MAX_PAYLOAD;
use crate::compress::{Compressor, DeflateCompressor};
use crate::envelope::Envelope;
use crate::error::{FrameError, Result};
use crate::format::{JsonCodec, MessageCodec, MsgPackCodec};

/// What this process can offer during negotiation.
///
/// JSON is always available. Binary encoding and compression are optional
/// strategies; leaving one out makes the peer fall back to the plain form.
#[derive(Clone)]
pub struct Capabilities {
    binary: Option<Arc<dyn MessageCodec>>,
    compressor: Option<Arc<dyn Compressor>>,
}

impl Capabilities {
    /// JSON only, uncompressed.
    pub fn plain() -> Self {
        Self {
            binary: None,
            compressor: None,
        }
    }

    pub fn with_binary_codec(mut self, codec: impl MessageCodec + 'static) -> Self {
        self.binary = Some(Arc::new(codec));
        self
    }

    pub fn with_compressor(mut self, compressor: impl Compressor + 'static) -> Self {
        self.compressor = Some(Arc::new(compressor));
        self
    }

    pub fn without_binary_codec(mut self) -> Self {
        self.binary = None;
        self
    }

    pub fn without_compression(mut self) -> Self {
        self.compressor = None;
        self
    }

    pub fn supports_binary(&self) -> bool {
        self.binary.is_some()
    }

    pub fn supports_compression(&self) -> bool {
        self.compressor.is_some()
    }
}

impl Default for Capabilities {
    /// MessagePack and raw deflate.
    fn default() -> Self {
        Self::plain()
            .with_binary_codec(MsgPackCodec)
            .with_compressor(DeflateCompressor::new(DEFAULT_MAX_PAYLOAD))
    }
}

impl std::fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capabilities")
            .field("binary", &self.binary.as_ref().map(|c| c.name()))
            .field("compressor", &self.compressor.as_ref().map(|c| c.name()))
            .finish()
    }
}

/// The encoding in force on one side of a connection.
///
/// Outbound: encode, then compress. Inbound: decompress, then decode.
/// The frame tag always measures the bytes produced by [`Self::pack`].
#[derive(Clone)]
pub struct PacketFormat {
    codec: Arc<dyn MessageCodec>,
    compressor: Option<Arc<dyn Compressor>>,
    binary: bool,
}

impl PacketFormat {
    /// Uncompressed JSON, used until the handshake completes.
    pub fn plain() -> Self {
        Self {
            codec: Arc::new(JsonCodec),
            compressor: None,
            binary: false,
        }
    }

    /// The format agreed on during the handshake.
    ///
    /// Fails if the agreement names a feature `capabilities` cannot provide.
    pub fn negotiated(capabilities: &Capabilities, compress: bool, binary: bool) -> Result<Self> {
        let codec = if binary {
            capabilities
                .binary
                .clone()
                .ok_or(FrameError::Unsupported("binary encoding"))?
        } else {
            Arc::new(JsonCodec) as Arc<dyn MessageCodec>
        };
        let compressor = if compress {
            Some(
                capabilities
                    .compressor
                    .clone()
                    .ok_or(FrameError::Unsupported("compression"))?,
            )
        } else {
            None
        };
        Ok(Self {
            codec,
            compressor,
            binary,
        })
    }

    pub fn is_compressed(&self) -> bool {
        self.compressor.is_some()
    }

    pub fn is_binary(&self) -> bool {
        self.binary
    }

    /// Envelope to frame payload.
    pub fn pack(&self, envelope: &Envelope) -> Result<Bytes> {
        let encoded = self.codec.encode(envelope)?;
        match &self.compressor {
            Some(compressor) => Ok(Bytes::from(compressor.compress(&encoded)?)),
            None => Ok(Bytes::from(encoded)),
        }
    }

    /// Frame payload to envelope.
    pub fn unpack(&self, payload: &[u8]) -> Result<Envelope> {
        let decoded = match &self.compressor {
            Some(compressor) => {
                let inflated = compressor.decompress(payload).inspect_err(|err| {
                    debug!(
                        compressor = compressor.name(),
                        len = payload.len(),
                        error = %err,
                        "decompression failed"
                    );
                })?;
                self.codec.decode(&inflated)
            }
            None => self.codec.decode(payload),
        };
        decoded.inspect_err(|err| {
            debug!(codec = self.codec.name(), error = %err, "envelope decode failed");
        })
    }
}

impl Default for PacketFormat {
    fn default() -> Self {
        Self::plain()
    }
}

impl std::fmt::Debug for PacketFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketFormat")
            .field("codec", &self.codec.name())
            .field("compressor", &self.compressor.as_ref().map(|c| c.name()))
            .finish()
    }
}
