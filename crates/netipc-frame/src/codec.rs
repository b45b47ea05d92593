use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{FrameError, Result};

/// Maximum width of the length tag in bytes.
pub const MAX_TAG_BYTES: usize = 4;

/// Largest payload a 4-byte tag can describe: 2^28 - 1 bytes.
pub const MAX_FRAME_PAYLOAD: usize = (1 << (7 * MAX_TAG_BYTES)) - 1;

/// Default maximum payload size: 16 MiB.
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

const TERMINAL_BIT: u8 = 0x80;
const CHUNK_MASK: u8 = 0x7f;

/// Number of tag bytes needed to describe `len`.
pub fn tag_len(len: usize) -> usize {
    let mut n = 1;
    let mut v = len >> 7;
    while v != 0 {
        n += 1;
        v >>= 7;
    }
    n
}

/// Append the length tag for `len` to `dst`.
///
/// Base-128, most significant chunk first. Only the final byte has the
/// high bit set.
pub fn encode_tag(len: usize, dst: &mut BytesMut) -> Result<()> {
    if len > MAX_FRAME_PAYLOAD {
        return Err(FrameError::PayloadTooLarge {
            size: len,
            max: MAX_FRAME_PAYLOAD,
        });
    }
    let width = tag_len(len);
    for i in (0..width).rev() {
        let mut byte = ((len >> (7 * i)) as u8) & CHUNK_MASK;
        if i == 0 {
            byte |= TERMINAL_BIT;
        }
        dst.put_u8(byte);
    }
    Ok(())
}

/// Parse a length tag at the start of `src` without consuming anything.
///
/// Returns `Ok(Some((tag_bytes, payload_len)))` once the terminal byte is
/// visible, `Ok(None)` if more bytes are needed.
pub fn decode_tag(src: &[u8]) -> Result<Option<(usize, usize)>> {
    let mut len = 0usize;
    for (i, &byte) in src.iter().take(MAX_TAG_BYTES).enumerate() {
        len = (len << 7) | usize::from(byte & CHUNK_MASK);
        if byte & TERMINAL_BIT != 0 {
            return Ok(Some((i + 1, len)));
        }
    }
    if src.len() >= MAX_TAG_BYTES {
        return Err(FrameError::TagTooLong { max: MAX_TAG_BYTES });
    }
    Ok(None)
}

/// Encode one frame into the wire format.
///
/// Wire format:
/// ```text
/// ┌──────────────────────┬─────────────────────────┐
/// │ Length tag (1..=4B)  │ Payload (Length bytes)   │
/// │ 7 bits per byte,     │ encoded envelope,        │
/// │ last byte has 0x80   │ possibly compressed      │
/// └──────────────────────┴─────────────────────────┘
/// ```
pub fn encode_frame(payload: &[u8], dst: &mut BytesMut) -> Result<()> {
    dst.reserve(tag_len(payload.len()) + payload.len());
    encode_tag(payload.len(), dst)?;
    dst.put_slice(payload);
    Ok(())
}

/// Decode one frame from a buffer.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete frame yet.
/// On success, consumes the frame bytes from the buffer.
pub fn decode_frame(src: &mut BytesMut, max_payload: usize) -> Result<Option<Bytes>> {
    let Some((tag_bytes, payload_len)) = decode_tag(src)? else {
        return Ok(None);
    };

    if payload_len > max_payload {
        return Err(FrameError::PayloadTooLarge {
            size: payload_len,
            max: max_payload,
        });
    }

    let total = tag_bytes + payload_len;
    if src.len() < total {
        src.reserve(total - src.len());
        return Ok(None);
    }

    src.advance(tag_bytes);
    Ok(Some(src.split_to(payload_len).freeze()))
}

/// Configuration for the frame codec.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum payload size in bytes. Default: 16 MiB, never above
    /// [`MAX_FRAME_PAYLOAD`].
    pub max_payload_size: usize,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD,
        }
    }
}

impl FrameConfig {
    /// The effective limit after clamping to what the tag can express.
    pub fn effective_max_payload(&self) -> usize {
        self.max_payload_size.min(MAX_FRAME_PAYLOAD)
    }
}

/// tokio-util codec for varint-tagged frames.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_payload: usize,
}

impl FrameCodec {
    pub fn new(config: &FrameConfig) -> Self {
        Self {
            max_payload: config.effective_max_payload(),
        }
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    pub fn set_max_payload(&mut self, max_payload: usize) {
        self.max_payload = max_payload.min(MAX_FRAME_PAYLOAD);
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(&FrameConfig::default())
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>> {
        decode_frame(src, self.max_payload)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(FrameError::ConnectionClosed),
        }
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, payload: Bytes, dst: &mut BytesMut) -> Result<()> {
        if payload.len() > self.max_payload {
            return Err(FrameError::PayloadTooLarge {
                size: payload.len(),
                max: self.max_payload,
            });
        }
        encode_frame(&payload, dst)
    }
}
