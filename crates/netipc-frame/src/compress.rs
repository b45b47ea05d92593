//! Per-frame payload compression.

use std::io::{Read, Write};

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;

use crate::error::{FrameError, Result};

/// Compresses a whole frame payload at a time.
///
/// Implementations must be stateless across frames: each payload is an
/// independent stream, so enabling compression mid-connection is safe.
pub trait Compressor: Send + Sync {
    /// Short name for diagnostics.
    fn name(&self) -> &'static str;

    fn compress(&self, input: &[u8]) -> Result<Vec<u8>>;

    fn decompress(&self, input: &[u8]) -> Result<Vec<u8>>;
}

/// Raw deflate (no zlib or gzip header).
#[derive(Debug, Clone)]
pub struct DeflateCompressor {
    level: Compression,
    max_output: usize,
}

impl DeflateCompressor {
    /// `max_output` bounds the size of a decompressed payload.
    pub fn new(max_output: usize) -> Self {
        Self {
            level: Compression::fast(),
            max_output,
        }
    }

    pub fn with_level(mut self, level: u32) -> Self {
        self.level = Compression::new(level.min(9));
        self
    }
}

impl Default for DeflateCompressor {
    fn default() -> Self {
        Self::new(crate::codec::DEFAULT_MAX_PAYLOAD)
    }
}

impl Compressor for DeflateCompressor {
    fn name(&self) -> &'static str {
        "deflate-raw"
    }

    fn compress(&self, input: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = DeflateEncoder::new(Vec::with_capacity(input.len() / 2), self.level);
        encoder
            .write_all(input)
            .map_err(|e| FrameError::Compression(e.to_string()))?;
        encoder
            .finish()
            .map_err(|e| FrameError::Compression(e.to_string()))
    }

    fn decompress(&self, input: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(input.len() * 2);
        let limit = self.max_output as u64 + 1;
        DeflateDecoder::new(input)
            .take(limit)
            .read_to_end(&mut out)
            .map_err(|e| FrameError::Compression(e.to_string()))?;
        if out.len() > self.max_output {
            return Err(FrameError::PayloadTooLarge {
                size: out.len(),
                max: self.max_output,
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_shrinks_repetitive_input() {
        let c = DeflateCompressor::default();
        let input = b"abcabcabc".repeat(1000);
        let packed = c.compress(&input).unwrap();
        assert!(packed.len() < input.len() / 10);
        assert_eq!(c.decompress(&packed).unwrap(), input);
    }

    #[test]
    fn frames_are_independent() {
        let c = DeflateCompressor::default();
        let a = c.compress(b"first payload").unwrap();
        let b = c.compress(b"second payload").unwrap();
        // Decoding out of order works because no state is shared.
        assert_eq!(c.decompress(&b).unwrap(), b"second payload");
        assert_eq!(c.decompress(&a).unwrap(), b"first payload");
    }

    #[test]
    fn decompression_is_bounded() {
        let c = DeflateCompressor::new(1024).with_level(9);
        let packed = c.compress(&vec![0u8; 4096]).unwrap();
        let err = c.decompress(&packed).unwrap_err();
        assert!(matches!(err, FrameError::PayloadTooLarge { max: 1024, .. }));
    }

    #[test]
    fn corrupt_input_is_an_error() {
        let c = DeflateCompressor::default();
        assert!(matches!(
            c.decompress(&[0xff, 0xff, 0xff, 0xff]),
            Err(FrameError::Compression(_))
        ));
    }
}
