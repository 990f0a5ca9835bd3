//! Block compression codecs.
//!
//! Three variants share one contract: `none` stores payloads verbatim, `lz4`
//! trades ratio for speed, `zstd` trades CPU for ratio at a configurable
//! level. Payloads below the configured threshold bypass compression at the
//! call sites; the codec itself only compresses what it is handed and keeps
//! running totals so the average ratio can be reported.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

/// Codec selection, as it appears in configuration files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecKind {
    None,
    Lz4,
    Zstd,
}

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("compression failed: {0}")]
    Compress(String),

    #[error("decompression failed: {0}")]
    Decompress(String),

    #[error("destination capacity {capacity} too small for {required} bytes")]
    DestinationTooSmall { required: usize, capacity: usize },
}

/// A configured compressor with running ratio statistics.
pub struct Codec {
    kind: CodecKind,
    level: i32,
    threshold: usize,
    total_processed: AtomicU64,
    total_compressed: AtomicU64,
}

impl Codec {
    pub fn new(kind: CodecKind, level: i32, threshold: usize) -> Self {
        Self {
            kind,
            level,
            threshold,
            total_processed: AtomicU64::new(0),
            total_compressed: AtomicU64::new(0),
        }
    }

    pub fn kind(&self) -> CodecKind {
        self.kind
    }

    /// Minimum payload size worth compressing; smaller payloads are stored raw.
    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn is_enabled(&self) -> bool {
        self.kind != CodecKind::None
    }

    /// Worst-case compressed size for a `src_len`-byte input. Destination
    /// buffers sized to this bound never fail on capacity.
    pub fn max_compressed_len(&self, src_len: usize) -> usize {
        match self.kind {
            CodecKind::None => src_len,
            CodecKind::Lz4 => lz4_flex::block::get_maximum_output_size(src_len),
            CodecKind::Zstd => zstd::zstd_safe::compress_bound(src_len),
        }
    }

    /// Compress `src` into `dst`, returning the compressed length.
    ///
    /// A destination shorter than the compressed output is an error, never a
    /// truncation. Counters advance only on success.
    pub fn compress(&self, src: &[u8], dst: &mut [u8]) -> Result<usize, CodecError> {
        let written = match self.kind {
            CodecKind::None => {
                if dst.len() < src.len() {
                    return Err(CodecError::DestinationTooSmall {
                        required: src.len(),
                        capacity: dst.len(),
                    });
                }
                dst[..src.len()].copy_from_slice(src);
                src.len()
            }
            CodecKind::Lz4 => lz4_flex::block::compress_into(src, dst)
                .map_err(|e| CodecError::Compress(e.to_string()))?,
            CodecKind::Zstd => zstd::bulk::compress_to_buffer(src, dst, self.level)
                .map_err(|e| CodecError::Compress(e.to_string()))?,
        };
        self.total_processed
            .fetch_add(src.len() as u64, Ordering::Relaxed);
        self.total_compressed
            .fetch_add(written as u64, Ordering::Relaxed);
        Ok(written)
    }

    /// Decompress `src` into `dst`, returning the original length.
    pub fn decompress(&self, src: &[u8], dst: &mut [u8]) -> Result<usize, CodecError> {
        match self.kind {
            CodecKind::None => {
                if dst.len() < src.len() {
                    return Err(CodecError::DestinationTooSmall {
                        required: src.len(),
                        capacity: dst.len(),
                    });
                }
                dst[..src.len()].copy_from_slice(src);
                Ok(src.len())
            }
            CodecKind::Lz4 => lz4_flex::block::decompress_into(src, dst)
                .map_err(|e| CodecError::Decompress(e.to_string())),
            CodecKind::Zstd => zstd::bulk::decompress_to_buffer(src, dst)
                .map_err(|e| CodecError::Decompress(e.to_string())),
        }
    }

    /// Average compression ratio (`processed / compressed`), 1.0 before any
    /// payload has been processed.
    pub fn ratio(&self) -> f64 {
        let compressed = self.total_compressed.load(Ordering::Relaxed);
        if compressed == 0 {
            return 1.0;
        }
        self.total_processed.load(Ordering::Relaxed) as f64 / compressed as f64
    }

    pub fn total_processed(&self) -> u64 {
        self.total_processed.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Codec")
            .field("kind", &self.kind)
            .field("level", &self.level)
            .field("threshold", &self.threshold)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_payload(len: usize) -> Vec<u8> {
        // Compressible: repeating phrase with mild variation.
        let phrase = b"the quick brown fox jumps over the lazy dog ";
        let mut out = Vec::with_capacity(len);
        while out.len() < len {
            out.extend_from_slice(phrase);
        }
        out.truncate(len);
        out
    }

    #[test]
    fn round_trip_at_and_above_threshold() {
        for kind in [CodecKind::Lz4, CodecKind::Zstd] {
            let codec = Codec::new(kind, 3, 100);
            for len in [100usize, 101, 1024, 64 * 1024] {
                let payload = sample_payload(len);
                let mut dst = vec![0u8; codec.max_compressed_len(len)];
                let n = codec.compress(&payload, &mut dst).unwrap();
                assert!(n <= codec.max_compressed_len(len));

                let mut back = vec![0u8; len];
                let m = codec.decompress(&dst[..n], &mut back).unwrap();
                assert_eq!(m, len);
                assert_eq!(back, payload);
            }
        }
    }

    #[test]
    fn incompressible_stays_within_bound() {
        let codec = Codec::new(CodecKind::Lz4, 0, 100);
        let mut payload = vec![0u8; 4096];
        let mut state = 0x9e3779b97f4a7c15u64;
        for b in payload.iter_mut() {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
            *b = (state >> 33) as u8;
        }
        let mut dst = vec![0u8; codec.max_compressed_len(payload.len())];
        let n = codec.compress(&payload, &mut dst).unwrap();
        assert!(n <= codec.max_compressed_len(payload.len()));

        let mut back = vec![0u8; payload.len()];
        codec.decompress(&dst[..n], &mut back).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn short_destination_is_an_error() {
        let codec = Codec::new(CodecKind::Lz4, 0, 100);
        let payload = sample_payload(1024);
        let mut dst = vec![0u8; 4];
        assert!(codec.compress(&payload, &mut dst).is_err());

        let none = Codec::new(CodecKind::None, 0, 100);
        let mut tiny = vec![0u8; 8];
        assert!(matches!(
            none.compress(&payload, &mut tiny),
            Err(CodecError::DestinationTooSmall { .. })
        ));
    }

    #[test]
    fn ratio_starts_at_one_and_improves() {
        let codec = Codec::new(CodecKind::Lz4, 0, 100);
        assert_eq!(codec.ratio(), 1.0);

        let payload = sample_payload(8192);
        let mut dst = vec![0u8; codec.max_compressed_len(payload.len())];
        codec.compress(&payload, &mut dst).unwrap();
        assert!(codec.ratio() > 1.0);
        assert_eq!(codec.total_processed(), 8192);
    }
}
