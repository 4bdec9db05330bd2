//! Payload compression for client-facing traffic.
//!
//! A payload is compressed only when it is longer than the threshold and
//! the compressed form is actually shorter; the header's compressed flag
//! tells the receiver which form arrived.

use crate::core::frame::MAX_PAYLOAD_LEN;
use crate::core::UID_LEN;
use crate::error::{GatewayError, Result};
use serde::{Deserialize, Serialize};
use std::io::Read;

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionKind {
    #[default]
    Lz4,
    Zstd,
}

/// Payloads at or below this size go out uncompressed
pub const COMPRESSION_THRESHOLD: usize = 64;

/// Decompressed client payloads are re-sent with a uid prefix, so they must
/// leave room for it inside one frame.
pub const MAX_DECOMPRESSION_SIZE: usize = MAX_PAYLOAD_LEN - UID_LEN;

const ZSTD_LEVEL: i32 = 1;

/// Compresses data using the specified compression algorithm
///
/// # Errors
/// Returns `GatewayError::CompressionFailure` if compression fails
pub fn compress(data: &[u8], kind: CompressionKind) -> Result<Vec<u8>> {
    match kind {
        CompressionKind::Lz4 => Ok(lz4_flex::compress_prepend_size(data)),
        CompressionKind::Zstd => {
            let mut out = Vec::new();
            zstd::stream::copy_encode(data, &mut out, ZSTD_LEVEL)
                .map_err(|_| GatewayError::CompressionFailure)?;
            Ok(out)
        }
    }
}

/// Decompresses data, refusing output larger than `MAX_DECOMPRESSION_SIZE`.
///
/// # Errors
/// Returns `GatewayError::DecompressionFailure` on corrupt input or when
/// the output would exceed the limit.
pub fn decompress(data: &[u8], kind: CompressionKind) -> Result<Vec<u8>> {
    match kind {
        CompressionKind::Lz4 => {
            // lz4_flex prepends the decompressed size as u32 little-endian;
            // check it before the decoder allocates.
            if data.len() < 4 {
                return Err(GatewayError::DecompressionFailure);
            }
            let claimed_size = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
            if claimed_size > MAX_DECOMPRESSION_SIZE {
                return Err(GatewayError::DecompressionFailure);
            }

            let decompressed = lz4_flex::decompress_size_prepended(data)
                .map_err(|_| GatewayError::DecompressionFailure)?;
            if decompressed.len() > MAX_DECOMPRESSION_SIZE {
                return Err(GatewayError::DecompressionFailure);
            }
            Ok(decompressed)
        }
        CompressionKind::Zstd => {
            let mut reader = zstd::stream::Decoder::new(data)
                .map_err(|_| GatewayError::DecompressionFailure)?;
            let mut out = Vec::new();
            let mut buffer = [0u8; 8192];
            loop {
                match reader.read(&mut buffer) {
                    Ok(0) => break,
                    Ok(n) => {
                        out.extend_from_slice(&buffer[..n]);
                        if out.len() > MAX_DECOMPRESSION_SIZE {
                            return Err(GatewayError::DecompressionFailure);
                        }
                    }
                    Err(_) => return Err(GatewayError::DecompressionFailure),
                }
            }
            Ok(out)
        }
    }
}

/// Compressed form of `data` when it is longer than `threshold` and
/// compression shrinks it; `None` means send it as is.
pub fn maybe_compress(
    data: &[u8],
    kind: CompressionKind,
    threshold: usize,
) -> Result<Option<Vec<u8>>> {
    if data.len() <= threshold {
        return Ok(None);
    }
    let compressed = compress(data, kind)?;
    if compressed.len() < data.len() {
        Ok(Some(compressed))
    } else {
        Ok(None)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn lz4_roundtrip() {
        let original = b"player moved to 10,20; player moved to 10,21; player moved to 10,22";
        let compressed = compress(original, CompressionKind::Lz4).unwrap();
        let decompressed = decompress(&compressed, CompressionKind::Lz4).unwrap();
        assert_eq!(original.as_slice(), decompressed.as_slice());
    }

    #[test]
    fn zstd_roundtrip() {
        let original = vec![7u8; 4096];
        let compressed = compress(&original, CompressionKind::Zstd).unwrap();
        let decompressed = decompress(&compressed, CompressionKind::Zstd).unwrap();
        assert_eq!(original, decompressed);
    }

    #[test]
    fn lz4_claimed_size_over_limit_is_refused() {
        // 0xbbbb602b claimed bytes
        let malicious_payload = vec![0x2b, 0x60, 0xbb, 0xbb];
        assert!(decompress(&malicious_payload, CompressionKind::Lz4).is_err());

        let claimed_size = (MAX_DECOMPRESSION_SIZE + 1) as u32;
        let mut malicious = claimed_size.to_le_bytes().to_vec();
        malicious.extend_from_slice(&[0u8; 16]);
        assert!(decompress(&malicious, CompressionKind::Lz4).is_err());
    }

    #[test]
    fn lz4_short_or_corrupt_input_is_refused() {
        assert!(decompress(&[0x2b, 0x60], CompressionKind::Lz4).is_err());
        let malformed = vec![0x10, 0x00, 0x00, 0x00, 0xff, 0xff, 0xff];
        assert!(decompress(&malformed, CompressionKind::Lz4).is_err());
    }

    #[test]
    fn zstd_bomb_is_cut_off() {
        let huge = vec![0u8; MAX_DECOMPRESSION_SIZE * 4];
        let compressed = compress(&huge, CompressionKind::Zstd).unwrap();
        assert!(decompress(&compressed, CompressionKind::Zstd).is_err());
    }

    #[test]
    fn threshold_is_exclusive() {
        let data = vec![0u8; COMPRESSION_THRESHOLD];
        assert!(maybe_compress(&data, CompressionKind::Lz4, COMPRESSION_THRESHOLD)
            .unwrap()
            .is_none());

        let data = vec![0u8; COMPRESSION_THRESHOLD + 1];
        let out = maybe_compress(&data, CompressionKind::Lz4, COMPRESSION_THRESHOLD)
            .unwrap()
            .unwrap();
        assert!(out.len() < data.len());
    }

    #[test]
    fn incompressible_payload_is_left_alone() {
        let mut state = 0x1234_5678u32;
        let data: Vec<u8> = (0..512)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                state as u8
            })
            .collect();
        assert!(maybe_compress(&data, CompressionKind::Lz4, COMPRESSION_THRESHOLD)
            .unwrap()
            .is_none());
    }
}
