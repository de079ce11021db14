//! Passive Payload Compression
//!
//! Payloads written to a passive store start with a one-byte algorithm tag
//! followed by the (possibly compressed) serialized entry. Readers accept
//! every tag regardless of the local configuration, and also accept untagged
//! JSON written by other producers.

use crate::error::{Error, Result};
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;

/// First byte of an untagged JSON entry (`{`)
const UNTAGGED_JSON: u8 = b'{';

// =============================================================================
// Algorithm
// =============================================================================

/// Compression algorithm identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    None,
    #[default]
    Lz4,
    Zstd,
    Snappy,
}

impl CompressionAlgorithm {
    /// Tag byte written ahead of the payload
    pub fn tag(self) -> u8 {
        match self {
            CompressionAlgorithm::None => 0,
            CompressionAlgorithm::Lz4 => 1,
            CompressionAlgorithm::Zstd => 2,
            CompressionAlgorithm::Snappy => 3,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(CompressionAlgorithm::None),
            1 => Some(CompressionAlgorithm::Lz4),
            2 => Some(CompressionAlgorithm::Zstd),
            3 => Some(CompressionAlgorithm::Snappy),
            _ => None,
        }
    }

    fn compress(self, data: &[u8], level: i32) -> Result<Vec<u8>> {
        match self {
            CompressionAlgorithm::None => Ok(data.to_vec()),
            CompressionAlgorithm::Lz4 => lz4::block::compress(
                data,
                Some(lz4::block::CompressionMode::HIGHCOMPRESSION(level)),
                true,
            )
            .map_err(|e| Error::Compression(format!("lz4: {}", e))),
            CompressionAlgorithm::Zstd => {
                zstd::encode_all(data, level).map_err(|e| Error::Compression(format!("zstd: {}", e)))
            }
            CompressionAlgorithm::Snappy => snap::raw::Encoder::new()
                .compress_vec(data)
                .map_err(|e| Error::Compression(format!("snappy: {}", e))),
        }
    }

    fn decompress(self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            CompressionAlgorithm::None => Ok(data.to_vec()),
            CompressionAlgorithm::Lz4 => lz4::block::decompress(data, None)
                .map_err(|e| Error::Compression(format!("lz4: {}", e))),
            CompressionAlgorithm::Zstd => {
                zstd::decode_all(data).map_err(|e| Error::Compression(format!("zstd: {}", e)))
            }
            CompressionAlgorithm::Snappy => snap::raw::Decoder::new()
                .decompress_vec(data)
                .map_err(|e| Error::Compression(format!("snappy: {}", e))),
        }
    }
}

impl fmt::Display for CompressionAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompressionAlgorithm::None => write!(f, "none"),
            CompressionAlgorithm::Lz4 => write!(f, "lz4"),
            CompressionAlgorithm::Zstd => write!(f, "zstd"),
            CompressionAlgorithm::Snappy => write!(f, "snappy"),
        }
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Compression applied to passive payloads
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    /// Algorithm used for payloads above the threshold
    pub algorithm: CompressionAlgorithm,
    /// Payloads smaller than this are stored uncompressed
    pub min_size_bytes: usize,
    /// Algorithm-specific level
    pub level: i32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            algorithm: CompressionAlgorithm::Lz4,
            min_size_bytes: 1024, // 1KB
            level: 3,
        }
    }
}

// =============================================================================
// Payload Codec
// =============================================================================

/// Encodes and decodes tagged passive payloads
#[derive(Debug, Clone, Default)]
pub struct PayloadCodec {
    config: CompressionConfig,
}

impl PayloadCodec {
    pub fn new(config: CompressionConfig) -> Self {
        Self { config }
    }

    /// Tag and, above the threshold, compress a serialized entry
    ///
    /// Compression failures and non-shrinking output fall back to storing the
    /// entry uncompressed.
    pub fn encode(&self, entry: &[u8]) -> Bytes {
        let algorithm = if entry.len() < self.config.min_size_bytes {
            CompressionAlgorithm::None
        } else {
            self.config.algorithm
        };

        let (algorithm, body) = match algorithm.compress(entry, self.config.level) {
            Ok(compressed) if compressed.len() < entry.len() => (algorithm, compressed),
            Ok(_) => (CompressionAlgorithm::None, entry.to_vec()),
            Err(e) => {
                tracing::warn!(algorithm = %algorithm, error = %e, "Compression failed, storing uncompressed");
                (CompressionAlgorithm::None, entry.to_vec())
            }
        };

        let mut out = BytesMut::with_capacity(body.len() + 1);
        out.put_u8(algorithm.tag());
        out.put_slice(&body);
        out.freeze()
    }

    /// Recover the serialized entry from a stored payload
    pub fn decode(&self, stored: &[u8]) -> Result<Bytes> {
        let (&tag, body) = stored
            .split_first()
            .ok_or_else(|| Error::Compression("empty payload".into()))?;

        if tag == UNTAGGED_JSON {
            return Ok(Bytes::copy_from_slice(stored));
        }

        let algorithm = CompressionAlgorithm::from_tag(tag)
            .ok_or_else(|| Error::Compression(format!("unknown payload tag {}", tag)))?;
        match algorithm {
            CompressionAlgorithm::None => Ok(Bytes::copy_from_slice(body)),
            other => Ok(Bytes::from(other.decompress(body)?)),
        }
    }

    pub fn config(&self) -> &CompressionConfig {
        &self.config
    }
}
