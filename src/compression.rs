//! LZ4 compression for revision payloads and attachments
//!
//! Every blob the store writes goes through the [`CompressionEngine`]. The
//! stored form carries a 4-byte header:
//!
//! - `LZ4V`: an LZ4 block with prepended size follows
//! - `\0\0\0\0`: the original bytes follow unchanged
//!
//! Small blobs, and blobs that LZ4 does not shrink, are stored raw.
//!
//! ```rust
//! use verso::compression::{CompressionEngine, CompressionStrategy};
//!
//! let mut engine = CompressionEngine::new(CompressionStrategy::Fast);
//! let data = b"item graph payload ".repeat(200);
//! let stored = engine.compress(&data).unwrap();
//! assert!(stored.len() < data.len());
//! assert_eq!(engine.decompress(&stored).unwrap(), data);
//! ```

use crate::error::{Result, VersoError};
use lz4_flex::{compress_prepend_size, decompress_size_prepended};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;
use tracing::trace;

/// When blobs are compressed
///
/// Persisted in the store configuration as `"none"`, `"fast"` or
/// `{"adaptive": {"min_size": N}}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionStrategy {
    /// Store everything raw
    None,
    /// Compress blobs of at least 1KB (default)
    #[default]
    Fast,
    /// Compress blobs of at least `min_size` bytes
    Adaptive {
        /// Skip compression below this size
        min_size: usize,
    },
}

impl CompressionStrategy {
    /// Short strategy name
    pub fn name(&self) -> &'static str {
        match self {
            CompressionStrategy::None => "none",
            CompressionStrategy::Fast => "fast",
            CompressionStrategy::Adaptive { .. } => "adaptive",
        }
    }

    fn should_compress(&self, size: usize) -> bool {
        match self {
            CompressionStrategy::None => false,
            CompressionStrategy::Fast => size >= 1024,
            CompressionStrategy::Adaptive { min_size } => size >= *min_size,
        }
    }
}

impl fmt::Display for CompressionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompressionStrategy::Adaptive { min_size } => write!(f, "adaptive (>= {} bytes)", min_size),
            other => f.write_str(other.name()),
        }
    }
}

/// Compression statistics for monitoring
#[derive(Debug, Default, Clone)]
pub struct CompressionStats {
    /// Blobs stored compressed
    pub blobs_compressed: usize,
    /// Blobs stored raw
    pub blobs_stored_raw: usize,
    /// Total bytes saved by compression
    pub bytes_saved: usize,
    /// Total compression time in milliseconds
    pub compression_time_ms: u64,
    /// Total decompression time in milliseconds
    pub decompression_time_ms: u64,
}

impl CompressionStats {
    /// Fraction of blobs that were stored compressed
    pub fn compression_ratio(&self) -> f64 {
        let total = self.blobs_compressed + self.blobs_stored_raw;
        if total == 0 {
            return 0.0;
        }
        self.blobs_compressed as f64 / total as f64
    }
}

/// Compression engine applying a [`CompressionStrategy`]
///
/// Not thread-safe; the store keeps it behind a mutex.
#[derive(Debug)]
pub struct CompressionEngine {
    strategy: CompressionStrategy,
    stats: CompressionStats,
}

const LZ4_MAGIC: &[u8; 4] = b"LZ4V";
const RAW_MAGIC: &[u8; 4] = &[0, 0, 0, 0];

impl CompressionEngine {
    /// Create a new compression engine with the specified strategy
    pub fn new(strategy: CompressionStrategy) -> Self {
        Self {
            strategy,
            stats: CompressionStats::default(),
        }
    }

    /// The configured strategy
    pub fn strategy(&self) -> &CompressionStrategy {
        &self.strategy
    }

    /// Get current compression statistics
    pub fn stats(&self) -> &CompressionStats {
        &self.stats
    }

    /// Encode `content` for storage
    pub fn compress(&mut self, content: &[u8]) -> Result<Vec<u8>> {
        let start = Instant::now();

        if !self.strategy.should_compress(content.len()) {
            return Ok(self.store_raw(content));
        }

        let compressed = compress_prepend_size(content);
        if compressed.len() >= content.len() {
            trace!("Compression not beneficial for {} byte blob, storing raw", content.len());
            return Ok(self.store_raw(content));
        }

        self.stats.bytes_saved += content.len() - compressed.len();
        self.stats.blobs_compressed += 1;
        self.stats.compression_time_ms += start.elapsed().as_millis() as u64;
        trace!("Compressed blob: {} -> {} bytes", content.len(), compressed.len());

        let mut result = Vec::with_capacity(LZ4_MAGIC.len() + compressed.len());
        result.extend_from_slice(LZ4_MAGIC);
        result.extend_from_slice(&compressed);
        Ok(result)
    }

    /// Decode a blob produced by [`CompressionEngine::compress`]
    pub fn decompress(&mut self, content: &[u8]) -> Result<Vec<u8>> {
        let start = Instant::now();

        if content.len() < 4 {
            return Err(VersoError::decompression("Content too short"));
        }

        let (magic, body) = content.split_at(4);
        if magic == LZ4_MAGIC {
            let decompressed = decompress_size_prepended(body)
                .map_err(|e| VersoError::decompression(format!("LZ4 decompression failed: {}", e)))?;
            self.stats.decompression_time_ms += start.elapsed().as_millis() as u64;
            Ok(decompressed)
        } else if magic == RAW_MAGIC {
            Ok(body.to_vec())
        } else {
            Err(VersoError::decompression(format!(
                "unknown blob header {:02x?}",
                magic
            )))
        }
    }

    fn store_raw(&mut self, content: &[u8]) -> Vec<u8> {
        self.stats.blobs_stored_raw += 1;
        let mut result = Vec::with_capacity(RAW_MAGIC.len() + content.len());
        result.extend_from_slice(RAW_MAGIC);
        result.extend_from_slice(content);
        result
    }
}
