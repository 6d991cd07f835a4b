//! Optional zstd compression for stored frame payloads.

use thiserror::Error;

/// Errors raised while compressing or decompressing payloads.
#[derive(Debug, Error)]
pub enum CompressError {
    #[error("invalid compression level {0}, expected 1..=21")]
    InvalidLevel(i32),

    #[error("compression failed: {0}")]
    Compress(String),

    #[error("decompression failed: {0}")]
    Decompress(String),
}

/// Zstd compressor with a fixed level.
#[derive(Debug, Clone)]
pub struct Compressor {
    level: i32,
}

impl Compressor {
    pub fn new(level: i32) -> Result<Self, CompressError> {
        if !(1..=21).contains(&level) {
            return Err(CompressError::InvalidLevel(level));
        }
        Ok(Self { level })
    }

    pub fn level(&self) -> i32 {
        self.level
    }

    pub fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CompressError> {
        zstd::bulk::compress(data, self.level).map_err(|e| CompressError::Compress(e.to_string()))
    }
}

/// Decompress a zstd payload of unknown uncompressed size.
pub fn decompress(data: &[u8]) -> Result<Vec<u8>, CompressError> {
    zstd::stream::decode_all(data).map_err(|e| CompressError::Decompress(e.to_string()))
}
