//! zstd compression of chunk payloads.

use crate::config::CompressionType;
use crate::utils::errors::{BackupError, Result};

pub fn compress(kind: CompressionType, level: i32, data: &[u8]) -> Result<Vec<u8>> {
    match kind {
        CompressionType::None => Ok(data.to_vec()),
        CompressionType::Zstd => zstd::encode_all(data, level)
            .map_err(|e| BackupError::Codec(format!("zstd compression failed: {e}"))),
    }
}

pub fn decompress(kind: CompressionType, data: &[u8]) -> Result<Vec<u8>> {
    match kind {
        CompressionType::None => Ok(data.to_vec()),
        CompressionType::Zstd => zstd::decode_all(data)
            .map_err(|e| BackupError::Codec(format!("zstd decompression failed: {e}"))),
    }
}
