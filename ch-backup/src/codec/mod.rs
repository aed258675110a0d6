//! Object envelope applied to every stored chunk.
//!
//! ```text
//! magic "CHB" || version u8 || compression u8 || encryption u8 || body
//! ```
//!
//! The header lets a chunk written under one configuration be read back under
//! another, which matters because deduplicated chunks outlive the settings
//! they were uploaded with.

pub mod compression;
pub mod encryption;

use crate::config::{CompressionType, Config, EncryptionType};
use crate::utils::errors::{BackupError, Result};
use encryption::Cipher;

const MAGIC: &[u8; 3] = b"CHB";
const VERSION: u8 = 1;
const HEADER_LEN: usize = 6;

/// Compression + encryption pipeline for chunk payloads.
#[derive(Debug, Clone)]
pub struct Codec {
    compression: CompressionType,
    level: i32,
    cipher: Cipher,
    frame_size: usize,
}

impl Codec {
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            compression: config.compression.kind,
            level: config.compression.level,
            cipher: Cipher::from_config(&config.encryption)?,
            frame_size: config.encryption.chunk_size,
        })
    }

    pub fn new(compression: CompressionType, level: i32, cipher: Cipher, frame_size: usize) -> Self {
        Self {
            compression,
            level,
            cipher,
            frame_size,
        }
    }

    pub fn encryption(&self) -> EncryptionType {
        self.cipher.kind()
    }

    pub fn compression(&self) -> CompressionType {
        self.compression
    }

    /// Compress, then encrypt, then prepend the header.
    pub fn encode(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let packed = compression::compress(self.compression, self.level, plaintext)?;
        let body = self.cipher.encrypt(&packed, self.frame_size)?;

        let mut out = Vec::with_capacity(HEADER_LEN + body.len());
        out.extend_from_slice(MAGIC);
        out.push(VERSION);
        out.push(compression_code(self.compression));
        out.push(encryption_code(self.cipher.kind()));
        out.extend_from_slice(&body);
        Ok(out)
    }

    pub fn decode(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < HEADER_LEN || &data[..3] != MAGIC {
            return Err(BackupError::Codec("missing chunk header".to_string()));
        }
        if data[3] != VERSION {
            return Err(BackupError::Codec(format!("unsupported chunk version {}", data[3])));
        }

        let compression = compression_from_code(data[4])?;
        let encryption = encryption_from_code(data[5])?;

        let packed = self.cipher.decrypt(encryption, &data[HEADER_LEN..])?;
        compression::decompress(compression, &packed)
    }
}

fn compression_code(kind: CompressionType) -> u8 {
    match kind {
        CompressionType::None => 0,
        CompressionType::Zstd => 1,
    }
}

fn compression_from_code(code: u8) -> Result<CompressionType> {
    match code {
        0 => Ok(CompressionType::None),
        1 => Ok(CompressionType::Zstd),
        other => Err(BackupError::Codec(format!("unknown compression code {other}"))),
    }
}

fn encryption_code(kind: EncryptionType) -> u8 {
    match kind {
        EncryptionType::None => 0,
        EncryptionType::Nacl => 1,
        EncryptionType::Xchacha20poly1305 => 2,
    }
}

fn encryption_from_code(code: u8) -> Result<EncryptionType> {
    match code {
        0 => Ok(EncryptionType::None),
        1 => Ok(EncryptionType::Nacl),
        2 => Ok(EncryptionType::Xchacha20poly1305),
        other => Err(BackupError::Codec(format!("unknown encryption code {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EncryptionConfig;

    fn codec(compression: CompressionType, encryption: EncryptionType) -> Codec {
        let cipher = Cipher::from_config(&EncryptionConfig {
            kind: encryption,
            key: Some("0123456789abcdef0123456789abcdef".to_string()),
            chunk_size: 1024,
        })
        .unwrap();
        Codec::new(compression, 3, cipher, 1024)
    }

    #[test]
    fn test_header_records_settings() {
        let encoded = codec(CompressionType::Zstd, EncryptionType::Xchacha20poly1305)
            .encode(b"data")
            .unwrap();

        assert_eq!(&encoded[..3], b"CHB");
        assert_eq!(encoded[4], 1);
        assert_eq!(encoded[5], 2);
    }

    #[test]
    fn test_chunk_readable_after_settings_change() {
        let data = b"merge tree column data".repeat(100);
        let old = codec(CompressionType::None, EncryptionType::Nacl).encode(&data).unwrap();

        let new = codec(CompressionType::Zstd, EncryptionType::Xchacha20poly1305);
        assert_eq!(new.decode(&old).unwrap(), data);
    }

    #[test]
    fn test_rejects_foreign_objects() {
        let c = codec(CompressionType::Zstd, EncryptionType::None);
        assert!(c.decode(b"{\"json\": true}").is_err());
        assert!(c.decode(b"CH").is_err());
    }
}
