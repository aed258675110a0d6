//! Symmetric encryption of chunk payloads.
//!
//! Plaintext is cut into frames of `frame_size` bytes and every frame is
//! sealed independently with a fresh random 24-byte nonce:
//!
//! ```text
//! frame := u32 BE sealed_len || nonce[24] || ciphertext+tag
//! ```

use crate::config::{EncryptionConfig, EncryptionType};
use crate::utils::errors::{BackupError, Result};
use bytes::{Buf, BufMut};
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::XChaCha20Poly1305;
use crypto_secretbox::XSalsa20Poly1305;

const NONCE_LEN: usize = 24;

/// The process-wide key, loaded once from configuration.
#[derive(Clone)]
pub struct Cipher {
    kind: EncryptionType,
    key: Option<[u8; 32]>,
}

impl std::fmt::Debug for Cipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cipher")
            .field("kind", &self.kind)
            .field("key", &self.key.map(|_| "<redacted>"))
            .finish()
    }
}

impl Cipher {
    pub fn from_config(config: &EncryptionConfig) -> Result<Self> {
        let key = match config.kind {
            EncryptionType::None => config.key_bytes().ok(),
            _ => Some(config.key_bytes()?),
        };
        Ok(Self { kind: config.kind, key })
    }

    pub fn plain() -> Self {
        Self {
            kind: EncryptionType::None,
            key: None,
        }
    }

    /// Encryption applied to new payloads
    pub fn kind(&self) -> EncryptionType {
        self.kind
    }

    pub fn encrypt(&self, plaintext: &[u8], frame_size: usize) -> Result<Vec<u8>> {
        match self.kind {
            EncryptionType::None => Ok(plaintext.to_vec()),
            EncryptionType::Nacl => {
                let cipher = XSalsa20Poly1305::new(crypto_secretbox::Key::from_slice(&self.require_key()?));
                seal_frames(&cipher, plaintext, frame_size)
            }
            EncryptionType::Xchacha20poly1305 => {
                let cipher = XChaCha20Poly1305::new(chacha20poly1305::Key::from_slice(&self.require_key()?));
                seal_frames(&cipher, plaintext, frame_size)
            }
        }
    }

    /// Decrypt a payload sealed with `kind`, which may differ from the
    /// configured type as long as the key is the same.
    pub fn decrypt(&self, kind: EncryptionType, data: &[u8]) -> Result<Vec<u8>> {
        match kind {
            EncryptionType::None => Ok(data.to_vec()),
            EncryptionType::Nacl => {
                let cipher = XSalsa20Poly1305::new(crypto_secretbox::Key::from_slice(&self.require_key()?));
                open_frames(&cipher, data)
            }
            EncryptionType::Xchacha20poly1305 => {
                let cipher = XChaCha20Poly1305::new(chacha20poly1305::Key::from_slice(&self.require_key()?));
                open_frames(&cipher, data)
            }
        }
    }

    fn require_key(&self) -> Result<[u8; 32]> {
        self.key.ok_or_else(|| {
            BackupError::Configuration("data is encrypted but encryption.key is not configured".to_string())
        })
    }
}

fn seal_frames<C: Aead + AeadCore>(cipher: &C, plaintext: &[u8], frame_size: usize) -> Result<Vec<u8>> {
    let frame_size = frame_size.max(1);
    let frames = plaintext.len().div_ceil(frame_size).max(1);
    let mut out = Vec::with_capacity(plaintext.len() + frames * (4 + NONCE_LEN + 16));

    // An empty payload still gets one authenticated frame.
    let mut chunks: Vec<&[u8]> = plaintext.chunks(frame_size).collect();
    if chunks.is_empty() {
        chunks.push(&[]);
    }

    for frame in chunks {
        let nonce = C::generate_nonce(&mut OsRng);
        let sealed = cipher
            .encrypt(&nonce, frame)
            .map_err(|e| BackupError::Codec(format!("encryption failed: {e}")))?;

        out.put_u32(frame_len(sealed.len())?);
        out.put_slice(nonce.as_slice());
        out.put_slice(&sealed);
    }

    Ok(out)
}

/// Length prefix of a frame. The header is 32 bits wide.
fn frame_len(sealed_len: usize) -> Result<u32> {
    NONCE_LEN
        .checked_add(sealed_len)
        .and_then(|len| u32::try_from(len).ok())
        .ok_or_else(|| BackupError::Codec(format!("encrypted frame of {sealed_len} bytes is too large")))
}

fn open_frames<C: Aead + AeadCore>(cipher: &C, mut data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len());

    while data.has_remaining() {
        if data.remaining() < 4 {
            return Err(BackupError::Codec("truncated encrypted frame header".to_string()));
        }
        let len = data.get_u32() as usize;
        if len < NONCE_LEN || data.remaining() < len {
            return Err(BackupError::Codec("truncated encrypted frame".to_string()));
        }

        let (nonce, sealed) = data[..len].split_at(NONCE_LEN);
        let plain = cipher
            .decrypt(aead_nonce::<C>(nonce), sealed)
            .map_err(|_| BackupError::Codec("decryption failed: wrong key or corrupted data".to_string()))?;
        out.extend_from_slice(&plain);
        data.advance(len);
    }

    Ok(out)
}

fn aead_nonce<C: AeadCore>(bytes: &[u8]) -> &chacha20poly1305::aead::Nonce<C> {
    chacha20poly1305::aead::Nonce::<C>::from_slice(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher(kind: EncryptionType) -> Cipher {
        Cipher::from_config(&EncryptionConfig {
            kind,
            key: Some("k".repeat(32)),
            chunk_size: 16,
        })
        .unwrap()
    }

    #[test]
    fn test_round_trip_for_every_type() {
        let data = b"some part file content that spans several frames".to_vec();

        for kind in [EncryptionType::None, EncryptionType::Nacl, EncryptionType::Xchacha20poly1305] {
            let c = cipher(kind);
            let sealed = c.encrypt(&data, 16).unwrap();
            if kind != EncryptionType::None {
                assert_ne!(sealed, data);
            }
            assert_eq!(c.decrypt(kind, &sealed).unwrap(), data, "{kind:?}");
        }
    }

    #[test]
    fn test_empty_payload() {
        let c = cipher(EncryptionType::Nacl);
        let sealed = c.encrypt(&[], 16).unwrap();
        assert!(!sealed.is_empty());
        assert!(c.decrypt(EncryptionType::Nacl, &sealed).unwrap().is_empty());
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = cipher(EncryptionType::Nacl).encrypt(b"secret", 16).unwrap();
        let other = Cipher::from_config(&EncryptionConfig {
            kind: EncryptionType::Nacl,
            key: Some("x".repeat(32)),
            chunk_size: 16,
        })
        .unwrap();

        assert!(other.decrypt(EncryptionType::Nacl, &sealed).is_err());
    }

    #[test]
    fn test_frame_len_is_checked() {
        assert_eq!(frame_len(16).unwrap(), 40);
        assert_eq!(frame_len(u32::MAX as usize - NONCE_LEN).unwrap(), u32::MAX);
        assert!(matches!(frame_len(u32::MAX as usize), Err(BackupError::Codec(_))));
        assert!(frame_len(usize::MAX).is_err());
    }

    #[test]
    fn test_tampered_frame_fails() {
        let c = cipher(EncryptionType::Xchacha20poly1305);
        let mut sealed = c.encrypt(b"payload", 16).unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0xff;

        assert!(c.decrypt(EncryptionType::Xchacha20poly1305, &sealed).is_err());
    }

    #[test]
    fn test_plain_cipher_cannot_open_encrypted_data() {
        let sealed = cipher(EncryptionType::Nacl).encrypt(b"payload", 16).unwrap();
        let err = Cipher::plain().decrypt(EncryptionType::Nacl, &sealed).unwrap_err();
        assert!(matches!(err, BackupError::Configuration(_)));
    }
}
