//! Content-addressed chunk identity.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// SHA-256 of a chunk's plaintext, lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChunkId(String);

impl ChunkId {
    pub fn of(data: &[u8]) -> Self {
        Self(hex::encode(Sha256::digest(data)))
    }

    /// Accepts only well-formed ids.
    pub fn parse(value: &str) -> Option<Self> {
        let valid = value.len() == 64 && value.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
        valid.then(|| Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Two-character fan-out directory
    pub fn shard(&self) -> &str {
        &self.0[..2]
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_content_same_id() {
        assert_eq!(ChunkId::of(b"part data"), ChunkId::of(b"part data"));
        assert_ne!(ChunkId::of(b"part data"), ChunkId::of(b"part datb"));
    }

    #[test]
    fn test_known_digest() {
        let id = ChunkId::of(b"");
        assert_eq!(id.as_str(), "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855");
        assert_eq!(id.shard(), "e3");
    }

    #[test]
    fn test_parse() {
        let id = ChunkId::of(b"x");
        assert_eq!(ChunkId::parse(id.as_str()), Some(id));
        assert_eq!(ChunkId::parse("xyz"), None);
        assert_eq!(ChunkId::parse(&"A".repeat(64)), None);
    }
}
