use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::{ChunkerError, Result};

/// Length in bytes of every digest produced by a supported algorithm
pub const DIGEST_LEN: usize = 32;

/// Identifier of the digest used for block, blockset and blocklist hashes.
///
/// The identifier is persisted in the index configuration, so a database
/// written with one algorithm is never read back with another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    #[default]
    Blake3,
}

impl HashAlgorithm {
    /// Stable name used in configuration files and the database
    pub fn name(&self) -> &'static str {
        match self {
            HashAlgorithm::Blake3 => "blake3",
        }
    }

    /// Digest length in bytes
    pub fn digest_len(&self) -> usize {
        match self {
            HashAlgorithm::Blake3 => DIGEST_LEN,
        }
    }

    /// Hash a complete buffer
    pub fn digest(&self, data: &[u8]) -> BlockHash {
        match self {
            HashAlgorithm::Blake3 => BlockHash::from_blake3(blake3::hash(data)),
        }
    }

    /// Start an incremental hash
    pub fn hasher(&self) -> StreamHasher {
        match self {
            HashAlgorithm::Blake3 => StreamHasher::Blake3(Box::new(blake3::Hasher::new())),
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for HashAlgorithm {
    type Err = ChunkerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "blake3" => Ok(HashAlgorithm::Blake3),
            other => Err(ChunkerError::UnknownAlgorithm(other.to_string())),
        }
    }
}

/// Incremental hasher returned by [`HashAlgorithm::hasher`]
pub enum StreamHasher {
    Blake3(Box<blake3::Hasher>),
}

impl StreamHasher {
    pub fn update(&mut self, data: &[u8]) {
        match self {
            StreamHasher::Blake3(h) => {
                h.update(data);
            }
        }
    }

    pub fn finalize(&self) -> BlockHash {
        match self {
            StreamHasher::Blake3(h) => BlockHash::from_blake3(h.finalize()),
        }
    }
}

/// Fixed-length digest of a block, a blockset or a blocklist page
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockHash([u8; DIGEST_LEN]);

impl BlockHash {
    /// Create from blake3 hash
    pub fn from_blake3(hash: blake3::Hash) -> Self {
        Self(*hash.as_bytes())
    }

    /// Get as bytes
    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    /// Create from bytes
    pub fn from_bytes(bytes: [u8; DIGEST_LEN]) -> Self {
        Self(bytes)
    }

    /// Create from a slice that must be exactly one digest long
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let array: [u8; DIGEST_LEN] = bytes.try_into().map_err(|_| {
            ChunkerError::InvalidHash(format!(
                "expected {} bytes, got {}",
                DIGEST_LEN,
                bytes.len()
            ))
        })?;
        Ok(Self(array))
    }

    /// Convert to hex string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex string
    pub fn from_hex(hex: &str) -> Result<Self> {
        let bytes = hex::decode(hex).map_err(|e| ChunkerError::InvalidHash(e.to_string()))?;
        Self::from_slice(&bytes)
    }

    /// First eight digest bytes as a big-endian integer.
    ///
    /// Digests are uniformly distributed, so the prefix can be reduced
    /// modulo a table size without further mixing.
    pub fn prefix(&self) -> u64 {
        let mut head = [0u8; 8];
        head.copy_from_slice(&self.0[..8]);
        u64::from_be_bytes(head)
    }
}

impl fmt::Debug for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockHash({}...)", &self.to_hex()[..8])
    }
}

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for BlockHash {
    type Err = ChunkerError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

impl Serialize for BlockHash {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for BlockHash {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Lookup prefix for a hex encoded hash.
///
/// Uses up to the first 16 hex digits. Returns `None` for text that is not
/// hex, so callers can fall back to hashing the key themselves.
pub fn prefix_from_hex(hex: &str) -> Option<u64> {
    let head = hex.get(..hex.len().min(16))?;
    if head.is_empty() {
        return None;
    }
    u64::from_str_radix(head, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_roundtrip() {
        let hash = HashAlgorithm::Blake3.digest(b"hello");
        let parsed = BlockHash::from_hex(&hash.to_hex()).unwrap();
        assert_eq!(hash, parsed);
        assert_eq!(hash.to_hex().len(), 64);
    }

    #[test]
    fn test_invalid_hex_length() {
        assert!(BlockHash::from_hex("abcd").is_err());
        assert!(BlockHash::from_hex("zz").is_err());
    }

    #[test]
    fn test_prefix_matches_hex_prefix() {
        let hash = HashAlgorithm::Blake3.digest(b"prefix");
        assert_eq!(prefix_from_hex(&hash.to_hex()), Some(hash.prefix()));
    }

    #[test]
    fn test_prefix_from_short_and_bad_hex() {
        assert_eq!(prefix_from_hex("AA"), Some(0xAA));
        assert_eq!(prefix_from_hex(""), None);
        assert_eq!(prefix_from_hex("not-hex"), None);
    }

    #[test]
    fn test_streaming_matches_oneshot() {
        let mut hasher = HashAlgorithm::Blake3.hasher();
        hasher.update(b"hel");
        hasher.update(b"lo");
        assert_eq!(hasher.finalize(), HashAlgorithm::Blake3.digest(b"hello"));
    }

    #[test]
    fn test_algorithm_names() {
        assert_eq!("BLAKE3".parse::<HashAlgorithm>().unwrap(), HashAlgorithm::Blake3);
        assert!("md5".parse::<HashAlgorithm>().is_err());
        assert_eq!(HashAlgorithm::Blake3.to_string(), "blake3");
    }
}
