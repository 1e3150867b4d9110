//! Block digests for content-addressed transfer

use std::fmt;

use md5::{Digest as _, Md5};

/// Fixed block size used for file hashing and chunk transfer (4 MiB).
///
/// Both sides of the wire derive block boundaries from this constant, so it
/// cannot be changed without a protocol rev.
pub const BLOCK_SIZE: usize = 4 * 1024 * 1024;

/// A 16-byte MD5 digest of one file block.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockHash([u8; 16]);

impl BlockHash {
    /// Hash arbitrary bytes
    #[must_use]
    pub fn of(data: &[u8]) -> Self {
        Self(Md5::digest(data).into())
    }

    /// Construct from raw digest bytes (e.g. decoded from the wire)
    #[must_use]
    pub fn from_raw(raw: [u8; 16]) -> Self {
        Self(raw)
    }

    /// Get raw bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Convert to hex string
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.to_hex();
        write!(f, "BlockHash({})", hex.get(..8).unwrap_or(&hex))
    }
}

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_deterministic() {
        let h1 = BlockHash::of(b"hello world");
        let h2 = BlockHash::of(b"hello world");
        assert_eq!(h1, h2);
    }

    #[test]
    fn test_hash_different_data() {
        assert_ne!(BlockHash::of(b"hello"), BlockHash::of(b"world"));
    }

    #[test]
    fn test_known_md5() {
        // md5("x") = 9dd4e461268c8034f5c8564e155c67a6
        assert_eq!(BlockHash::of(b"x").to_hex(), "9dd4e461268c8034f5c8564e155c67a6");
    }

    #[test]
    fn test_raw_roundtrip() {
        let h = BlockHash::of(b"abc");
        assert_eq!(BlockHash::from_raw(*h.as_bytes()), h);
    }
}
