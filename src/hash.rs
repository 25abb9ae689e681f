//! Fixed-width cryptographic digests over canonical node encodings.
use derive_more::Deref;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512_256};
use std::fmt;

/// A 32-byte SHA-512/256 digest.
///
/// The all-zero digest is reserved as the sentinel for "no tree" and never
/// occurs as the digest of an actual node encoding.
#[derive(
    Clone, Copy, Deref, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Hash(pub [u8; Hash::SIZE]);

impl Hash {
    /// Digest size in bytes.
    pub const SIZE: usize = 32;

    /// The sentinel digest of the empty tree.
    pub const EMPTY: Hash = Hash([0u8; Hash::SIZE]);

    /// Hashes a single byte string.
    pub fn digest_bytes(data: &[u8]) -> Self {
        Self::digest_bytes_list(&[data])
    }

    /// Hashes the concatenation of the given byte strings.
    pub fn digest_bytes_list(parts: &[&[u8]]) -> Self {
        let mut hasher = Sha512_256::new();
        for part in parts {
            hasher.update(part);
        }
        Hash(hasher.finalize().into())
    }

    /// Whether this is the empty-tree sentinel.
    pub fn is_empty(&self) -> bool {
        *self == Self::EMPTY
    }

    /// Decodes a digest from exactly [`Hash::SIZE`] bytes.
    pub fn from_slice(data: &[u8]) -> Option<Self> {
        let bytes: [u8; Hash::SIZE] = data.try_into().ok()?;
        Some(Hash(bytes))
    }
}

impl From<[u8; Hash::SIZE]> for Hash {
    fn from(bytes: [u8; Hash::SIZE]) -> Self {
        Hash(bytes)
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
