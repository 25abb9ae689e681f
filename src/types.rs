//! Core identifier types shared by the tree and the node database.
use crate::hash::Hash;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A fixed identifier partitioning unrelated trees stored in the same node
/// database.
#[derive(
    Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Namespace(pub [u8; 32]);

impl Namespace {
    /// Derives a namespace identifier from an arbitrary seed.
    pub fn from_seed(seed: &[u8]) -> Self {
        Namespace(Hash::digest_bytes(seed).0)
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// A root descriptor: the triple uniquely identifying a persisted tree state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Root {
    /// Namespace the root belongs to.
    pub namespace: Namespace,
    /// Version the root was committed in.
    pub version: u64,
    /// Digest of the root node, or [`Hash::EMPTY`] for the empty tree.
    pub hash: Hash,
}

impl Root {
    /// The empty root in the given namespace and version. It is considered to
    /// exist in every node database.
    pub fn empty(namespace: Namespace, version: u64) -> Self {
        Root {
            namespace,
            version,
            hash: Hash::EMPTY,
        }
    }

    /// Whether this descriptor names the empty tree.
    pub fn is_empty(&self) -> bool {
        self.hash.is_empty()
    }
}

impl fmt::Display for Root {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.namespace, self.version, self.hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespace_from_seed() {
        let a = Namespace::from_seed(b"one");
        let b = Namespace::from_seed(b"one");
        let c = Namespace::from_seed(b"two");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_empty_root() {
        let root = Root::empty(Namespace::from_seed(b"ns"), 3);
        assert!(root.is_empty());
        assert_eq!(root.version, 3);

        let mut other = root;
        other.hash = Hash::digest_bytes(b"node");
        assert!(!other.is_empty());
    }
}
