//! The node model of the tree and its canonical binary encoding.
//!
//! Nodes come in two shapes. An *internal* node carries a prefix-compressed
//! label (a bit string), two child pointers, and an optional inline leaf for
//! the key that ends exactly at the node's position. A *leaf* node carries a
//! full key and its value. Child pointers are in one of three states:
//! resolved (the node is in memory), unresolved (only the digest is known and
//! the node must be fetched from storage or a remote syncer), or absent.
//!
//! Every node has exactly one canonical encoding, and its digest is the
//! SHA-512/256 of that encoding. Internal nodes embed their inline leaf by
//! value and their children by digest; a *compact* variant used inside proofs
//! omits the child digests, which the proof carries structurally instead.
use crate::{
    bits::{Depth, Key, Value},
    constant::{NODE_PREFIX_INTERNAL, NODE_PREFIX_LEAF, NODE_PREFIX_NIL},
    error::Error,
    hash::Hash,
};
use std::{cell::RefCell, rc::Rc};

/// Shared handle to a node.
pub type NodeRef = Rc<RefCell<NodeBox>>;

/// Shared handle to a node pointer.
pub type NodePtrRef = Rc<RefCell<NodePointer>>;

/// A child reference: a digest plus, when resolved, the node itself.
#[derive(Debug, Default)]
pub struct NodePointer {
    /// Whether the pointed-to node is unchanged since the last commit. Dirty
    /// pointers carry an invalid digest until commit recomputes it.
    pub clean: bool,
    /// Digest of the pointed-to node; meaningful only while clean.
    pub hash: Hash,
    /// The resolved node, if resident in memory.
    pub node: Option<NodeRef>,
    /// Eviction-queue slot assigned by the cache; zero when untracked.
    pub cache_seq: u64,
}

impl NodePointer {
    /// A clean, unresolved pointer carrying only a digest.
    pub fn hash_ptr(hash: Hash) -> NodePtrRef {
        Rc::new(RefCell::new(NodePointer {
            clean: true,
            hash,
            node: None,
            cache_seq: 0,
        }))
    }

    /// A dirty pointer to a freshly created node.
    pub fn dirty_ptr(node: NodeBox) -> NodePtrRef {
        Rc::new(RefCell::new(NodePointer {
            clean: false,
            hash: Hash::EMPTY,
            node: Some(Rc::new(RefCell::new(node))),
            cache_seq: 0,
        }))
    }
}

/// Digest stored in an encoded internal node for the given child slot.
pub fn ptr_hash(ptr: &Option<NodePtrRef>) -> Hash {
    match ptr {
        Some(p) => p.borrow().hash,
        None => Hash::EMPTY,
    }
}

/// A node, polymorphic over the two shapes.
#[derive(Debug)]
pub enum NodeBox {
    /// Internal node with a label and up to two children.
    Internal(InternalNode),
    /// Leaf node holding a key and its value.
    Leaf(LeafNode),
}

impl NodeBox {
    /// Current digest of the node.
    pub fn hash(&self) -> Hash {
        match self {
            NodeBox::Internal(n) => n.hash,
            NodeBox::Leaf(n) => n.hash,
        }
    }

    /// Version the node was (or will be) committed in.
    pub fn version(&self) -> u64 {
        match self {
            NodeBox::Internal(n) => n.version,
            NodeBox::Leaf(n) => n.version,
        }
    }

    /// Whether the node is unchanged since its last commit.
    pub fn is_clean(&self) -> bool {
        match self {
            NodeBox::Internal(n) => n.clean,
            NodeBox::Leaf(n) => n.clean,
        }
    }

    /// Whether the node is an internal node.
    pub fn is_internal(&self) -> bool {
        matches!(self, NodeBox::Internal(_))
    }

    /// Recomputes the node's digest from its canonical encoding.
    ///
    /// For internal nodes the child digests must already be current.
    pub fn update_hash(&mut self) -> Result<(), Error> {
        let data = self.marshal_binary()?;
        let hash = Hash::digest_bytes(&data);
        match self {
            NodeBox::Internal(n) => n.hash = hash,
            NodeBox::Leaf(n) => n.hash = hash,
        }
        Ok(())
    }

    /// Canonical encoding, used for persistence and digest computation.
    pub fn marshal_binary(&self) -> Result<Vec<u8>, Error> {
        self.marshal(true)
    }

    /// Compact encoding used inside proofs: internal nodes omit their child
    /// digests. Leaf nodes encode identically in both forms.
    pub fn compact_marshal_binary(&self) -> Result<Vec<u8>, Error> {
        self.marshal(false)
    }

    fn marshal(&self, with_children: bool) -> Result<Vec<u8>, Error> {
        match self {
            NodeBox::Leaf(n) => {
                let value = n.value.as_ref().ok_or_else(|| {
                    Error::MalformedNode("leaf value not resident".to_string())
                })?;
                let mut out = Vec::with_capacity(1 + 8 + 4 + n.key.len() + 4 + value.len());
                out.push(NODE_PREFIX_LEAF);
                out.extend_from_slice(&n.version.to_be_bytes());
                out.extend_from_slice(&(n.key.len() as u32).to_be_bytes());
                out.extend_from_slice(&n.key);
                out.extend_from_slice(&(value.len() as u32).to_be_bytes());
                out.extend_from_slice(value);
                Ok(out)
            }
            NodeBox::Internal(n) => {
                let mut out = Vec::new();
                out.push(NODE_PREFIX_INTERNAL);
                out.extend_from_slice(&n.version.to_be_bytes());
                out.extend_from_slice(&n.label_bit_length.to_be_bytes());
                out.extend_from_slice(&n.label);
                match &n.leaf_node {
                    Some(ptr) => {
                        let leaf = ptr.borrow().node.clone().ok_or_else(|| {
                            Error::MalformedNode("inline leaf not resident".to_string())
                        })?;
                        let encoded = leaf.borrow().marshal_binary()?;
                        out.extend_from_slice(&encoded);
                    }
                    None => out.push(NODE_PREFIX_NIL),
                }
                if with_children {
                    out.extend_from_slice(&ptr_hash(&n.left).0);
                    out.extend_from_slice(&ptr_hash(&n.right).0);
                }
                Ok(out)
            }
        }
    }

    /// Decodes a node from its canonical encoding, returning the node and the
    /// number of bytes consumed.
    pub fn unmarshal_binary(data: &[u8]) -> Result<(NodeBox, usize), Error> {
        Self::unmarshal(data, true)
    }

    /// Decodes a node from its compact proof encoding. Internal nodes come
    /// back with both children unset; the caller attaches them from the
    /// surrounding proof structure.
    pub fn compact_unmarshal_binary(data: &[u8]) -> Result<(NodeBox, usize), Error> {
        Self::unmarshal(data, false)
    }

    fn unmarshal(data: &[u8], with_children: bool) -> Result<(NodeBox, usize), Error> {
        let malformed = |what: &str| Error::MalformedNode(what.to_string());
        match data.first() {
            Some(&NODE_PREFIX_LEAF) => {
                if data.len() < 1 + 8 + 4 {
                    return Err(malformed("leaf header truncated"));
                }
                let version = u64::from_be_bytes(data[1..9].try_into().unwrap());
                let key_len = u32::from_be_bytes(data[9..13].try_into().unwrap()) as usize;
                let mut offset = 13;
                if data.len() < offset + key_len + 4 {
                    return Err(malformed("leaf key truncated"));
                }
                let key = data[offset..offset + key_len].to_vec();
                offset += key_len;
                let value_len =
                    u32::from_be_bytes(data[offset..offset + 4].try_into().unwrap()) as usize;
                offset += 4;
                if data.len() < offset + value_len {
                    return Err(malformed("leaf value truncated"));
                }
                let value = data[offset..offset + value_len].to_vec();
                offset += value_len;

                let mut leaf = LeafNode {
                    clean: true,
                    version,
                    hash: Hash::EMPTY,
                    key,
                    value: Some(value),
                    value_seq: 0,
                };
                leaf.hash = Hash::digest_bytes(&data[..offset]);
                Ok((NodeBox::Leaf(leaf), offset))
            }
            Some(&NODE_PREFIX_INTERNAL) => {
                if data.len() < 1 + 8 + 2 {
                    return Err(malformed("internal header truncated"));
                }
                let version = u64::from_be_bytes(data[1..9].try_into().unwrap());
                let label_bit_length = Depth::from_be_bytes(data[9..11].try_into().unwrap());
                let label_len = (label_bit_length as usize + 7) / 8;
                let mut offset = 11;
                if data.len() < offset + label_len + 1 {
                    return Err(malformed("internal label truncated"));
                }
                let label = data[offset..offset + label_len].to_vec();
                offset += label_len;

                let leaf_node = match data[offset] {
                    NODE_PREFIX_NIL => {
                        offset += 1;
                        None
                    }
                    NODE_PREFIX_LEAF => {
                        let (leaf, consumed) = Self::unmarshal(&data[offset..], true)?;
                        let hash = leaf.hash();
                        offset += consumed;
                        Some(Rc::new(RefCell::new(NodePointer {
                            clean: true,
                            hash,
                            node: Some(Rc::new(RefCell::new(leaf))),
                            cache_seq: 0,
                        })))
                    }
                    _ => return Err(malformed("unexpected inline leaf prefix")),
                };

                let (left, right) = if with_children {
                    if data.len() < offset + 2 * Hash::SIZE {
                        return Err(malformed("internal child hashes truncated"));
                    }
                    let left_hash =
                        Hash::from_slice(&data[offset..offset + Hash::SIZE]).unwrap();
                    offset += Hash::SIZE;
                    let right_hash =
                        Hash::from_slice(&data[offset..offset + Hash::SIZE]).unwrap();
                    offset += Hash::SIZE;
                    let as_ptr = |h: Hash| {
                        if h.is_empty() {
                            None
                        } else {
                            Some(NodePointer::hash_ptr(h))
                        }
                    };
                    (as_ptr(left_hash), as_ptr(right_hash))
                } else {
                    (None, None)
                };

                let mut node = InternalNode {
                    clean: true,
                    version,
                    hash: Hash::EMPTY,
                    label,
                    label_bit_length,
                    leaf_node,
                    left,
                    right,
                };
                if with_children {
                    node.hash = Hash::digest_bytes(&data[..offset]);
                }
                Ok((NodeBox::Internal(node), offset))
            }
            _ => Err(malformed("unknown node prefix")),
        }
    }
}

/// An internal node.
#[derive(Debug)]
pub struct InternalNode {
    /// Whether the node is unchanged since the last commit.
    pub clean: bool,
    /// Version the node was created in.
    pub version: u64,
    /// Digest of the canonical encoding; invalid while dirty.
    pub hash: Hash,
    /// Prefix bits shared by every key in this subtree, beyond the position
    /// of the parent. Non-empty except at the root; the first label bit of a
    /// child is the bit discriminating it from its sibling.
    pub label: Key,
    /// Number of significant bits in `label`.
    pub label_bit_length: Depth,
    /// Leaf for the key that ends exactly at this node's position.
    pub leaf_node: Option<NodePtrRef>,
    /// Subtree of keys whose next bit is zero.
    pub left: Option<NodePtrRef>,
    /// Subtree of keys whose next bit is one.
    pub right: Option<NodePtrRef>,
}

/// A leaf node.
#[derive(Debug)]
pub struct LeafNode {
    /// Whether the node is unchanged since the last commit.
    pub clean: bool,
    /// Version the node was created in.
    pub version: u64,
    /// Digest of the canonical encoding; invalid while dirty.
    pub hash: Hash,
    /// The full key.
    pub key: Key,
    /// The value; `None` only while evicted from the value cache, in which
    /// case it is transparently re-fetched from storage on next access.
    pub value: Option<Value>,
    /// Value-eviction-queue slot assigned by the cache; zero when untracked.
    pub value_seq: u64,
}

impl LeafNode {
    /// A fresh dirty leaf.
    pub fn new(key: Key, value: Value) -> LeafNode {
        LeafNode {
            clean: false,
            version: 0,
            hash: Hash::EMPTY,
            key,
            value: Some(value),
            value_seq: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_leaf(key: &[u8], value: &[u8], version: u64) -> NodeBox {
        let mut leaf = LeafNode::new(key.to_vec(), value.to_vec());
        leaf.version = version;
        let mut node = NodeBox::Leaf(leaf);
        node.update_hash().unwrap();
        node
    }

    #[test]
    fn test_leaf_round_trip() {
        let node = make_leaf(b"some key", b"some value", 7);
        let encoded = node.marshal_binary().unwrap();
        let (decoded, consumed) = NodeBox::unmarshal_binary(&encoded).unwrap();
        assert_eq!(consumed, encoded.len());
        assert_eq!(decoded.hash(), node.hash());
        assert_eq!(decoded.version(), 7);
        match decoded {
            NodeBox::Leaf(leaf) => {
                assert_eq!(leaf.key, b"some key");
                assert_eq!(leaf.value.as_deref(), Some(&b"some value"[..]));
            }
            _ => panic!("expected leaf"),
        }
    }

    #[test]
    fn test_empty_key_and_value_leaf() {
        let node = make_leaf(b"", b"", 0);
        let encoded = node.marshal_binary().unwrap();
        let (decoded, _) = NodeBox::unmarshal_binary(&encoded).unwrap();
        assert_eq!(decoded.hash(), node.hash());
    }

    #[test]
    fn test_internal_round_trip() {
        let inline = make_leaf(b"ab", b"inline", 2);
        let inline_hash = inline.hash();
        let mut node = NodeBox::Internal(InternalNode {
            clean: false,
            version: 2,
            hash: Hash::EMPTY,
            label: vec![0b1010_0000],
            label_bit_length: 4,
            leaf_node: Some(Rc::new(RefCell::new(NodePointer {
                clean: true,
                hash: inline_hash,
                node: Some(Rc::new(RefCell::new(inline))),
                cache_seq: 0,
            }))),
            left: Some(NodePointer::hash_ptr(Hash::digest_bytes(b"left"))),
            right: None,
        });
        node.update_hash().unwrap();

        let encoded = node.marshal_binary().unwrap();
        let (decoded, consumed) = NodeBox::unmarshal_binary(&encoded).unwrap();
        assert_eq!(consumed, encoded.len());
        assert_eq!(decoded.hash(), node.hash());
        match decoded {
            NodeBox::Internal(n) => {
                assert_eq!(n.label, vec![0b1010_0000]);
                assert_eq!(n.label_bit_length, 4);
                assert_eq!(ptr_hash(&n.leaf_node), inline_hash);
                assert_eq!(ptr_hash(&n.left), Hash::digest_bytes(b"left"));
                assert!(n.right.is_none());
            }
            _ => panic!("expected internal node"),
        }
    }

    #[test]
    fn test_digest_depends_on_content() {
        let a = make_leaf(b"key", b"value", 0);
        let b = make_leaf(b"key", b"other", 0);
        let c = make_leaf(b"key", b"value", 1);
        assert_ne!(a.hash(), b.hash());
        // The version participates in the digest.
        assert_ne!(a.hash(), c.hash());
        assert_eq!(a.hash(), make_leaf(b"key", b"value", 0).hash());
    }

    #[test]
    fn test_compact_encoding_omits_children() {
        let mut node = NodeBox::Internal(InternalNode {
            clean: false,
            version: 0,
            hash: Hash::EMPTY,
            label: vec![0b0100_0000],
            label_bit_length: 2,
            leaf_node: None,
            left: Some(NodePointer::hash_ptr(Hash::digest_bytes(b"l"))),
            right: Some(NodePointer::hash_ptr(Hash::digest_bytes(b"r"))),
        });
        node.update_hash().unwrap();

        let full = node.marshal_binary().unwrap();
        let compact = node.compact_marshal_binary().unwrap();
        assert_eq!(full.len(), compact.len() + 2 * Hash::SIZE);

        let (decoded, consumed) = NodeBox::compact_unmarshal_binary(&compact).unwrap();
        assert_eq!(consumed, compact.len());
        match decoded {
            NodeBox::Internal(n) => {
                assert!(n.left.is_none() && n.right.is_none());
                assert_eq!(n.label_bit_length, 2);
            }
            _ => panic!("expected internal node"),
        }
    }

    #[test]
    fn test_unmarshal_rejects_garbage() {
        assert!(NodeBox::unmarshal_binary(&[]).is_err());
        assert!(NodeBox::unmarshal_binary(&[0xff, 1, 2]).is_err());
        let node = make_leaf(b"key", b"value", 0);
        let mut encoded = node.marshal_binary().unwrap();
        encoded.truncate(encoded.len() - 1);
        assert!(NodeBox::unmarshal_binary(&encoded).is_err());
    }
}
