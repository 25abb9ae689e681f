//! Key lookup over the trie.
use crate::{
    bits::{BitOps, Depth, Value},
    cache::Cache,
    error::Error,
    node::{NodeBox, NodePtrRef},
};

/// Descends from `ptr` (positioned `bit_depth` bits into the key) and returns
/// the value stored under `key`, dereferencing unresolved pointers through
/// the node database or remote syncer as needed.
pub(crate) fn get_path(
    cache: &mut Cache,
    ptr: &NodePtrRef,
    bit_depth: Depth,
    key: &[u8],
) -> Result<Option<Value>, Error> {
    let node_ref = cache.deref_node_ptr(ptr, Some(key))?;

    // Capture what the recursion needs and release the node borrow before
    // descending, since dereferencing children needs the cache again.
    enum Step {
        Found(crate::node::NodeRef),
        Descend(NodePtrRef, Depth),
        Miss,
    }

    let step = match *node_ref.borrow() {
        NodeBox::Leaf(ref leaf) => {
            if leaf.key == key {
                Step::Found(node_ref.clone())
            } else {
                Step::Miss
            }
        }
        NodeBox::Internal(ref n) => {
            let key_len = key.bit_length();
            let matched =
                key.common_prefix_len_at(bit_depth, key_len, &n.label, n.label_bit_length);
            if matched < n.label_bit_length {
                // The key diverges inside this node's label.
                Step::Miss
            } else {
                let position = bit_depth + n.label_bit_length;
                if key_len == position {
                    // The key ends exactly here; its leaf is inline.
                    match n.leaf_node {
                        Some(ref leaf_ptr) => match leaf_ptr.borrow().node {
                            Some(ref leaf) => Step::Found(leaf.clone()),
                            None => return Err(Error::NodeMissing(leaf_ptr.borrow().hash)),
                        },
                        None => Step::Miss,
                    }
                } else {
                    let child = if key.get_bit(position) {
                        &n.right
                    } else {
                        &n.left
                    };
                    match child {
                        Some(ref child) => Step::Descend(child.clone(), position),
                        None => Step::Miss,
                    }
                }
            }
        }
    };

    match step {
        Step::Found(leaf) => cache.leaf_value(&leaf).map(Some),
        Step::Descend(child, position) => get_path(cache, &child, position, key),
        Step::Miss => Ok(None),
    }
}
