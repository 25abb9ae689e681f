//! Key insertion over the trie.
//!
//! Traversal compares the key's bits against each internal node's label.
//! A fully matched label descends into the child selected by the next bit
//! (or lands in the inline leaf slot when the key is exhausted); a partially
//! matched label splits the node at the divergence bit, with the shared
//! prefix absorbed into a new parent whose children's labels each start with
//! their discriminating bit.
use crate::{
    bits::{BitOps, Depth},
    cache::Cache,
    error::Error,
    node::{NodeBox, NodePtrRef},
};

/// Inserts `value` under `key` in the subtree at `ptr` (positioned
/// `bit_depth` bits into the key) and returns the new subtree root.
pub(crate) fn insert_path(
    cache: &mut Cache,
    ptr: Option<NodePtrRef>,
    bit_depth: Depth,
    key: &[u8],
    value: &[u8],
) -> Result<NodePtrRef, Error> {
    let Some(ptr) = ptr else {
        return Ok(cache.new_leaf(key.to_vec(), value.to_vec()));
    };

    let node_ref = cache.deref_node_ptr(&ptr, Some(key))?;
    let key_len = key.bit_length();

    enum Shape {
        Leaf { existing_key: crate::bits::Key },
        Internal { label: crate::bits::Key, label_bit_length: Depth },
    }
    let shape = match *node_ref.borrow() {
        NodeBox::Leaf(ref leaf) => Shape::Leaf {
            existing_key: leaf.key.clone(),
        },
        NodeBox::Internal(ref n) => Shape::Internal {
            label: n.label.clone(),
            label_bit_length: n.label_bit_length,
        },
    };

    match shape {
        Shape::Leaf { existing_key } => {
            if existing_key == key {
                // Overwrite in place.
                cache.untrack_leaf_value(&node_ref);
                if let NodeBox::Leaf(ref mut leaf) = *node_ref.borrow_mut() {
                    leaf.value = Some(value.to_vec());
                }
                cache.mark_dirty(&ptr, &node_ref);
                return Ok(ptr);
            }

            // Split the position into an internal node labeled with the
            // shared prefix beyond the current bit depth.
            let existing_len = existing_key.bit_length();
            let common = key.common_prefix_len_at(0, key_len, &existing_key, existing_len);
            let label = key.bit_slice(bit_depth, common - bit_depth);
            let label_bit_length = common - bit_depth;

            let new_leaf = cache.new_leaf(key.to_vec(), value.to_vec());
            let node = if key_len == common {
                // The new key ends at the split; it becomes the inline leaf
                // and the longer existing key hangs off its next bit.
                let (left, right) = branch(existing_key.get_bit(common), ptr);
                cache.new_internal(label, label_bit_length, Some(new_leaf), left, right)
            } else if existing_len == common {
                // The existing key ends at the split.
                let (left, right) = branch(key.get_bit(common), new_leaf);
                cache.new_internal(label, label_bit_length, Some(ptr), left, right)
            } else {
                // Both keys continue; they diverge at the split bit.
                let bit = key.get_bit(common);
                let (left, right) = if bit {
                    (Some(ptr), Some(new_leaf))
                } else {
                    (Some(new_leaf), Some(ptr))
                };
                cache.new_internal(label, label_bit_length, None, left, right)
            };
            Ok(node)
        }
        Shape::Internal {
            label,
            label_bit_length,
        } => {
            let matched = key.common_prefix_len_at(bit_depth, key_len, &label, label_bit_length);
            if matched == label_bit_length {
                // Label fully matched; continue below this node.
                let position = bit_depth + label_bit_length;
                if key_len == position {
                    // The key ends exactly here.
                    let leaf_slot = {
                        let node = node_ref.borrow();
                        match *node {
                            NodeBox::Internal(ref n) => n.leaf_node.clone(),
                            _ => unreachable!("shape checked above"),
                        }
                    };
                    let new_slot = insert_path(cache, leaf_slot, position, key, value)?;
                    if let NodeBox::Internal(ref mut n) = *node_ref.borrow_mut() {
                        n.leaf_node = Some(new_slot);
                    }
                } else {
                    let bit = key.get_bit(position);
                    let child = {
                        let node = node_ref.borrow();
                        match *node {
                            NodeBox::Internal(ref n) => {
                                if bit {
                                    n.right.clone()
                                } else {
                                    n.left.clone()
                                }
                            }
                            _ => unreachable!("shape checked above"),
                        }
                    };
                    let new_child = insert_path(cache, child, position, key, value)?;
                    if let NodeBox::Internal(ref mut n) = *node_ref.borrow_mut() {
                        if bit {
                            n.right = Some(new_child);
                        } else {
                            n.left = Some(new_child);
                        }
                    }
                }
                cache.mark_dirty(&ptr, &node_ref);
                Ok(ptr)
            } else {
                // Split the label at the divergence point. The existing node
                // keeps the suffix (whose first bit discriminates it) and a
                // new parent takes the shared prefix.
                let label_prefix = label.bit_slice(0, matched);
                let label_suffix = label.bit_slice(matched, label_bit_length - matched);
                let suffix_bit = label_suffix.get_bit(0);
                if let NodeBox::Internal(ref mut n) = *node_ref.borrow_mut() {
                    n.label = label_suffix;
                    n.label_bit_length = label_bit_length - matched;
                }
                cache.mark_dirty(&ptr, &node_ref);

                let position = bit_depth + matched;
                let node = if key_len == position {
                    // The key ends at the split point.
                    let new_leaf = cache.new_leaf(key.to_vec(), value.to_vec());
                    let (left, right) = branch(suffix_bit, ptr);
                    cache.new_internal(label_prefix, matched, Some(new_leaf), left, right)
                } else {
                    let new_leaf = cache.new_leaf(key.to_vec(), value.to_vec());
                    let (left, right) = if key.get_bit(position) {
                        (Some(ptr), Some(new_leaf))
                    } else {
                        (Some(new_leaf), Some(ptr))
                    };
                    cache.new_internal(label_prefix, matched, None, left, right)
                };
                Ok(node)
            }
        }
    }
}

/// Places `ptr` on the side selected by `bit`.
fn branch(bit: bool, ptr: NodePtrRef) -> (Option<NodePtrRef>, Option<NodePtrRef>) {
    if bit {
        (None, Some(ptr))
    } else {
        (Some(ptr), None)
    }
}
