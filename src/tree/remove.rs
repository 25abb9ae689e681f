//! Key removal over the trie.
//!
//! Removal drops the leaf and then restructures on the way out: an internal
//! node left with only its inline leaf is replaced by that leaf, and an
//! internal node left with a single child subtree collapses into it by label
//! concatenation. The empty tree is represented by the absence of a root.
use crate::{
    bits::{BitOps, Depth, Key},
    cache::Cache,
    error::Error,
    node::{NodeBox, NodePtrRef},
};

/// Removes `key` from the subtree at `ptr` (positioned `bit_depth` bits into
/// the key). Returns the new subtree root and whether anything was removed.
pub(crate) fn remove_path(
    cache: &mut Cache,
    ptr: NodePtrRef,
    bit_depth: Depth,
    key: &[u8],
) -> Result<(Option<NodePtrRef>, bool), Error> {
    let node_ref = cache.deref_node_ptr(&ptr, Some(key))?;
    let key_len = key.bit_length();

    enum Step {
        RemoveSelf,
        RemoveInline,
        Descend(NodePtrRef, Depth, bool),
        Keep,
    }

    let step = match *node_ref.borrow() {
        NodeBox::Leaf(ref leaf) => {
            if leaf.key == key {
                Step::RemoveSelf
            } else {
                Step::Keep
            }
        }
        NodeBox::Internal(ref n) => {
            let matched =
                key.common_prefix_len_at(bit_depth, key_len, &n.label, n.label_bit_length);
            if matched < n.label_bit_length {
                Step::Keep
            } else {
                let position = bit_depth + n.label_bit_length;
                if key_len == position {
                    if n.leaf_node.is_some() {
                        Step::RemoveInline
                    } else {
                        Step::Keep
                    }
                } else {
                    let bit = key.get_bit(position);
                    let child = if bit { n.right.clone() } else { n.left.clone() };
                    match child {
                        Some(child) => Step::Descend(child, position, bit),
                        None => Step::Keep,
                    }
                }
            }
        }
    };

    match step {
        Step::Keep => Ok((Some(ptr), false)),
        Step::RemoveSelf => {
            cache.remove_node(&ptr);
            Ok((None, true))
        }
        Step::RemoveInline => {
            let slot = {
                let mut node = node_ref.borrow_mut();
                match *node {
                    NodeBox::Internal(ref mut n) => n.leaf_node.take(),
                    _ => unreachable!("shape checked above"),
                }
            };
            if let Some(ref slot) = slot {
                cache.remove_node(slot);
            }
            restructure(cache, ptr, node_ref, bit_depth, key)
        }
        Step::Descend(child, position, bit) => {
            let (new_child, changed) = remove_path(cache, child, position, key)?;
            if !changed {
                return Ok((Some(ptr), false));
            }
            {
                let mut node = node_ref.borrow_mut();
                if let NodeBox::Internal(ref mut n) = *node {
                    if bit {
                        n.right = new_child;
                    } else {
                        n.left = new_child;
                    }
                }
            }
            restructure(cache, ptr, node_ref, bit_depth, key)
        }
    }
}

/// Re-establishes the structural invariants of an internal node after a
/// removal below it.
fn restructure(
    cache: &mut Cache,
    ptr: NodePtrRef,
    node_ref: crate::node::NodeRef,
    bit_depth: Depth,
    key: &[u8],
) -> Result<(Option<NodePtrRef>, bool), Error> {
    enum Outcome {
        Empty,
        PromoteInline(NodePtrRef),
        MergeChild(NodePtrRef, bool, Key, Depth),
        Keep,
    }

    let outcome = {
        let node = node_ref.borrow();
        let NodeBox::Internal(ref n) = *node else {
            unreachable!("restructure only runs on internal nodes");
        };
        let children = n.left.is_some() as usize + n.right.is_some() as usize;
        match (&n.leaf_node, children) {
            (None, 0) => Outcome::Empty,
            (Some(leaf), 0) => Outcome::PromoteInline(leaf.clone()),
            (None, 1) => {
                let (child, bit) = match (&n.left, &n.right) {
                    (Some(child), None) => (child.clone(), false),
                    (None, Some(child)) => (child.clone(), true),
                    _ => unreachable!("exactly one child"),
                };
                Outcome::MergeChild(child, bit, n.label.clone(), n.label_bit_length)
            }
            _ => Outcome::Keep,
        }
    };

    match outcome {
        Outcome::Keep => {
            cache.mark_dirty(&ptr, &node_ref);
            Ok((Some(ptr), true))
        }
        Outcome::Empty => {
            cache.remove_node(&ptr);
            Ok((None, true))
        }
        Outcome::PromoteInline(leaf) => {
            cache.remove_node(&ptr);
            Ok((Some(leaf), true))
        }
        Outcome::MergeChild(child, bit, label, label_bit_length) => {
            // The child might be living only as a digest; it sits off the
            // removal key's path, so fetch it by its own position prefix.
            let position = bit_depth + label_bit_length;
            let fetch_key = key
                .bit_slice(0, position)
                .concat_bits(position, &[if bit { 0x80 } else { 0x00 }], 1);
            let child_node = cache.deref_node_ptr(&child, Some(&fetch_key))?;

            let is_leaf = !child_node.borrow().is_internal();
            if is_leaf {
                // A lone leaf needs no label; it simply replaces this node.
                cache.remove_node(&ptr);
                return Ok((Some(child), true));
            }

            // Absorb this node's label into the surviving internal child.
            {
                let mut node = child_node.borrow_mut();
                if let NodeBox::Internal(ref mut m) = *node {
                    m.label = label.concat_bits(label_bit_length, &m.label, m.label_bit_length);
                    m.label_bit_length += label_bit_length;
                }
            }
            cache.mark_dirty(&child, &child_node);
            cache.remove_node(&ptr);
            Ok((Some(child), true))
        }
    }
}
