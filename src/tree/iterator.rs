//! Lexicographic iteration over the tree.
//!
//! Iteration order follows the bitwise structure of the trie: at each
//! internal node the inline leaf (the shortest key in the subtree) comes
//! first, then the zero branch, then the one branch, which is exactly
//! lexicographic byte order with proper prefixes first.
use crate::{
    bits::{cmp_bit_strings, BitOps, Depth, Key, Value},
    cache::Cache,
    error::Error,
    node::{NodeBox, NodePtrRef},
    tree::Tree,
};
use std::cmp::Ordering;

/// Whether every key in a subtree whose position prefix is
/// `position[..pos_len]` orders strictly before `target`.
pub(crate) fn subtree_before(position: &[u8], pos_len: Depth, target: &[u8]) -> bool {
    let limit = pos_len.min(target.bit_length());
    cmp_bit_strings(position, limit, target, limit) == Ordering::Less
}

/// Pads a bit-position prefix out to whole bytes, yielding a key whose
/// traversal path passes through the node at that position. Used as the
/// fetch key for nodes that sit off the caller's key path.
pub(crate) fn position_key(position: &[u8], pos_len: Depth) -> Key {
    position.bit_slice(0, pos_len)
}

/// Finds the first leaf with key >= `target` in the subtree at `ptr`.
fn seek_path(
    cache: &mut Cache,
    ptr: &NodePtrRef,
    position: Key,
    pos_len: Depth,
    target: &[u8],
    prefetch: u16,
) -> Result<Option<(Key, Value)>, Error> {
    let unresolved = ptr.borrow().node.is_none();
    let fetch_key = iterate_fetch_key(&position, pos_len, target);
    if unresolved && prefetch > 0 && cache.has_syncer() {
        // Remote tree: fetch a whole span of upcoming leaves in one round
        // trip instead of dereferencing node by node.
        cache.iterate_fetch(fetch_key.clone(), prefetch)?;
    }
    let node_ref = cache.deref_node_ptr(ptr, Some(&fetch_key))?;

    enum Step {
        Leaf(crate::node::NodeRef, Key),
        Internal {
            inline: Option<(crate::node::NodeRef, Key)>,
            children: Vec<(NodePtrRef, bool)>,
            full_pos: Key,
            full_len: Depth,
        },
        Skip,
    }

    let step = match *node_ref.borrow() {
        NodeBox::Leaf(ref leaf) => {
            if leaf.key.as_slice() >= target {
                Step::Leaf(node_ref.clone(), leaf.key.clone())
            } else {
                Step::Skip
            }
        }
        NodeBox::Internal(ref n) => {
            let full_len = pos_len + n.label_bit_length;
            let full_pos = position.concat_bits(pos_len, &n.label, n.label_bit_length);
            if subtree_before(&full_pos, full_len, target) {
                Step::Skip
            } else {
                let inline = n.leaf_node.as_ref().and_then(|lp| {
                    let node = lp.borrow().node.clone()?;
                    let key = match *node.borrow() {
                        NodeBox::Leaf(ref leaf) => leaf.key.clone(),
                        _ => return None,
                    };
                    (key.as_slice() >= target).then_some((node, key))
                });
                let mut children = Vec::new();
                if let Some(ref left) = n.left {
                    children.push((left.clone(), false));
                }
                if let Some(ref right) = n.right {
                    children.push((right.clone(), true));
                }
                Step::Internal {
                    inline,
                    children,
                    full_pos,
                    full_len,
                }
            }
        }
    };

    match step {
        Step::Skip => Ok(None),
        Step::Leaf(node, key) => {
            let value = cache.leaf_value(&node)?;
            Ok(Some((key, value)))
        }
        Step::Internal {
            inline,
            children,
            full_pos,
            full_len,
        } => {
            if let Some((node, key)) = inline {
                let value = cache.leaf_value(&node)?;
                return Ok(Some((key, value)));
            }
            for (child, bit) in children {
                // The child's subtree position extends ours by the branch
                // bit, which allows skipping pre-target branches without
                // dereferencing them.
                let branch_pos =
                    full_pos.concat_bits(full_len, &[if bit { 0x80 } else { 0x00 }], 1);
                if subtree_before(&branch_pos, full_len + 1, target) {
                    continue;
                }
                if let Some(found) =
                    seek_path(cache, &child, full_pos.clone(), full_len, target, prefetch)?
                {
                    return Ok(Some(found));
                }
            }
            Ok(None)
        }
    }
}

/// The key a remote fetch should ask for so the response covers the node at
/// `position` and continues along the iteration target.
fn iterate_fetch_key(position: &[u8], pos_len: Depth, target: &[u8]) -> Key {
    let limit = pos_len.min(target.bit_length());
    if cmp_bit_strings(position, limit, target, limit) == Ordering::Equal
        && target.bit_length() >= pos_len
    {
        target.to_vec()
    } else {
        position_key(position, pos_len)
    }
}

/// An iterator over the tree in lexicographic key order.
///
/// Freshly created iterators are invalid; position them with
/// [`TreeIterator::rewind`] or [`TreeIterator::seek`]. Errors invalidate the
/// iterator and are retrievable through [`TreeIterator::error`].
pub struct TreeIterator<'a> {
    tree: &'a Tree,
    prefetch: u16,
    key: Option<Key>,
    value: Option<Value>,
    error: Option<Error>,
}

impl<'a> TreeIterator<'a> {
    pub(crate) fn new(tree: &'a Tree, prefetch: u16) -> Self {
        TreeIterator {
            tree,
            prefetch,
            key: None,
            value: None,
            error: None,
        }
    }

    /// Positions the iterator at the first key in the tree.
    pub fn rewind(&mut self) {
        self.seek(&[]);
    }

    /// Positions the iterator at the first key >= `target`.
    pub fn seek(&mut self, target: &[u8]) {
        self.key = None;
        self.value = None;
        self.error = None;

        if self.tree.ensure_open().is_err() {
            self.error = Some(Error::Closed);
            return;
        }
        let mut cache = self.tree.cache.borrow_mut();
        let Some(root_ptr) = cache.pending_root.clone() else {
            return;
        };
        match seek_path(&mut cache, &root_ptr, Vec::new(), 0, target, self.prefetch) {
            Ok(Some((key, value))) => {
                self.key = Some(key);
                self.value = Some(value);
            }
            Ok(None) => {}
            Err(err) => self.error = Some(err),
        }
    }

    /// Advances to the next key.
    pub fn next(&mut self) {
        let Some(current) = self.key.take() else {
            return;
        };
        // The immediate lexicographic successor of a byte string is itself
        // with a zero byte appended.
        let mut successor = current;
        successor.push(0x00);
        self.seek(&successor);
    }

    /// Whether the iterator points at a key.
    pub fn is_valid(&self) -> bool {
        self.key.is_some()
    }

    /// The current key, while valid.
    pub fn key(&self) -> Option<&Key> {
        self.key.as_ref()
    }

    /// The current value, while valid.
    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    /// The error that invalidated the iterator, if any.
    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }
}
