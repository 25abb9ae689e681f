//! Serving side of the sync protocol: a committed tree can answer
//! proof-bearing read requests about its own root.
use crate::{
    bits::{BitOps, Depth, Key},
    cache::Cache,
    error::Error,
    node::{NodeBox, NodePtrRef},
    sync::{
        GetPrefixesRequest, GetRequest, IterateRequest, ProofBuilder, ProofResponse, ReadSyncer,
    },
    tree::{
        iterator::{position_key, subtree_before},
        Tree,
    },
};

impl ReadSyncer for Tree {
    fn sync_get(&self, request: &GetRequest) -> Result<ProofResponse, Error> {
        let mut cache = self.request_cache(&request.tree)?;
        let mut builder = ProofBuilder::new(request.tree.hash);
        let root_ptr = cache.pending_root.clone();
        build_get_proof(
            &mut cache,
            &mut builder,
            root_ptr.as_ref(),
            0,
            &request.key,
            request.include_siblings,
        )?;
        Ok(ProofResponse {
            proof: builder.build(),
        })
    }

    fn sync_get_prefixes(&self, request: &GetPrefixesRequest) -> Result<ProofResponse, Error> {
        let mut cache = self.request_cache(&request.tree)?;
        let mut builder = ProofBuilder::new(request.tree.hash);
        let root_ptr = cache.pending_root.clone();
        let mut budget = request.limit as usize;
        build_prefixes_proof(
            &mut cache,
            &mut builder,
            root_ptr.as_ref(),
            Vec::new(),
            0,
            &request.prefixes,
            &mut budget,
        )?;
        Ok(ProofResponse {
            proof: builder.build(),
        })
    }

    fn sync_iterate(&self, request: &IterateRequest) -> Result<ProofResponse, Error> {
        let mut cache = self.request_cache(&request.tree)?;
        let mut builder = ProofBuilder::new(request.tree.hash);
        let root_ptr = cache.pending_root.clone();
        let mut remaining = request.prefetch.max(1);
        build_iterate_proof(
            &mut cache,
            &mut builder,
            root_ptr.as_ref(),
            Vec::new(),
            0,
            &request.key,
            &mut remaining,
        )?;
        Ok(ProofResponse {
            proof: builder.build(),
        })
    }
}

impl Tree {
    /// Validates that a request reads against this tree's committed root and
    /// borrows the cache for proof construction.
    fn request_cache(
        &self,
        requested: &crate::types::Root,
    ) -> Result<std::cell::RefMut<'_, Cache>, Error> {
        self.ensure_open()?;
        let root = self.root.get().ok_or(Error::RootNotFound)?;
        if root != *requested {
            return Err(Error::RootNotFound);
        }
        Ok(self.cache.borrow_mut())
    }
}

/// Records a pointer as a bare digest (or as absent).
fn push_stub(builder: &mut ProofBuilder, ptr: Option<&NodePtrRef>) {
    match ptr {
        Some(ptr) => builder.push_digest(ptr.borrow().hash),
        None => builder.push_absent(),
    }
}

/// Records a node with both of its children as digests.
fn push_shallow(
    cache: &mut Cache,
    builder: &mut ProofBuilder,
    ptr: Option<&NodePtrRef>,
    fetch_key: &[u8],
) -> Result<(), Error> {
    let Some(ptr) = ptr else {
        builder.push_absent();
        return Ok(());
    };
    let node_ref = cache.deref_node_ptr(ptr, Some(fetch_key))?;
    let node = node_ref.borrow();
    builder.push_node(&node)?;
    if let NodeBox::Internal(ref n) = *node {
        push_stub(builder, n.left.as_ref());
        push_stub(builder, n.right.as_ref());
    }
    Ok(())
}

/// Minimal proof of the value (or absence) of one key: full nodes down the
/// lookup path, digests elsewhere.
fn build_get_proof(
    cache: &mut Cache,
    builder: &mut ProofBuilder,
    ptr: Option<&NodePtrRef>,
    bit_depth: Depth,
    key: &[u8],
    include_siblings: bool,
) -> Result<(), Error> {
    let Some(ptr) = ptr else {
        builder.push_absent();
        return Ok(());
    };
    let node_ref = cache.deref_node_ptr(ptr, Some(key))?;

    enum Follow {
        None,
        Child {
            bit: bool,
            position: Depth,
            left: Option<NodePtrRef>,
            right: Option<NodePtrRef>,
        },
    }

    let follow = match *node_ref.borrow() {
        NodeBox::Leaf(_) => Follow::None,
        NodeBox::Internal(ref n) => {
            let key_len = key.bit_length();
            let matched =
                key.common_prefix_len_at(bit_depth, key_len, &n.label, n.label_bit_length);
            let position = bit_depth + n.label_bit_length;
            if matched == n.label_bit_length && key_len > position {
                Follow::Child {
                    bit: key.get_bit(position),
                    position,
                    left: n.left.clone(),
                    right: n.right.clone(),
                }
            } else {
                // The key either ends at this node (its leaf travels inline)
                // or diverges inside the label (the proof shows absence).
                Follow::None
            }
        }
    };

    let is_internal = node_ref.borrow().is_internal();
    builder.push_node(&node_ref.borrow())?;
    if !is_internal {
        return Ok(());
    }

    match follow {
        Follow::None => {
            let node = node_ref.borrow();
            if let NodeBox::Internal(ref n) = *node {
                push_stub(builder, n.left.as_ref());
                push_stub(builder, n.right.as_ref());
            }
            Ok(())
        }
        Follow::Child {
            bit,
            position,
            left,
            right,
        } => {
            if bit {
                if include_siblings {
                    push_shallow(cache, builder, left.as_ref(), key)?;
                } else {
                    push_stub(builder, left.as_ref());
                }
                build_get_proof(cache, builder, right.as_ref(), position, key, include_siblings)
            } else {
                build_get_proof(cache, builder, left.as_ref(), position, key, include_siblings)?;
                if include_siblings {
                    push_shallow(cache, builder, right.as_ref(), key)
                } else {
                    push_stub(builder, right.as_ref());
                    Ok(())
                }
            }
        }
    }
}

/// Whether a node at `position` lies on a path to, or under, any of the
/// requested prefixes.
fn prefix_relevant(position: &[u8], pos_len: Depth, prefixes: &[Key]) -> bool {
    prefixes.iter().any(|prefix| {
        let prefix_len = prefix.bit_length();
        let limit = pos_len.min(prefix_len);
        position.common_prefix_len_at(0, pos_len, prefix, limit) == limit
    })
}

/// Proof covering all nodes under any of the prefixes, up to a budget of
/// leaves.
fn build_prefixes_proof(
    cache: &mut Cache,
    builder: &mut ProofBuilder,
    ptr: Option<&NodePtrRef>,
    position: Key,
    pos_len: Depth,
    prefixes: &[Key],
    budget: &mut usize,
) -> Result<(), Error> {
    let Some(ptr) = ptr else {
        builder.push_absent();
        return Ok(());
    };
    if *budget == 0 {
        builder.push_digest(ptr.borrow().hash);
        return Ok(());
    }
    let fetch_key = position_key(&position, pos_len);
    let node_ref = cache.deref_node_ptr(ptr, Some(&fetch_key))?;

    enum Step {
        Leaf,
        Internal {
            has_inline: bool,
            children: (Option<NodePtrRef>, Option<NodePtrRef>),
            full_pos: Key,
            full_len: Depth,
        },
        Irrelevant,
    }

    let step = match *node_ref.borrow() {
        NodeBox::Leaf(ref leaf) => {
            if prefix_relevant(&leaf.key, leaf.key.bit_length(), prefixes) {
                Step::Leaf
            } else {
                Step::Irrelevant
            }
        }
        NodeBox::Internal(ref n) => {
            let full_len = pos_len + n.label_bit_length;
            let full_pos = position.concat_bits(pos_len, &n.label, n.label_bit_length);
            if prefix_relevant(&full_pos, full_len, prefixes) {
                Step::Internal {
                    has_inline: n.leaf_node.is_some(),
                    children: (n.left.clone(), n.right.clone()),
                    full_pos,
                    full_len,
                }
            } else {
                Step::Irrelevant
            }
        }
    };

    match step {
        Step::Irrelevant => {
            builder.push_digest(ptr.borrow().hash);
            Ok(())
        }
        Step::Leaf => {
            builder.push_node(&node_ref.borrow())?;
            *budget = budget.saturating_sub(1);
            Ok(())
        }
        Step::Internal {
            has_inline,
            children,
            full_pos,
            full_len,
        } => {
            builder.push_node(&node_ref.borrow())?;
            if has_inline {
                *budget = budget.saturating_sub(1);
            }
            build_prefixes_proof(
                cache,
                builder,
                children.0.as_ref(),
                full_pos.clone(),
                full_len,
                prefixes,
                budget,
            )?;
            build_prefixes_proof(
                cache,
                builder,
                children.1.as_ref(),
                full_pos,
                full_len,
                prefixes,
                budget,
            )
        }
    }
}

/// Proof covering the next `remaining` leaves in key order from `target`.
fn build_iterate_proof(
    cache: &mut Cache,
    builder: &mut ProofBuilder,
    ptr: Option<&NodePtrRef>,
    position: Key,
    pos_len: Depth,
    target: &[u8],
    remaining: &mut Depth,
) -> Result<(), Error> {
    let Some(ptr) = ptr else {
        builder.push_absent();
        return Ok(());
    };
    if *remaining == 0 {
        builder.push_digest(ptr.borrow().hash);
        return Ok(());
    }
    let fetch_key = position_key(&position, pos_len);
    let node_ref = cache.deref_node_ptr(ptr, Some(&fetch_key))?;

    enum Step {
        Leaf,
        Internal {
            inline_counts: bool,
            children: (Option<NodePtrRef>, Option<NodePtrRef>),
            full_pos: Key,
            full_len: Depth,
        },
        Skip,
    }

    let step = match *node_ref.borrow() {
        NodeBox::Leaf(ref leaf) => {
            if leaf.key.as_slice() >= target {
                Step::Leaf
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
                let inline_counts = n.leaf_node.as_ref().is_some_and(|lp| {
                    lp.borrow()
                        .node
                        .as_ref()
                        .is_some_and(|node| match *node.borrow() {
                            NodeBox::Leaf(ref leaf) => leaf.key.as_slice() >= target,
                            _ => false,
                        })
                });
                Step::Internal {
                    inline_counts,
                    children: (n.left.clone(), n.right.clone()),
                    full_pos,
                    full_len,
                }
            }
        }
    };

    match step {
        Step::Skip => {
            builder.push_digest(ptr.borrow().hash);
            Ok(())
        }
        Step::Leaf => {
            builder.push_node(&node_ref.borrow())?;
            *remaining = remaining.saturating_sub(1);
            Ok(())
        }
        Step::Internal {
            inline_counts,
            children,
            full_pos,
            full_len,
        } => {
            builder.push_node(&node_ref.borrow())?;
            if inline_counts {
                *remaining = remaining.saturating_sub(1);
            }
            build_iterate_proof(
                cache,
                builder,
                children.0.as_ref(),
                full_pos.clone(),
                full_len,
                target,
                remaining,
            )?;
            build_iterate_proof(
                cache,
                builder,
                children.1.as_ref(),
                full_pos,
                full_len,
                target,
                remaining,
            )
        }
    }
}
