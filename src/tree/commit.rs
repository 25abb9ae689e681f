//! Commit: digest recomputation, batch persistence, write log emission.
use crate::{
    cache::Cache,
    db::Batch,
    error::Error,
    hash::Hash,
    node::{NodeBox, NodePtrRef},
    tree::Tree,
    types::{Namespace, Root},
    writelog::{LogEntry, WriteLog},
};

/// Commits the tree's pending state at `(namespace, version)`.
///
/// When `expected` is given, the commit is aborted without persisting
/// anything unless the computed root digest matches.
pub(crate) fn commit(
    tree: &Tree,
    namespace: Namespace,
    version: u64,
    expected: Option<Hash>,
) -> Result<(WriteLog, Hash), Error> {
    let mut cache = tree.cache.borrow_mut();
    let old_root = tree
        .root
        .get()
        .unwrap_or_else(|| Root::empty(namespace, version));
    let mut batch = cache.ndb().new_batch(&old_root, version);

    // Phase one: assign versions and recompute digests over the dirty spine,
    // staging each dirty node into the batch. Nothing is marked clean yet so
    // a failed commit can simply be retried.
    let root_hash = match cache.pending_root.clone() {
        Some(ref ptr) => hash_and_stage(batch.as_mut(), ptr, version, true)?,
        None => Hash::EMPTY,
    };

    if let Some(expected) = expected {
        if root_hash != expected {
            batch.reset();
            return Err(Error::ExpectedRootMismatch);
        }
    }

    let write_log: WriteLog = tree
        .pending_write_log
        .borrow()
        .iter()
        .map(|(key, value)| LogEntry {
            key: key.clone(),
            value: value.clone(),
        })
        .collect();
    batch.put_write_log(write_log.clone())?;

    let new_root = Root {
        namespace,
        version,
        hash: root_hash,
    };
    batch.commit(&new_root)?;

    // Phase two: the batch persisted, so the dirty spine is now clean and
    // enters the eviction queues.
    if let Some(ptr) = cache.pending_root.clone() {
        mark_clean(&mut cache, &ptr, true);
    }
    cache.db_root = Some(new_root);
    cache.enforce_bounds();
    drop(cache);

    tree.root.set(Some(new_root));
    tree.pending_write_log.borrow_mut().clear();
    tracing::debug!(version, root = %root_hash, entries = write_log.len(), "committed tree");
    Ok((write_log, root_hash))
}

/// Bottom-up digest computation over the dirty spine. Returns the digest at
/// `ptr`. Inline leaves are hashed but not staged; they travel inside their
/// internal node's encoding.
fn hash_and_stage(
    batch: &mut dyn Batch,
    ptr: &NodePtrRef,
    version: u64,
    standalone: bool,
) -> Result<Hash, Error> {
    if ptr.borrow().clean {
        return Ok(ptr.borrow().hash);
    }
    let node_ref = ptr
        .borrow()
        .node
        .clone()
        .ok_or_else(|| Error::MalformedNode("dirty pointer without a node".to_string()))?;

    let children: Vec<(NodePtrRef, bool)> = match *node_ref.borrow() {
        NodeBox::Internal(ref n) => n
            .leaf_node
            .iter()
            .map(|p| (p.clone(), false))
            .chain([&n.left, &n.right].into_iter().flatten().map(|p| (p.clone(), true)))
            .collect(),
        NodeBox::Leaf(_) => Vec::new(),
    };
    for (child, child_standalone) in children {
        hash_and_stage(batch, &child, version, child_standalone)?;
    }

    {
        let mut node = node_ref.borrow_mut();
        match *node {
            NodeBox::Internal(ref mut n) => n.version = version,
            NodeBox::Leaf(ref mut leaf) => leaf.version = version,
        }
        node.update_hash()?;
    }
    let hash = node_ref.borrow().hash();
    if standalone {
        batch.put_node(&node_ref.borrow())?;
    }
    ptr.borrow_mut().hash = hash;
    Ok(hash)
}

/// Marks the dirty spine clean after a successful batch commit and registers
/// it with the cache's eviction queues.
fn mark_clean(cache: &mut Cache, ptr: &NodePtrRef, standalone: bool) {
    if ptr.borrow().clean {
        return;
    }
    let Some(node_ref) = ptr.borrow().node.clone() else {
        return;
    };

    let children: Vec<(NodePtrRef, bool)> = match *node_ref.borrow() {
        NodeBox::Internal(ref n) => n
            .leaf_node
            .iter()
            .map(|p| (p.clone(), false))
            .chain([&n.left, &n.right].into_iter().flatten().map(|p| (p.clone(), true)))
            .collect(),
        NodeBox::Leaf(_) => Vec::new(),
    };
    for (child, child_standalone) in children {
        mark_clean(cache, &child, child_standalone);
    }

    {
        let mut node = node_ref.borrow_mut();
        match *node {
            NodeBox::Internal(ref mut n) => n.clean = true,
            NodeBox::Leaf(ref mut leaf) => leaf.clean = true,
        }
    }
    ptr.borrow_mut().clean = true;
    if standalone {
        cache.mark_committed(ptr);
    }
}
