//! In-memory node cache fronting the node database and the syncer.
//!
//! The cache tracks every node resident in a tree handle and bounds residency
//! along two independent axes: total node count and total bytes of leaf
//! values. Either bound may be zero, meaning unbounded on that axis.
//! Replacement is least-recently-used per axis. Evicting a node drops the
//! resolved node (and, since children are owned by their parents, its whole
//! resident subtree) from its pointer while keeping the digest, so a later
//! access transparently re-fetches it. Evicting a value stubs out the leaf's
//! value while the leaf itself stays resident.
//!
//! Dirty nodes are pinned: they are created outside the eviction queues and
//! only enter them once a commit marks them clean.
//!
//! Inline leaves live and die with their internal node: they count toward the
//! node total, but they have no standalone storage record, so neither they
//! nor their values are independently evictable.
use crate::{
    bits::{Depth, Key, Value},
    error::Error,
    node::{InternalNode, LeafNode, NodeBox, NodePointer, NodePtrRef, NodeRef},
    sync::{GetPrefixesRequest, GetRequest, IterateRequest, ProofVerifier, ReadSyncer},
    types::Root,
    NodeDB,
};
use rustc_hash::FxHashMap;
use std::{cell::RefCell, collections::BTreeMap, rc::Rc};

/// Resident-set counters, exposed for eviction diagnostics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Resident internal nodes.
    pub internal_node_count: usize,
    /// Resident leaf nodes, inline leaves included.
    pub leaf_node_count: usize,
    /// Total bytes of evictable resident leaf values.
    pub value_size: usize,
}

pub(crate) struct Cache {
    ndb: Rc<dyn NodeDB>,
    syncer: Option<Rc<dyn ReadSyncer>>,

    /// Root of the in-memory (possibly dirty) tree.
    pub(crate) pending_root: Option<NodePtrRef>,
    /// Root all remote fetches are verified against. Fixed at construction
    /// for remote trees; never set for purely local ones.
    pub(crate) sync_root: Option<Root>,
    /// Root used for local node database fetches; follows the last commit.
    pub(crate) db_root: Option<Root>,

    node_capacity: usize,
    value_capacity: usize,
    stats: CacheStats,

    lru_seq: u64,
    node_lru: BTreeMap<u64, NodePtrRef>,
    value_lru: BTreeMap<u64, NodeRef>,
}

impl Cache {
    pub(crate) fn new(
        ndb: Rc<dyn NodeDB>,
        syncer: Option<Rc<dyn ReadSyncer>>,
        node_capacity: usize,
        value_capacity: usize,
    ) -> Self {
        Cache {
            ndb,
            syncer,
            pending_root: None,
            sync_root: None,
            db_root: None,
            node_capacity,
            value_capacity,
            stats: CacheStats::default(),
            lru_seq: 0,
            node_lru: BTreeMap::new(),
            value_lru: BTreeMap::new(),
        }
    }

    pub(crate) fn stats(&self) -> CacheStats {
        self.stats
    }

    pub(crate) fn ndb(&self) -> Rc<dyn NodeDB> {
        self.ndb.clone()
    }

    /// Creates a dirty leaf node and accounts for it.
    pub(crate) fn new_leaf(&mut self, key: Key, value: Value) -> NodePtrRef {
        self.stats.leaf_node_count += 1;
        NodePointer::dirty_ptr(NodeBox::Leaf(LeafNode::new(key, value)))
    }

    /// Creates a dirty internal node and accounts for it.
    pub(crate) fn new_internal(
        &mut self,
        label: Key,
        label_bit_length: Depth,
        leaf_node: Option<NodePtrRef>,
        left: Option<NodePtrRef>,
        right: Option<NodePtrRef>,
    ) -> NodePtrRef {
        self.stats.internal_node_count += 1;
        NodePointer::dirty_ptr(NodeBox::Internal(InternalNode {
            clean: false,
            version: 0,
            hash: crate::hash::Hash::EMPTY,
            label,
            label_bit_length,
            leaf_node,
            left,
            right,
        }))
    }

    /// Stops accounting for a node that the tree unlinked. Inline leaves of a
    /// discarded internal node are handled by their own calls.
    pub(crate) fn remove_node(&mut self, ptr: &NodePtrRef) {
        let mut p = ptr.borrow_mut();
        let Some(node) = p.node.take() else {
            if p.cache_seq != 0 {
                self.node_lru.remove(&p.cache_seq);
                p.cache_seq = 0;
            }
            return;
        };
        if p.cache_seq != 0 {
            self.node_lru.remove(&p.cache_seq);
            p.cache_seq = 0;
        }
        match *node.borrow_mut() {
            NodeBox::Internal(_) => {
                self.stats.internal_node_count =
                    self.stats.internal_node_count.saturating_sub(1);
            }
            NodeBox::Leaf(ref mut leaf) => {
                self.stats.leaf_node_count = self.stats.leaf_node_count.saturating_sub(1);
                if leaf.value_seq != 0 {
                    self.value_lru.remove(&leaf.value_seq);
                    leaf.value_seq = 0;
                    let len = leaf.value.as_ref().map(Vec::len).unwrap_or(0);
                    self.stats.value_size = self.stats.value_size.saturating_sub(len);
                }
            }
        };
    }

    /// Resolves a pointer, fetching through the node database or the remote
    /// syncer as needed. `fetch_key` is the full lookup key driving the
    /// traversal; remote fetches are impossible without it.
    pub(crate) fn deref_node_ptr(
        &mut self,
        ptr: &NodePtrRef,
        fetch_key: Option<&[u8]>,
    ) -> Result<NodeRef, Error> {
        let resolved = ptr.borrow().node.clone();
        if let Some(node) = resolved {
            self.touch(ptr);
            return Ok(node);
        }

        let hash = ptr.borrow().hash;
        if hash.is_empty() {
            return Err(Error::NodeMissing(hash));
        }

        // Local storage first.
        let local_err = match self.db_root {
            Some(db_root) => match self.ndb.get_node(&db_root, &hash) {
                Ok(node) => return Ok(self.install_fetched(ptr, node)),
                Err(err) => err,
            },
            None => Error::NodeMissing(hash),
        };

        // Fall back to the remote syncer.
        let (Some(syncer), Some(sync_root)) = (self.syncer.clone(), self.sync_root) else {
            return Err(local_err);
        };
        let Some(key) = fetch_key else {
            return Err(local_err);
        };
        let response = syncer.sync_get(&GetRequest {
            tree: sync_root,
            key: key.to_vec(),
            include_siblings: false,
        })?;
        self.merge_verified_proof(&response.proof)?;

        let node = ptr.borrow().node.clone();
        node.ok_or_else(|| {
            Error::ProofInvalid(format!("proof did not cover node {}", hash))
        })
    }

    /// Returns a leaf's value, transparently restoring it if it was evicted.
    pub(crate) fn leaf_value(&mut self, node: &NodeRef) -> Result<Value, Error> {
        let resident = {
            let guard = node.borrow();
            match *guard {
                NodeBox::Leaf(ref leaf) => leaf.value.clone(),
                _ => return Err(Error::MalformedNode("expected leaf node".to_string())),
            }
        };
        if let Some(value) = resident {
            self.touch_value(node);
            return Ok(value);
        }
        self.restore_leaf_value(node)
    }

    fn restore_leaf_value(&mut self, node: &NodeRef) -> Result<Value, Error> {
        let (hash, key) = {
            let guard = node.borrow();
            let NodeBox::Leaf(ref leaf) = *guard else {
                unreachable!("checked by caller");
            };
            (leaf.hash, leaf.key.clone())
        };

        let fetched = match self.db_root {
            Some(db_root) => self.ndb.get_node(&db_root, &hash),
            None => Err(Error::NodeMissing(hash)),
        };
        let value = match fetched {
            Ok(NodeBox::Leaf(leaf)) => leaf.value.ok_or(Error::NodeMissing(hash))?,
            Ok(_) => {
                return Err(Error::MalformedNode(
                    "digest resolved to a non-leaf node".to_string(),
                ))
            }
            Err(err) => {
                // A remote tree can re-prove the leaf by key.
                let (Some(syncer), Some(sync_root)) = (self.syncer.clone(), self.sync_root)
                else {
                    return Err(err);
                };
                let response = syncer.sync_get(&GetRequest {
                    tree: sync_root,
                    key: key.clone(),
                    include_siblings: false,
                })?;
                let verified = ProofVerifier.verify_proof(sync_root.hash, &response.proof)?;
                let index = crate::sync::proof::index_subtree(&verified);
                let restored = index
                    .get(&hash)
                    .and_then(|p| p.borrow().node.clone())
                    .ok_or(err)?;
                let restored_ref = restored.borrow();
                match &*restored_ref {
                    NodeBox::Leaf(leaf) => leaf.value.clone().ok_or(Error::NodeMissing(hash))?,
                    _ => {
                        return Err(Error::MalformedNode(
                            "digest resolved to a non-leaf node".to_string(),
                        ))
                    }
                }
            }
        };

        if let NodeBox::Leaf(ref mut leaf) = *node.borrow_mut() {
            leaf.value = Some(value.clone());
        }
        self.stats.value_size += value.len();
        self.touch_value(node);
        self.enforce_bounds();
        Ok(value)
    }

    /// Verifies a proof against the sync root and adopts every subtree that
    /// resolves a pointer the local tree holds only as a digest.
    pub(crate) fn merge_verified_proof(
        &mut self,
        proof: &crate::sync::Proof,
    ) -> Result<(), Error> {
        let sync_root = self
            .sync_root
            .ok_or_else(|| Error::ProofInvalid("tree has no sync root".to_string()))?;
        let verified = ProofVerifier.verify_proof(sync_root.hash, proof)?;
        let index = crate::sync::proof::index_subtree(&verified);

        let Some(root_ptr) = self.pending_root.clone() else {
            return Ok(());
        };
        self.adopt_into(&root_ptr, &index);
        self.enforce_bounds();
        Ok(())
    }

    /// Recursively adopts verified subtrees wherever the local tree has a
    /// matching unresolved pointer.
    fn adopt_into(&mut self, ptr: &NodePtrRef, index: &FxHashMap<crate::hash::Hash, NodePtrRef>) {
        let resolved = ptr.borrow().node.clone();
        match resolved {
            Some(node) => {
                if let NodeBox::Internal(ref n) = *node.borrow() {
                    for child in [&n.left, &n.right].into_iter().flatten() {
                        self.adopt_into(child, index);
                    }
                }
            }
            None => {
                let hash = ptr.borrow().hash;
                let Some(found) = index.get(&hash).and_then(|p| p.borrow().node.clone()) else {
                    return;
                };
                ptr.borrow_mut().node = Some(found);
                self.register_subtree(ptr);
            }
        }
    }

    /// Accounts for and tracks every resolved node below a freshly adopted
    /// pointer.
    fn register_subtree(&mut self, ptr: &NodePtrRef) {
        let Some(node) = ptr.borrow().node.clone() else {
            return;
        };
        match *node.borrow() {
            NodeBox::Internal(ref n) => {
                self.stats.internal_node_count += 1;
                if let Some(ref leaf_ptr) = n.leaf_node {
                    if leaf_ptr.borrow().node.is_some() {
                        self.stats.leaf_node_count += 1;
                    }
                }
                for child in [&n.left, &n.right].into_iter().flatten() {
                    self.register_subtree(child);
                }
            }
            NodeBox::Leaf(_) => {
                self.stats.leaf_node_count += 1;
            }
        }
        self.track_clean_ptr(ptr);
        self.track_leaf_value(&node);
    }

    /// Installs a node fetched from the node database behind its pointer.
    fn install_fetched(&mut self, ptr: &NodePtrRef, node: NodeBox) -> NodeRef {
        let node_ref = Rc::new(RefCell::new(node));
        ptr.borrow_mut().node = Some(node_ref.clone());
        match *node_ref.borrow() {
            NodeBox::Internal(ref n) => {
                self.stats.internal_node_count += 1;
                if n.leaf_node.is_some() {
                    self.stats.leaf_node_count += 1;
                }
            }
            NodeBox::Leaf(_) => {
                self.stats.leaf_node_count += 1;
            }
        }
        self.track_clean_ptr(ptr);
        self.track_leaf_value(&node_ref);
        self.enforce_bounds();
        node_ref
    }

    /// Marks a committed pointer clean in the eviction queues and, for
    /// leaves, starts tracking its value. Called by commit after the batch
    /// has been persisted.
    pub(crate) fn mark_committed(&mut self, ptr: &NodePtrRef) {
        let Some(node) = ptr.borrow().node.clone() else {
            return;
        };
        self.track_clean_ptr(ptr);
        self.track_leaf_value(&node);
    }

    /// Applies both eviction bounds. Dirty nodes are not in the queues and
    /// are therefore never touched.
    pub(crate) fn enforce_bounds(&mut self) {
        if self.node_capacity > 0 {
            while self.stats.internal_node_count + self.stats.leaf_node_count
                > self.node_capacity
            {
                let Some((_, victim)) = self.node_lru.pop_first() else {
                    break;
                };
                self.evict_subtree(&victim);
            }
        }
        if self.value_capacity > 0 {
            while self.stats.value_size > self.value_capacity {
                let Some((_, victim)) = self.value_lru.pop_first() else {
                    break;
                };
                if let NodeBox::Leaf(ref mut leaf) = *victim.borrow_mut() {
                    let len = leaf.value.as_ref().map(Vec::len).unwrap_or(0);
                    leaf.value = None;
                    leaf.value_seq = 0;
                    self.stats.value_size = self.stats.value_size.saturating_sub(len);
                };
            }
        }
    }

    /// Drops the resolved node behind a pointer, together with every resident
    /// descendant, keeping only digests behind.
    fn evict_subtree(&mut self, ptr: &NodePtrRef) {
        let node = {
            let mut p = ptr.borrow_mut();
            p.cache_seq = 0;
            p.node.take()
        };
        let Some(node) = node else {
            return;
        };
        match *node.borrow_mut() {
            NodeBox::Internal(ref mut n) => {
                self.stats.internal_node_count =
                    self.stats.internal_node_count.saturating_sub(1);
                if let Some(ref leaf_ptr) = n.leaf_node {
                    if leaf_ptr.borrow().node.is_some() {
                        self.stats.leaf_node_count =
                            self.stats.leaf_node_count.saturating_sub(1);
                    }
                }
                for child in [&n.left, &n.right].into_iter().flatten() {
                    let seq = child.borrow().cache_seq;
                    if seq != 0 {
                        self.node_lru.remove(&seq);
                    }
                    self.evict_subtree(child);
                }
            }
            NodeBox::Leaf(ref mut leaf) => {
                self.stats.leaf_node_count = self.stats.leaf_node_count.saturating_sub(1);
                if leaf.value_seq != 0 {
                    self.value_lru.remove(&leaf.value_seq);
                    leaf.value_seq = 0;
                    let len = leaf.value.as_ref().map(Vec::len).unwrap_or(0);
                    self.stats.value_size = self.stats.value_size.saturating_sub(len);
                }
            }
        };
    }

    fn next_seq(&mut self) -> u64 {
        self.lru_seq += 1;
        self.lru_seq
    }

    /// Moves a clean resolved pointer to the back of the node queue.
    fn touch(&mut self, ptr: &NodePtrRef) {
        let (clean, seq) = {
            let p = ptr.borrow();
            (p.clean, p.cache_seq)
        };
        if !clean || seq == 0 {
            return;
        }
        self.node_lru.remove(&seq);
        let seq = self.next_seq();
        ptr.borrow_mut().cache_seq = seq;
        self.node_lru.insert(seq, ptr.clone());
    }

    fn track_clean_ptr(&mut self, ptr: &NodePtrRef) {
        let old = ptr.borrow().cache_seq;
        if old != 0 {
            self.node_lru.remove(&old);
        }
        let seq = self.next_seq();
        ptr.borrow_mut().cache_seq = seq;
        self.node_lru.insert(seq, ptr.clone());
    }

    /// Starts (or refreshes) value tracking for a clean standalone leaf with
    /// a resident value.
    fn track_leaf_value(&mut self, node: &NodeRef) {
        let mut guard = node.borrow_mut();
        let NodeBox::Leaf(ref mut leaf) = *guard else {
            return;
        };
        let Some(ref value) = leaf.value else {
            return;
        };
        if leaf.value_seq == 0 {
            self.stats.value_size += value.len();
        } else {
            self.value_lru.remove(&leaf.value_seq);
        }
        self.lru_seq += 1;
        leaf.value_seq = self.lru_seq;
        let seq = leaf.value_seq;
        drop(guard);
        self.value_lru.insert(seq, node.clone());
    }

    fn touch_value(&mut self, node: &NodeRef) {
        let seq = match *node.borrow() {
            NodeBox::Leaf(ref leaf) => leaf.value_seq,
            _ => return,
        };
        if seq == 0 {
            return;
        }
        self.value_lru.remove(&seq);
        self.lru_seq += 1;
        let new_seq = self.lru_seq;
        if let NodeBox::Leaf(ref mut leaf) = *node.borrow_mut() {
            leaf.value_seq = new_seq;
        }
        self.value_lru.insert(new_seq, node.clone());
    }

    /// Issues a single prefix prefetch against the remote syncer and merges
    /// the verified result.
    pub(crate) fn prefetch_prefixes(
        &mut self,
        prefixes: Vec<Key>,
        limit: u16,
    ) -> Result<(), Error> {
        let (Some(syncer), Some(sync_root)) = (self.syncer.clone(), self.sync_root) else {
            return Ok(());
        };
        let response = syncer.sync_get_prefixes(&GetPrefixesRequest {
            tree: sync_root,
            prefixes,
            limit,
        })?;
        self.merge_verified_proof(&response.proof)
    }

    /// Issues an iteration prefetch against the remote syncer and merges the
    /// verified result.
    pub(crate) fn iterate_fetch(&mut self, key: Key, prefetch: Depth) -> Result<(), Error> {
        let (Some(syncer), Some(sync_root)) = (self.syncer.clone(), self.sync_root) else {
            return Ok(());
        };
        let response = syncer.sync_iterate(&IterateRequest {
            tree: sync_root,
            key,
            prefetch,
        })?;
        self.merge_verified_proof(&response.proof)
    }

    /// Whether a remote syncer is attached.
    pub(crate) fn has_syncer(&self) -> bool {
        self.syncer.is_some()
    }

    /// Unpins a pointer from the node eviction queue, e.g. because it is
    /// about to go dirty.
    pub(crate) fn untrack_ptr(&mut self, ptr: &NodePtrRef) {
        let mut p = ptr.borrow_mut();
        if p.cache_seq != 0 {
            self.node_lru.remove(&p.cache_seq);
            p.cache_seq = 0;
        }
    }

    /// Marks a pointer and its node dirty, pinning them until the next
    /// commit.
    ///
    /// The traversal that is dirtying the pointer still holds the node it
    /// dereferenced earlier; if eviction struck the pointer in the meantime,
    /// the held node is re-attached (and re-accounted) so the dirty spine is
    /// always resolved.
    pub(crate) fn mark_dirty(&mut self, ptr: &NodePtrRef, node_ref: &NodeRef) {
        self.untrack_ptr(ptr);
        let reattached = {
            let mut p = ptr.borrow_mut();
            p.clean = false;
            if p.node.is_none() {
                p.node = Some(node_ref.clone());
                true
            } else {
                false
            }
        };
        let mut node = node_ref.borrow_mut();
        match *node {
            NodeBox::Internal(ref mut n) => {
                n.clean = false;
                if reattached {
                    self.stats.internal_node_count += 1;
                    if n.leaf_node.is_some() {
                        self.stats.leaf_node_count += 1;
                    }
                }
            }
            NodeBox::Leaf(ref mut leaf) => {
                leaf.clean = false;
                if reattached {
                    self.stats.leaf_node_count += 1;
                }
            }
        }
    }

    /// Stops value tracking for a leaf whose value is about to change.
    pub(crate) fn untrack_leaf_value(&mut self, node: &NodeRef) {
        let mut guard = node.borrow_mut();
        if let NodeBox::Leaf(ref mut leaf) = *guard {
            if leaf.value_seq != 0 {
                self.value_lru.remove(&leaf.value_seq);
                leaf.value_seq = 0;
                let len = leaf.value.as_ref().map(Vec::len).unwrap_or(0);
                self.stats.value_size = self.stats.value_size.saturating_sub(len);
            }
        }
    }

    /// Releases everything the cache holds.
    pub(crate) fn clear(&mut self) {
        self.pending_root = None;
        self.node_lru.clear();
        self.value_lru.clear();
        self.stats = CacheStats::default();
    }
}
