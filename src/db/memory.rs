//! In-memory node database backend.
//!
//! This module provides [`MemNodeDB`], a node database that keeps every node
//! encoding, root index and write log in memory. It implements the full
//! multi-version contract of [`NodeDB`], including finalization with
//! discarded-root collection and pruning with cross-version node sharing, and
//! is the reference implementation of that contract.
//!
//! # Note
//!
//! `MemNodeDB` is a storage backend, not the tree itself. The tree logic
//! lives in the `tree` module; this backend only answers digest lookups and
//! maintains the per-version liveness metadata that drives pruning.
//!
//! # Thread safety
//!
//! All state is behind a single [`RwLock`]; read operations take the read
//! lock, while batch commits, finalization and pruning take the write lock.
use crate::{
    db::{Batch, NodeDB},
    error::Error,
    hash::Hash,
    node::NodeBox,
    types::{Namespace, Root},
    writelog::{static_iterator, WriteLog, WriteLogIterator},
};
use rustc_hash::{FxHashMap, FxHashSet};
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, RwLock},
};

/// A root identified by version and digest.
type RootKey = (u64, Hash);

/// A stored node encoding together with its liveness metadata.
#[derive(Debug, Clone)]
struct NodeRecord {
    /// Canonical node encoding.
    data: Vec<u8>,
    /// Version whose commit introduced the node.
    created_version: u64,
}

/// Bookkeeping for one committed root.
#[derive(Debug, Clone, Default)]
struct RootRecord {
    /// Roots this one was derived from, one entry per commit that produced
    /// it. Used for write-log hop resolution.
    parents: Vec<RootKey>,
}

#[derive(Debug, Default)]
struct Inner {
    /// Node records keyed by digest.
    nodes: FxHashMap<Hash, NodeRecord>,
    /// Committed roots per version. Finalization trims a version's map down
    /// to its canonical roots.
    roots: BTreeMap<u64, BTreeMap<Hash, RootRecord>>,
    /// Write logs keyed by the `(old_root, new_root)` pair they connect.
    write_logs: FxHashMap<(RootKey, RootKey), WriteLog>,
    /// Versions that have been finalized and not yet pruned.
    finalized: BTreeSet<u64>,
    /// Earliest retained version.
    earliest: u64,
    /// Latest version any root was committed in.
    latest: u64,
}

impl Inner {
    /// Digests of all nodes reachable from the given roots.
    fn reachable(&self, from: impl Iterator<Item = Hash>) -> FxHashSet<Hash> {
        let mut live = FxHashSet::default();
        let mut pending: Vec<Hash> = from.filter(|h| !h.is_empty()).collect();
        while let Some(hash) = pending.pop() {
            if !live.insert(hash) {
                continue;
            }
            let Some(record) = self.nodes.get(&hash) else {
                continue;
            };
            if let Ok((NodeBox::Internal(n), _)) = NodeBox::unmarshal_binary(&record.data) {
                for child in [&n.left, &n.right].into_iter().flatten() {
                    pending.push(child.borrow().hash);
                }
            }
        }
        live
    }

    /// All committed root digests in versions strictly greater than
    /// `version`.
    fn roots_after(&self, version: u64) -> Vec<Hash> {
        self.roots
            .range(version + 1..)
            .flat_map(|(_, roots)| roots.keys().copied())
            .collect()
    }
}

/// In-memory multi-version node database.
///
/// Cloning shares the underlying storage, which allows several tree handles
/// to read and commit against the same database.
#[derive(Debug, Clone)]
pub struct MemNodeDB {
    namespace: Namespace,
    inner: Arc<RwLock<Inner>>,
}

impl MemNodeDB {
    /// Creates an empty database bound to the given namespace.
    pub fn new(namespace: Namespace) -> Self {
        MemNodeDB {
            namespace,
            inner: Arc::new(RwLock::new(Inner::default())),
        }
    }

    /// Number of stored node records, across all retained versions.
    pub fn node_count(&self) -> usize {
        self.inner.read().unwrap().nodes.len()
    }

    fn check_namespace(&self, root: &Root) -> Result<(), Error> {
        if root.namespace != self.namespace {
            return Err(Error::BadNamespace);
        }
        Ok(())
    }
}

impl NodeDB for MemNodeDB {
    fn get_node(&self, root: &Root, hash: &Hash) -> Result<NodeBox, Error> {
        self.check_namespace(root)?;
        if !self.has_root(root) {
            return Err(Error::RootNotFound);
        }
        let inner = self.inner.read().unwrap();
        let record = inner.nodes.get(hash).ok_or(Error::NodeMissing(*hash))?;
        let (node, _) = NodeBox::unmarshal_binary(&record.data)?;
        Ok(node)
    }

    fn get_write_log(
        &self,
        start_root: &Root,
        end_root: &Root,
    ) -> Result<WriteLogIterator, Error> {
        self.check_namespace(start_root)?;
        self.check_namespace(end_root)?;

        let start = (start_root.version, start_root.hash);
        let end = (end_root.version, end_root.hash);
        let inner = self.inner.read().unwrap();

        // One hop.
        if let Some(log) = inner.write_logs.get(&(start, end)) {
            return Ok(static_iterator(log.clone()));
        }

        // Two hops through any recorded parent of the end root. Longer
        // chains fail loudly instead of being silently stitched together.
        let parents = inner
            .roots
            .get(&end_root.version)
            .and_then(|roots| roots.get(&end_root.hash))
            .map(|record| record.parents.clone())
            .unwrap_or_default();
        for mid in parents {
            if let (Some(first), Some(second)) = (
                inner.write_logs.get(&(start, mid)),
                inner.write_logs.get(&(mid, end)),
            ) {
                let mut merged = first.clone();
                merged.extend(second.iter().cloned());
                return Ok(static_iterator(merged));
            }
        }

        Err(Error::WriteLogNotFound)
    }

    fn new_batch(&self, old_root: &Root, version: u64) -> Box<dyn Batch> {
        Box::new(MemBatch {
            namespace: self.namespace,
            inner: Arc::clone(&self.inner),
            old_root: *old_root,
            version,
            nodes: Vec::new(),
            write_log: None,
            hooks: Vec::new(),
        })
    }

    fn has_root(&self, root: &Root) -> bool {
        if root.namespace != self.namespace {
            return false;
        }
        if root.is_empty() {
            return true;
        }
        self.inner
            .read()
            .unwrap()
            .roots
            .get(&root.version)
            .is_some_and(|roots| roots.contains_key(&root.hash))
    }

    fn finalize(&self, version: u64, roots: &[Hash]) -> Result<(), Error> {
        let mut inner = self.inner.write().unwrap();

        if inner.finalized.contains(&version) {
            return Err(Error::AlreadyFinalized);
        }
        if let Some(&last) = inner.finalized.iter().next_back() {
            if version <= last {
                return Err(Error::AlreadyFinalized);
            }
            if version != last + 1 {
                return Err(Error::NotFinalized);
            }
        } else {
            inner.earliest = version;
        }

        let committed: Vec<Hash> = inner
            .roots
            .get(&version)
            .map(|r| r.keys().copied().collect())
            .unwrap_or_default();
        for root in roots {
            if !root.is_empty() && !committed.contains(root) {
                return Err(Error::RootNotFound);
            }
        }

        // Collect the exclusive nodes of discarded roots: everything created
        // in this version that no kept root can reach.
        let discarded: Vec<Hash> = committed
            .iter()
            .copied()
            .filter(|hash| !roots.contains(hash))
            .collect();
        if !discarded.is_empty() {
            let keep = roots
                .iter()
                .copied()
                .chain(inner.roots_after(version));
            let live = inner.reachable(keep);
            inner
                .nodes
                .retain(|hash, record| record.created_version != version || live.contains(hash));

            if let Some(version_roots) = inner.roots.get_mut(&version) {
                for hash in &discarded {
                    version_roots.remove(hash);
                }
            }
            inner.write_logs.retain(|(old, new), _| {
                let touches_discarded = |key: &RootKey| {
                    key.0 == version && discarded.contains(&key.1)
                };
                !touches_discarded(old) && !touches_discarded(new)
            });
        }

        inner.finalized.insert(version);
        tracing::debug!(version, roots = roots.len(), discarded = discarded.len(), "finalized version");
        Ok(())
    }

    fn prune(&self, version: u64) -> Result<(), Error> {
        let mut inner = self.inner.write().unwrap();

        if !inner.finalized.contains(&version) {
            return Err(Error::NotFinalized);
        }
        if inner.earliest != version {
            return Err(Error::NotEarliest);
        }

        // Reachability sweep from every root that survives this prune. Nodes
        // shared with later versions stay behind; everything else introduced
        // up to and including this version goes.
        let live = inner.reachable(inner.roots_after(version).into_iter());
        let before = inner.nodes.len();
        inner
            .nodes
            .retain(|hash, record| record.created_version > version || live.contains(hash));
        let removed = before - inner.nodes.len();

        inner.roots.remove(&version);
        inner
            .write_logs
            .retain(|(old, new), _| old.0 > version && new.0 > version);
        inner.finalized.remove(&version);
        inner.earliest = version + 1;

        tracing::debug!(version, removed, "pruned version");
        Ok(())
    }

    fn earliest_version(&self) -> u64 {
        self.inner.read().unwrap().earliest
    }

    fn latest_version(&self) -> u64 {
        self.inner.read().unwrap().latest
    }
}

/// A staged batch against a [`MemNodeDB`].
struct MemBatch {
    namespace: Namespace,
    inner: Arc<RwLock<Inner>>,
    old_root: Root,
    version: u64,
    nodes: Vec<(Hash, Vec<u8>)>,
    write_log: Option<WriteLog>,
    hooks: Vec<Box<dyn FnOnce()>>,
}

impl Batch for MemBatch {
    fn put_node(&mut self, node: &NodeBox) -> Result<(), Error> {
        let data = node.marshal_binary()?;
        self.nodes.push((node.hash(), data));
        Ok(())
    }

    fn put_write_log(&mut self, log: WriteLog) -> Result<(), Error> {
        self.write_log = Some(log);
        Ok(())
    }

    fn on_commit(&mut self, hook: Box<dyn FnOnce()>) {
        self.hooks.push(hook);
    }

    fn commit(&mut self, root: &Root) -> Result<(), Error> {
        if root.namespace != self.namespace {
            return Err(Error::BadNamespace);
        }
        if root.version != self.version
            || (root.version != self.old_root.version
                && root.version != self.old_root.version + 1)
        {
            return Err(Error::RootMustFollowOld);
        }

        let mut inner = self.inner.write().unwrap();
        if !self.old_root.is_empty()
            && !inner
                .roots
                .get(&self.old_root.version)
                .is_some_and(|roots| roots.contains_key(&self.old_root.hash))
        {
            return Err(Error::RootNotFound);
        }
        if inner.finalized.contains(&root.version) {
            return Err(Error::AlreadyFinalized);
        }

        for (hash, data) in self.nodes.drain(..) {
            inner.nodes.entry(hash).or_insert(NodeRecord {
                data,
                created_version: root.version,
            });
        }

        let parent = (self.old_root.version, self.old_root.hash);
        let record = inner
            .roots
            .entry(root.version)
            .or_default()
            .entry(root.hash)
            .or_default();
        if !record.parents.contains(&parent) {
            record.parents.push(parent);
        }

        if let Some(log) = self.write_log.take() {
            inner
                .write_logs
                .insert((parent, (root.version, root.hash)), log);
        }
        inner.latest = inner.latest.max(root.version);
        drop(inner);

        tracing::debug!(version = root.version, root = %root.hash, "committed batch");
        for hook in self.hooks.drain(..) {
            hook();
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.nodes.clear();
        self.write_log = None;
        self.hooks.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::LeafNode;

    fn test_ns() -> Namespace {
        Namespace::from_seed(b"mem node db test ns")
    }

    fn make_leaf(key: &[u8], value: &[u8], version: u64) -> NodeBox {
        let mut leaf = LeafNode::new(key.to_vec(), value.to_vec());
        leaf.version = version;
        let mut node = NodeBox::Leaf(leaf);
        node.update_hash().unwrap();
        node
    }

    /// Commits a single-leaf root at the given version and returns it.
    fn commit_leaf_root(ndb: &MemNodeDB, old_root: &Root, version: u64, key: &[u8]) -> Root {
        let node = make_leaf(key, b"value", version);
        let root = Root {
            namespace: test_ns(),
            version,
            hash: node.hash(),
        };
        let mut batch = ndb.new_batch(old_root, version);
        batch.put_node(&node).unwrap();
        batch
            .put_write_log(vec![crate::writelog::LogEntry {
                key: key.to_vec(),
                value: Some(b"value".to_vec()),
            }])
            .unwrap();
        batch.commit(&root).unwrap();
        root
    }

    #[test]
    fn test_put_get_round_trip() {
        let ndb = MemNodeDB::new(test_ns());
        let empty = Root::empty(test_ns(), 0);
        let root = commit_leaf_root(&ndb, &empty, 0, b"foo");

        let node = ndb.get_node(&root, &root.hash).unwrap();
        assert_eq!(node.hash(), root.hash);
        assert_eq!(node.version(), 0);

        // Unknown digest under a valid root.
        let missing = Hash::digest_bytes(b"missing");
        assert!(matches!(
            ndb.get_node(&root, &missing),
            Err(Error::NodeMissing(h)) if h == missing
        ));

        // Unknown root.
        let mut bogus = root;
        bogus.hash = missing;
        assert!(matches!(
            ndb.get_node(&bogus, &root.hash),
            Err(Error::RootNotFound)
        ));
    }

    #[test]
    fn test_has_root_is_version_scoped() {
        let ndb = MemNodeDB::new(test_ns());
        let empty = Root::empty(test_ns(), 0);
        assert!(ndb.has_root(&empty));

        let root = commit_leaf_root(&ndb, &empty, 0, b"foo");
        assert!(ndb.has_root(&root));

        // Same hash under a version it was never committed in.
        let mut moved = root;
        moved.version = 1;
        assert!(!ndb.has_root(&moved));

        // Wrong namespace.
        let mut other_ns = root;
        other_ns.namespace = Namespace::from_seed(b"other");
        assert!(!other_ns.is_empty());
        assert!(!ndb.has_root(&other_ns));
    }

    #[test]
    fn test_commit_version_discipline() {
        let ndb = MemNodeDB::new(test_ns());
        let empty = Root::empty(test_ns(), 0);
        let root0 = commit_leaf_root(&ndb, &empty, 0, b"foo");

        // A jump past old.version + 1 must fail.
        let node = make_leaf(b"bar", b"baz", 5);
        let mut batch = ndb.new_batch(&root0, 5);
        batch.put_node(&node).unwrap();
        let target = Root {
            namespace: test_ns(),
            version: 5,
            hash: node.hash(),
        };
        assert!(matches!(
            batch.commit(&target),
            Err(Error::RootMustFollowOld)
        ));

        // An unknown old root must fail.
        let bogus_old = Root {
            namespace: test_ns(),
            version: 0,
            hash: Hash::digest_bytes(b"bogus"),
        };
        let node = make_leaf(b"bar", b"baz", 1);
        let mut batch = ndb.new_batch(&bogus_old, 1);
        batch.put_node(&node).unwrap();
        let target = Root {
            namespace: test_ns(),
            version: 1,
            hash: node.hash(),
        };
        assert!(matches!(batch.commit(&target), Err(Error::RootNotFound)));

        // A foreign namespace must fail.
        let other = Namespace::from_seed(b"other");
        let mut batch = ndb.new_batch(&Root::empty(other, 0), 0);
        let target = Root {
            namespace: other,
            version: 0,
            hash: node.hash(),
        };
        assert!(matches!(batch.commit(&target), Err(Error::BadNamespace)));
    }

    #[test]
    fn test_finalize_ordering() {
        let ndb = MemNodeDB::new(test_ns());
        let empty = Root::empty(test_ns(), 0);
        let root0 = commit_leaf_root(&ndb, &empty, 0, b"a");
        let root1 = commit_leaf_root(&ndb, &Root { version: 1, ..empty }, 1, b"b");
        let root2 = commit_leaf_root(&ndb, &Root { version: 2, ..empty }, 2, b"c");

        // The first finalize fixes the base version; later ones must follow
        // it without gaps.
        ndb.finalize(0, &[root0.hash]).unwrap();
        assert!(matches!(
            ndb.finalize(0, &[root0.hash]),
            Err(Error::AlreadyFinalized)
        ));
        assert!(matches!(
            ndb.finalize(2, &[root2.hash]),
            Err(Error::NotFinalized)
        ));
        ndb.finalize(1, &[root1.hash]).unwrap();
        ndb.finalize(2, &[root2.hash]).unwrap();

        // Committing into a finalized version fails.
        let node = make_leaf(b"late", b"late", 0);
        let mut batch = ndb.new_batch(&empty, 0);
        batch.put_node(&node).unwrap();
        let target = Root {
            namespace: test_ns(),
            version: 0,
            hash: node.hash(),
        };
        assert!(matches!(batch.commit(&target), Err(Error::AlreadyFinalized)));
    }

    #[test]
    fn test_prune_requires_earliest_finalized() {
        let ndb = MemNodeDB::new(test_ns());
        let empty = Root::empty(test_ns(), 0);
        let root0 = commit_leaf_root(&ndb, &empty, 0, b"a");

        assert!(matches!(ndb.prune(0), Err(Error::NotFinalized)));
        ndb.finalize(0, &[root0.hash]).unwrap();

        let root1 = commit_leaf_root(&ndb, &Root { version: 1, ..empty }, 1, b"b");
        ndb.finalize(1, &[root1.hash]).unwrap();

        assert!(matches!(ndb.prune(1), Err(Error::NotEarliest)));
        ndb.prune(0).unwrap();
        assert_eq!(ndb.earliest_version(), 1);
        assert_eq!(ndb.latest_version(), 1);
        assert!(!ndb.has_root(&root0));
        assert!(ndb.has_root(&root1));
    }

    #[test]
    fn test_on_commit_hooks_fire_in_order() {
        let ndb = MemNodeDB::new(test_ns());
        let empty = Root::empty(test_ns(), 0);

        let calls = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let mut batch = ndb.new_batch(&empty, 0);
        for i in 1..=3 {
            let calls = calls.clone();
            batch.on_commit(Box::new(move || calls.borrow_mut().push(i)));
        }
        assert!(calls.borrow().is_empty());
        batch.commit(&empty).unwrap();
        assert_eq!(*calls.borrow(), vec![1, 2, 3]);
    }

    #[test]
    fn test_write_log_two_hop_merge() {
        let ndb = MemNodeDB::new(test_ns());
        let empty = Root::empty(test_ns(), 0);
        let root1 = commit_leaf_root(&ndb, &empty, 0, b"one");

        // Second commit derived from the first.
        let node = make_leaf(b"two", b"value", 0);
        let root2 = Root {
            namespace: test_ns(),
            version: 0,
            hash: node.hash(),
        };
        let mut batch = ndb.new_batch(&root1, 0);
        batch.put_node(&node).unwrap();
        batch
            .put_write_log(vec![crate::writelog::LogEntry {
                key: b"two".to_vec(),
                value: Some(b"value".to_vec()),
            }])
            .unwrap();
        batch.commit(&root2).unwrap();

        // Direct hops work.
        assert!(ndb.get_write_log(&empty, &root1).is_ok());
        assert!(ndb.get_write_log(&root1, &root2).is_ok());

        // Two hops are merged in order.
        let merged: Vec<_> = ndb
            .get_write_log(&empty, &root2)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].key, b"one");
        assert_eq!(merged[1].key, b"two");

        // A third hop must fail rather than silently concatenate.
        let node = make_leaf(b"three", b"value", 0);
        let root3 = Root {
            namespace: test_ns(),
            version: 0,
            hash: node.hash(),
        };
        let mut batch = ndb.new_batch(&root2, 0);
        batch.put_node(&node).unwrap();
        batch.put_write_log(vec![]).unwrap();
        batch.commit(&root3).unwrap();
        assert!(matches!(
            ndb.get_write_log(&empty, &root3),
            Err(Error::WriteLogNotFound)
        ));
    }

    #[test]
    fn test_visit_reaches_inline_leaves() {
        use crate::node::{InternalNode, NodePointer};
        use std::{cell::RefCell, rc::Rc};

        let ndb = MemNodeDB::new(test_ns());
        let empty = Root::empty(test_ns(), 0);

        let leaf = make_leaf(b"under", b"value", 0);
        let inline = make_leaf(b"", b"inline", 0);
        let inline_hash = inline.hash();
        let mut internal = NodeBox::Internal(InternalNode {
            clean: true,
            version: 0,
            hash: Hash::EMPTY,
            label: vec![],
            label_bit_length: 0,
            leaf_node: Some(Rc::new(RefCell::new(NodePointer {
                clean: true,
                hash: inline_hash,
                node: Some(Rc::new(RefCell::new(inline))),
                cache_seq: 0,
            }))),
            left: Some(NodePointer::hash_ptr(leaf.hash())),
            right: None,
        });
        internal.update_hash().unwrap();

        let root = Root {
            namespace: test_ns(),
            version: 0,
            hash: internal.hash(),
        };
        let mut batch = ndb.new_batch(&empty, 0);
        batch.put_node(&internal).unwrap();
        batch.put_node(&leaf).unwrap();
        batch.commit(&root).unwrap();

        let mut seen = Vec::new();
        crate::db::visit(&ndb, &root, &mut |node| {
            seen.push(node.hash());
            true
        })
        .unwrap();
        assert_eq!(seen.len(), 3);
        assert!(seen.contains(&inline_hash));
        assert!(seen.contains(&leaf.hash()));
    }
}
