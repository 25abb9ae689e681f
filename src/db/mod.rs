//! Persistent, multi-version node storage.
//!
//! A [`NodeDB`] stores node encodings content-addressed by digest within a
//! namespace, tracks which roots were committed and finalized at each
//! version, serves write logs between adjacent roots, and prunes versions no
//! surviving root depends on. Writes go through [`Batch`] objects that
//! persist atomically on commit.
use crate::{
    error::Error,
    hash::Hash,
    node::NodeBox,
    types::Root,
    writelog::{WriteLog, WriteLogIterator},
};

pub mod memory;

/// The persistence interface consumed by the tree.
pub trait NodeDB {
    /// Fetches and decodes the node with the given digest, in the context of
    /// a root known to reference it.
    fn get_node(&self, root: &Root, hash: &Hash) -> Result<NodeBox, Error>;

    /// Returns the ordered write log taking `start_root` to `end_root`.
    ///
    /// Two commit hops are transparently concatenated; anything longer fails
    /// with [`Error::WriteLogNotFound`].
    fn get_write_log(&self, start_root: &Root, end_root: &Root)
        -> Result<WriteLogIterator, Error>;

    /// Opens a staged batch for producing a new root from `old_root` in
    /// `version`.
    fn new_batch(&self, old_root: &Root, version: u64) -> Box<dyn Batch>;

    /// Whether the root is present. The empty root exists at every version.
    fn has_root(&self, root: &Root) -> bool;

    /// Marks `roots` as the canonical roots of `version`. Any other root
    /// committed at this version is discarded along with its exclusive nodes
    /// and write logs.
    fn finalize(&self, version: u64, roots: &[Hash]) -> Result<(), Error>;

    /// Removes all nodes whose deepest finalized referent is `version`.
    /// Only the earliest retained version may be pruned.
    fn prune(&self, version: u64) -> Result<(), Error>;

    /// Earliest version still retained.
    fn earliest_version(&self) -> u64;

    /// Latest version any root was committed in.
    fn latest_version(&self) -> u64;
}

/// A staged, in-memory set of node puts that persists atomically on commit.
pub trait Batch {
    /// Stages a node. The node must have a current digest.
    fn put_node(&mut self, node: &NodeBox) -> Result<(), Error>;

    /// Stages the write log describing the transition this batch commits.
    fn put_write_log(&mut self, log: WriteLog) -> Result<(), Error>;

    /// Registers a hook to run exactly when `commit` succeeds. Hooks fire in
    /// registration order.
    fn on_commit(&mut self, hook: Box<dyn FnOnce()>);

    /// Atomically persists the staged nodes and write log under `root`.
    fn commit(&mut self, root: &Root) -> Result<(), Error>;

    /// Discards all staged state.
    fn reset(&mut self);
}

/// Preorder traversal of a committed root, reading through backing storage.
///
/// The visitor returns whether to descend into the children of an internal
/// node. Inline leaves are visited as part of their internal node.
pub fn visit(
    ndb: &dyn NodeDB,
    root: &Root,
    visitor: &mut dyn FnMut(&NodeBox) -> bool,
) -> Result<(), Error> {
    if root.hash.is_empty() {
        return Ok(());
    }
    let mut pending = vec![root.hash];
    while let Some(hash) = pending.pop() {
        let node = ndb.get_node(root, &hash)?;
        let descend = visitor(&node);
        if let NodeBox::Internal(ref n) = node {
            if let Some(ref leaf_ptr) = n.leaf_node {
                if let Some(ref leaf) = leaf_ptr.borrow().node {
                    visitor(&leaf.borrow());
                }
            }
            if descend {
                for child in [&n.right, &n.left].into_iter().flatten() {
                    pending.push(child.borrow().hash);
                }
            }
        }
    }
    Ok(())
}

/// A node database that persists nothing.
///
/// Batches are accepted and discarded (commit hooks still fire in order), no
/// roots other than the empty root exist, and every node fetch misses. Used
/// when a tree is constructed without local storage, e.g. a purely remote
/// tree that resolves everything through its syncer.
#[derive(Clone, Copy, Debug, Default)]
pub struct NopNodeDB;

impl NodeDB for NopNodeDB {
    fn get_node(&self, _root: &Root, hash: &Hash) -> Result<NodeBox, Error> {
        Err(Error::NodeMissing(*hash))
    }

    fn get_write_log(
        &self,
        _start_root: &Root,
        _end_root: &Root,
    ) -> Result<WriteLogIterator, Error> {
        Err(Error::WriteLogNotFound)
    }

    fn new_batch(&self, _old_root: &Root, _version: u64) -> Box<dyn Batch> {
        Box::new(NopBatch { hooks: Vec::new() })
    }

    fn has_root(&self, root: &Root) -> bool {
        root.is_empty()
    }

    fn finalize(&self, _version: u64, _roots: &[Hash]) -> Result<(), Error> {
        Ok(())
    }

    fn prune(&self, _version: u64) -> Result<(), Error> {
        Err(Error::NotFinalized)
    }

    fn earliest_version(&self) -> u64 {
        0
    }

    fn latest_version(&self) -> u64 {
        0
    }
}

/// Batch of [`NopNodeDB`]: discards everything, still honors commit hooks.
struct NopBatch {
    hooks: Vec<Box<dyn FnOnce()>>,
}

impl Batch for NopBatch {
    fn put_node(&mut self, _node: &NodeBox) -> Result<(), Error> {
        Ok(())
    }

    fn put_write_log(&mut self, _log: WriteLog) -> Result<(), Error> {
        Ok(())
    }

    fn on_commit(&mut self, hook: Box<dyn FnOnce()>) {
        self.hooks.push(hook);
    }

    fn commit(&mut self, _root: &Root) -> Result<(), Error> {
        for hook in self.hooks.drain(..) {
            hook();
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.hooks.clear();
    }
}
