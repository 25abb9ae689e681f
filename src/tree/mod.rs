//! The tree engine: a single-owner handle over the Merklized trie.
//!
//! A [`Tree`] fronts a node cache over an optional node database and an
//! optional remote syncer. Mutations dirty nodes in place in the cache; the
//! committed on-disk versions stay untouched, which is what makes the
//! structure copy-on-write across versions. [`Tree::commit`] recomputes
//! digests over the dirty spine bottom-up, persists it through a node
//! database batch, and emits the write log of the commit window.
//!
//! A handle belongs to one logical caller; it is not `Sync` and mutating
//! operations must not be interleaved. Read-only operations on committed
//! roots may run in parallel across distinct handles sharing a node
//! database.
use crate::{
    bits::{Key, Value},
    cache::{Cache, CacheStats},
    constant::{DEFAULT_NODE_CAPACITY, DEFAULT_VALUE_CAPACITY},
    db::{NodeDB, NopNodeDB},
    error::Error,
    hash::Hash,
    node::NodePointer,
    sync::ReadSyncer,
    types::{Namespace, Root},
    writelog::{LogEntry, WriteLog},
};
use std::{
    cell::{Cell, RefCell},
    collections::BTreeMap,
    rc::Rc,
};

mod commit;
mod debug;
mod insert;
mod iterator;
mod lookup;
mod remove;
mod sync;


pub use iterator::TreeIterator;

/// Tree construction options.
#[derive(Clone, Copy, Debug)]
pub struct Options {
    /// Maximum number of nodes resident in the cache; zero means unbounded.
    pub node_capacity: usize,
    /// Maximum total bytes of leaf values resident in the cache; zero means
    /// unbounded.
    pub value_capacity: usize,
}

impl Options {
    /// Explicit cache bounds, zero meaning unbounded on that axis.
    pub fn with_capacity(node_capacity: usize, value_capacity: usize) -> Self {
        Options {
            node_capacity,
            value_capacity,
        }
    }
}

impl Default for Options {
    fn default() -> Self {
        Options {
            node_capacity: DEFAULT_NODE_CAPACITY,
            value_capacity: DEFAULT_VALUE_CAPACITY,
        }
    }
}

/// A Merklized key-value tree handle.
pub struct Tree {
    pub(crate) cache: RefCell<Cache>,
    /// Final effect per key touched since the last commit.
    pub(crate) pending_write_log: RefCell<BTreeMap<Key, Option<Value>>>,
    /// The root the handle was opened with or last committed.
    pub(crate) root: Cell<Option<Root>>,
    closed: Cell<bool>,
}

impl Tree {
    /// Creates an empty tree.
    ///
    /// Without a node database, commits are accepted but discarded; without a
    /// syncer, every cache miss must be answered by the database.
    pub fn new(
        syncer: Option<Rc<dyn ReadSyncer>>,
        ndb: Option<Rc<dyn NodeDB>>,
        options: Options,
    ) -> Tree {
        let ndb = ndb.unwrap_or_else(|| Rc::new(NopNodeDB));
        Tree {
            cache: RefCell::new(Cache::new(
                ndb,
                syncer,
                options.node_capacity,
                options.value_capacity,
            )),
            pending_write_log: RefCell::new(BTreeMap::new()),
            root: Cell::new(None),
            closed: Cell::new(false),
        }
    }

    /// Opens a tree at an existing root.
    ///
    /// With a syncer this is a *remote* tree: it starts out holding nothing
    /// but the root digest and materializes subtrees on demand, verifying
    /// every fetch against `root`.
    pub fn with_root(
        syncer: Option<Rc<dyn ReadSyncer>>,
        ndb: Option<Rc<dyn NodeDB>>,
        root: Root,
        options: Options,
    ) -> Tree {
        let remote = syncer.is_some();
        let tree = Tree::new(syncer, ndb, options);
        {
            let mut cache = tree.cache.borrow_mut();
            if !root.hash.is_empty() {
                cache.pending_root = Some(NodePointer::hash_ptr(root.hash));
            }
            cache.db_root = Some(root);
            if remote {
                cache.sync_root = Some(root);
            }
        }
        tree.root.set(Some(root));
        tree
    }

    /// Looks up a key. Returns `None` when the key is not present.
    pub fn get(&self, key: &[u8]) -> Result<Option<Value>, Error> {
        self.ensure_open()?;
        let mut cache = self.cache.borrow_mut();
        let Some(root_ptr) = cache.pending_root.clone() else {
            return Ok(None);
        };
        lookup::get_path(&mut cache, &root_ptr, 0, key)
    }

    /// Inserts or overwrites a key.
    pub fn insert(&self, key: &[u8], value: &[u8]) -> Result<(), Error> {
        self.ensure_open()?;
        {
            let mut cache = self.cache.borrow_mut();
            let root_ptr = cache.pending_root.clone();
            let new_root = insert::insert_path(&mut cache, root_ptr, 0, key, value)?;
            cache.pending_root = Some(new_root);
        }
        self.pending_write_log
            .borrow_mut()
            .insert(key.to_vec(), Some(value.to_vec()));
        Ok(())
    }

    /// Removes a key. Removing an absent key is a no-op and leaves the
    /// pending write log untouched.
    pub fn remove(&self, key: &[u8]) -> Result<(), Error> {
        self.ensure_open()?;
        let mut changed = false;
        {
            let mut cache = self.cache.borrow_mut();
            if let Some(root_ptr) = cache.pending_root.clone() {
                let (new_root, removed) = remove::remove_path(&mut cache, root_ptr, 0, key)?;
                cache.pending_root = new_root;
                changed = removed;
            }
        }
        if changed {
            self.pending_write_log.borrow_mut().insert(key.to_vec(), None);
        }
        Ok(())
    }

    /// Replays an ordered sequence of write log entries against the tree.
    ///
    /// A single commit afterwards yields a root reflecting the combined
    /// effect.
    pub fn apply_write_log<I>(&self, iter: I) -> Result<(), Error>
    where
        I: IntoIterator<Item = Result<LogEntry, Error>>,
    {
        for entry in iter {
            let entry = entry?;
            match entry.value {
                Some(ref value) => self.insert(&entry.key, value)?,
                None => self.remove(&entry.key)?,
            }
        }
        Ok(())
    }

    /// Commits pending changes, producing the write log of the commit window
    /// and the new root digest.
    pub fn commit(&self, namespace: Namespace, version: u64) -> Result<(WriteLog, Hash), Error> {
        self.ensure_open()?;
        commit::commit(self, namespace, version, None)
    }

    /// Commits pending changes only if the resulting root matches
    /// `expected_root`; fails with [`Error::ExpectedRootMismatch`] otherwise,
    /// leaving nothing persisted.
    pub fn commit_known(&self, expected_root: Root) -> Result<WriteLog, Error> {
        self.ensure_open()?;
        commit::commit(
            self,
            expected_root.namespace,
            expected_root.version,
            Some(expected_root.hash),
        )
        .map(|(log, _)| log)
    }

    /// Fetches all nodes under the given key prefixes from the remote syncer
    /// in a single request, so subsequent reads under those prefixes are
    /// local. A no-op on non-remote trees.
    pub fn prefetch_prefixes(&self, prefixes: &[Key], limit: u16) -> Result<(), Error> {
        self.ensure_open()?;
        self.cache
            .borrow_mut()
            .prefetch_prefixes(prefixes.to_vec(), limit)
    }

    /// Creates an iterator over the tree in key order.
    pub fn iter(&self) -> TreeIterator<'_> {
        TreeIterator::new(self, 0)
    }

    /// Creates an iterator that prefetches `prefetch` leaves per remote
    /// round trip when iterating a remote tree.
    pub fn iter_with_prefetch(&self, prefetch: u16) -> TreeIterator<'_> {
        TreeIterator::new(self, prefetch)
    }

    /// Resident-set counters of the underlying cache.
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.borrow().stats()
    }

    /// Closes the handle and releases all cached state. Idempotent; all
    /// subsequent operations fail with [`Error::Closed`].
    pub fn close(&self) {
        if self.closed.replace(true) {
            return;
        }
        self.cache.borrow_mut().clear();
        self.pending_write_log.borrow_mut().clear();
        self.root.set(None);
    }

    pub(crate) fn ensure_open(&self) -> Result<(), Error> {
        if self.closed.get() {
            return Err(Error::Closed);
        }
        Ok(())
    }
}
