#![doc = include_str!("../README.md")]

pub mod bits;
pub mod constant;
pub mod error;
pub mod hash;
pub mod node;
pub mod types;
pub mod writelog;

mod cache;
pub use cache::CacheStats;

pub mod db;
pub use db::{memory::MemNodeDB, visit, Batch, NodeDB, NopNodeDB};

pub mod sync;
pub use sync::{
    GetPrefixesRequest, GetRequest, IterateRequest, Proof, ProofResponse, ProofVerifier,
    ReadSyncer, StatsCollector,
};

pub mod tree;
pub use tree::{Options, Tree, TreeIterator};

pub use bits::{Depth, Key, Value};
pub use error::Error;
pub use hash::Hash;
pub use types::{Namespace, Root};
pub use writelog::{LogEntry, LogEntryType, WriteLog};

#[cfg(test)]
pub mod fuzz;

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    /// A simple end-to-end test demonstrating the complete workflow: local
    /// writes, commit, finalization, reopening by root, and a verified
    /// remote read through the sync protocol.
    #[test]
    fn end_to_end_workflow() -> Result<(), Error> {
        let ns = Namespace::from_seed(b"mkvs integration test");
        let ndb = Rc::new(MemNodeDB::new(ns));

        // Populate and commit a first version.
        let tree = Rc::new(Tree::new(None, Some(ndb.clone()), Options::default()));
        tree.insert(b"key1", b"value1")?;
        tree.insert(b"key2", b"value2")?;
        let (write_log, root_hash) = tree.commit(ns, 0)?;
        assert_eq!(write_log.len(), 2);
        ndb.finalize(0, &[root_hash])?;

        let root = Root {
            namespace: ns,
            version: 0,
            hash: root_hash,
        };

        // Reopen the committed root from storage.
        let reopened = Tree::with_root(None, Some(ndb.clone()), root, Options::default());
        assert_eq!(reopened.get(b"key1")?.as_deref(), Some(&b"value1"[..]));

        // A remote client holding only the root hash reads through the sync
        // protocol, with every response verified against the root.
        let remote = Tree::with_root(
            Some(tree.clone()),
            None,
            root,
            Options::with_capacity(0, 0),
        );
        assert_eq!(remote.get(b"key2")?.as_deref(), Some(&b"value2"[..]));
        assert_eq!(remote.get(b"absent")?, None);

        Ok(())
    }
}
