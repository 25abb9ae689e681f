//! End-to-end randomized testing for the tree and node database.
//!
//! Simulates the life of a versioned store: blocks of state operations are
//! applied both to a [`Tree`] and to a `BTreeMap` reference oracle, each
//! block is committed as its own version and finalized, and correctness is
//! checked from several angles:
//!
//! - **State consistency**: every lookup and a full in-order iteration match
//!   the oracle after every block.
//! - **Write-log consistency**: the write log stored by the node database
//!   for each commit replays to the same root on a fresh handle.
//! - **Durability**: after all blocks, a fresh handle opened at the final
//!   root sees exactly the oracle's contents.
use crate::{
    tree::{Options, Tree},
    types::{Namespace, Root},
    writelog::static_iterator,
    MemNodeDB, NodeDB,
};
use std::{collections::BTreeMap, rc::Rc};

/// A state operation produced by the driver.
///
/// Operations reference keys via indices into a pre-generated KV pool, so
/// the driver can focus on operation sequences rather than key generation.
#[derive(Debug, Clone)]
pub enum Operation {
    /// Inserts or updates the key at pool index with a single-byte value.
    Insert(u16, u8),
    /// Removes the key at pool index.
    Delete(u16),
}

/// A block of operations committed as one version.
#[derive(Debug, Clone)]
pub struct Block {
    /// Operations applied in order before the block's commit.
    pub operations: Vec<Operation>,
}

const KV_POOL_SIZE: usize = 512;

fn kv_pool() -> Vec<Vec<u8>> {
    (0..KV_POOL_SIZE)
        .map(|i| format!("key_{i:05x}").into_bytes())
        .collect()
}

/// Main end-to-end driver.
pub fn e2e_consistency_test(blocks: &[Block]) {
    let ns = Namespace::from_seed(b"mkvs fuzz test ns");
    let ndb = Rc::new(MemNodeDB::new(ns));
    let pool = kv_pool();

    let tree = Tree::new(None, Some(ndb.clone()), Options::default());
    let mut oracle: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
    let mut prev_root = Root::empty(ns, 0);

    for (version, block) in blocks.iter().enumerate() {
        let version = version as u64;

        let mut expected_log: BTreeMap<Vec<u8>, Option<Vec<u8>>> = BTreeMap::new();
        for op in &block.operations {
            match *op {
                Operation::Insert(idx, value) => {
                    let key = &pool[idx as usize % pool.len()];
                    let value = vec![value];
                    tree.insert(key, &value).expect("insert");
                    oracle.insert(key.clone(), value.clone());
                    expected_log.insert(key.clone(), Some(value));
                }
                Operation::Delete(idx) => {
                    let key = &pool[idx as usize % pool.len()];
                    tree.remove(key).expect("remove");
                    // Deleting an absent key leaves no trace in the log.
                    if oracle.remove(key).is_some() {
                        expected_log.insert(key.clone(), None);
                    }
                }
            }
        }

        let (write_log, root_hash) = tree.commit(ns, version).expect("commit");
        let root = Root {
            namespace: ns,
            version,
            hash: root_hash,
        };

        // The stored write log replays the old root to the new root. This
        // runs before finalization, which would reject further commits into
        // the version.
        let stored: Vec<_> = ndb
            .get_write_log(&prev_root, &root)
            .expect("get_write_log")
            .collect::<Result<_, _>>()
            .expect("write log iteration");
        let replay = Tree::with_root(None, Some(ndb.clone()), prev_root, Options::default());
        replay
            .apply_write_log(static_iterator(stored))
            .expect("apply_write_log");
        let replayed = replay.commit_known(root).map(|_| ());
        assert!(replayed.is_ok(), "write log replay diverged: {replayed:?}");
        let logged: BTreeMap<Vec<u8>, Option<Vec<u8>>> = write_log
            .iter()
            .map(|entry| (entry.key.clone(), entry.value.clone()))
            .collect();
        assert_eq!(logged, expected_log, "write log mismatch at version {version}");

        ndb.finalize(version, &[root_hash]).expect("finalize");

        // Lookups match the oracle, including keys the block deleted.
        for key in &pool {
            assert_eq!(
                tree.get(key).expect("get"),
                oracle.get(key).cloned(),
                "lookup mismatch for {:?}",
                String::from_utf8_lossy(key)
            );
        }

        // A full iteration yields exactly the oracle, in order.
        let mut it = tree.iter();
        it.rewind();
        let mut iterated = Vec::new();
        while it.is_valid() {
            iterated.push((it.key().unwrap().clone(), it.value().unwrap().clone()));
            it.next();
        }
        assert!(it.error().is_none(), "iteration error: {:?}", it.error());
        let expected: Vec<_> = oracle
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        assert_eq!(iterated, expected, "iteration mismatch at version {version}");

        prev_root = root;
    }

    // Durability: a fresh handle over the final root sees the oracle.
    let reopened = Tree::with_root(None, Some(ndb.clone()), prev_root, Options::default());
    for (key, value) in &oracle {
        assert_eq!(
            reopened.get(key).expect("get").as_deref(),
            Some(value.as_slice()),
            "reopened lookup mismatch"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    #[test]
    fn test_empty_blocks() {
        e2e_consistency_test(&[]);
    }

    #[test]
    fn test_single_insert() {
        e2e_consistency_test(&[Block {
            operations: vec![Operation::Insert(0, 42)],
        }]);
    }

    #[test]
    fn test_insert_delete() {
        e2e_consistency_test(&[
            Block {
                operations: vec![Operation::Insert(0, 42)],
            },
            Block {
                operations: vec![Operation::Delete(0)],
            },
        ]);
    }

    #[test]
    fn test_random_blocks() {
        let mut rng = StdRng::seed_from_u64(0xdecaf_bad);
        let blocks: Vec<Block> = (0..8)
            .map(|_| {
                let operations = (0..rng.gen_range(1..200))
                    .map(|_| {
                        if rng.gen_bool(0.7) {
                            Operation::Insert(rng.gen(), rng.gen())
                        } else {
                            Operation::Delete(rng.gen())
                        }
                    })
                    .collect();
                Block { operations }
            })
            .collect();
        e2e_consistency_test(&blocks);
    }
}
