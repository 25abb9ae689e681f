//! Remote read synchronization.
//!
//! A [`ReadSyncer`] is the read-only capability exposed by a holder of a tree
//! at a known root. Every request names the root it reads against and every
//! response carries a [`Proof`](proof::Proof) that the caller verifies
//! against that root before trusting a single byte of it. A tree constructed
//! with only a root descriptor and a syncer lazily materializes exactly the
//! subtrees its operations touch.
use crate::{
    bits::{Depth, Key},
    error::Error,
    types::Root,
};
use serde::{Deserialize, Serialize};
use std::{cell::Cell, rc::Rc};

pub mod proof;

pub use proof::{Proof, ProofBuilder, ProofEntry, ProofVerifier};

/// Read-only access to a remote tree with proof-bearing responses.
pub trait ReadSyncer {
    /// Fetches a proof of the value (or absence) of a single key.
    fn sync_get(&self, request: &GetRequest) -> Result<ProofResponse, Error>;

    /// Fetches a proof covering all nodes under any of the given key
    /// prefixes, up to a node limit.
    fn sync_get_prefixes(&self, request: &GetPrefixesRequest) -> Result<ProofResponse, Error>;

    /// Fetches a proof covering the next `prefetch` leaves in key order
    /// starting at a key.
    fn sync_iterate(&self, request: &IterateRequest) -> Result<ProofResponse, Error>;
}

/// Request for a single-key lookup proof.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetRequest {
    /// Root the request reads against.
    pub tree: Root,
    /// Key to prove.
    pub key: Key,
    /// Also include the off-path siblings along the lookup path.
    pub include_siblings: bool,
}

/// Request for a proof covering several key prefixes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetPrefixesRequest {
    /// Root the request reads against.
    pub tree: Root,
    /// Key prefixes to cover.
    pub prefixes: Vec<Key>,
    /// Maximum number of full nodes to include.
    pub limit: u16,
}

/// Request for a proof covering a span of leaves in key order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IterateRequest {
    /// Root the request reads against.
    pub tree: Root,
    /// Key to start at (inclusive).
    pub key: Key,
    /// Number of leaves to cover.
    pub prefetch: Depth,
}

/// Response to any of the three request verbs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofResponse {
    /// The subtree proof; verify before use.
    pub proof: Proof,
}

/// A [`ReadSyncer`] wrapper counting invocations per verb.
///
/// The counters live in [`Cell`]s so a test can keep its own handle to the
/// collector while the tree drives it.
pub struct StatsCollector {
    inner: Rc<dyn ReadSyncer>,
    /// Number of `sync_get` calls.
    pub sync_get_count: Cell<usize>,
    /// Number of `sync_get_prefixes` calls.
    pub sync_get_prefixes_count: Cell<usize>,
    /// Number of `sync_iterate` calls.
    pub sync_iterate_count: Cell<usize>,
}

impl StatsCollector {
    /// Wraps a syncer with zeroed counters.
    pub fn new(inner: Rc<dyn ReadSyncer>) -> Self {
        StatsCollector {
            inner,
            sync_get_count: Cell::new(0),
            sync_get_prefixes_count: Cell::new(0),
            sync_iterate_count: Cell::new(0),
        }
    }
}

impl ReadSyncer for StatsCollector {
    fn sync_get(&self, request: &GetRequest) -> Result<ProofResponse, Error> {
        self.sync_get_count.set(self.sync_get_count.get() + 1);
        self.inner.sync_get(request)
    }

    fn sync_get_prefixes(&self, request: &GetPrefixesRequest) -> Result<ProofResponse, Error> {
        self.sync_get_prefixes_count
            .set(self.sync_get_prefixes_count.get() + 1);
        self.inner.sync_get_prefixes(request)
    }

    fn sync_iterate(&self, request: &IterateRequest) -> Result<ProofResponse, Error> {
        self.sync_iterate_count
            .set(self.sync_iterate_count.get() + 1);
        self.inner.sync_iterate(request)
    }
}
