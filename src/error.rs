//! Crate-wide error type.
use crate::hash::Hash;
use thiserror::Error;

/// Errors surfaced by the tree, the node database and the sync protocol.
#[derive(Debug, Error)]
pub enum Error {
    /// The tree handle has been closed.
    #[error("mkvs: tree is closed")]
    Closed,
    /// The requested root does not exist in the node database.
    #[error("mkvs: root not found")]
    RootNotFound,
    /// The committed root does not directly follow the old root's version.
    #[error("mkvs: new root must follow old root")]
    RootMustFollowOld,
    /// The version has already been finalized.
    #[error("mkvs: version already finalized")]
    AlreadyFinalized,
    /// The version (or a preceding one) has not been finalized yet.
    #[error("mkvs: version not finalized")]
    NotFinalized,
    /// Only the earliest retained version may be pruned.
    #[error("mkvs: version is not the earliest version")]
    NotEarliest,
    /// The namespace differs from the one the node database was opened for.
    #[error("mkvs: bad namespace")]
    BadNamespace,
    /// No stored write log connects the two roots within two commit hops.
    #[error("mkvs: write log not found")]
    WriteLogNotFound,
    /// A node referenced by digest is present in neither the cache, the node
    /// database, nor any reachable syncer.
    #[error("mkvs: node not found: {0}")]
    NodeMissing(Hash),
    /// A proof failed verification or did not contain a required node.
    #[error("mkvs: invalid proof: {0}")]
    ProofInvalid(String),
    /// A persisted or proof-carried node encoding could not be decoded.
    #[error("mkvs: malformed node: {0}")]
    MalformedNode(String),
    /// The root computed by `commit_known` differs from the expected one.
    #[error("mkvs: computed root does not match expected root")]
    ExpectedRootMismatch,
    /// Failure in an underlying transport or storage layer.
    #[error("mkvs: i/o error: {0}")]
    Io(#[from] std::io::Error),
}
