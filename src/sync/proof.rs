//! Compact subtree proofs and their verification.
//!
//! A proof is a preorder walk of a subtree. Nodes the responder chose to
//! include travel as full encodings (compact form for internal nodes, whose
//! children follow structurally); subtrees it elided travel as bare digests;
//! absent children travel as explicit markers. A verifier holding only the
//! expected root digest reconstructs the subtree, recomputes every digest
//! bottom-up and accepts the proof only if the recomputed root matches.
//!
//! Verification is pure: it returns the reconstructed subtree and leaves it
//! to the caller to decide whether to merge it into a cache.
use crate::{
    error::Error,
    hash::Hash,
    node::{NodeBox, NodePointer, NodePtrRef},
};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::{cell::RefCell, rc::Rc};

/// A verifiable encoding of a subtree.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proof {
    /// The root digest the responder claims the proof reconstructs to. Only
    /// trustworthy after verification against a digest known out of band.
    pub untrusted_root: Hash,
    /// Preorder entry stream.
    pub entries: Vec<ProofEntry>,
}

/// One entry of the preorder stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProofEntry {
    /// The child at this position is absent.
    Absent,
    /// The subtree at this position is elided down to its digest.
    Digest(Hash),
    /// A full node encoding: a leaf, or an internal node in compact form
    /// whose left and right children follow as the next entries.
    Node(Vec<u8>),
}

/// Incrementally builds the preorder entry stream of a [`Proof`].
#[derive(Debug)]
pub struct ProofBuilder {
    root: Hash,
    entries: Vec<ProofEntry>,
}

impl ProofBuilder {
    /// Starts a proof claiming to reconstruct to `root`.
    pub fn new(root: Hash) -> Self {
        ProofBuilder {
            root,
            entries: Vec::new(),
        }
    }

    /// Records an absent child.
    pub fn push_absent(&mut self) {
        self.entries.push(ProofEntry::Absent);
    }

    /// Records an elided subtree by digest.
    pub fn push_digest(&mut self, hash: Hash) {
        self.entries.push(ProofEntry::Digest(hash));
    }

    /// Records a full node. Internal nodes are stored compactly; the caller
    /// must follow up with entries for the left and right child.
    pub fn push_node(&mut self, node: &NodeBox) -> Result<(), Error> {
        let data = node.compact_marshal_binary()?;
        self.entries.push(ProofEntry::Node(data));
        Ok(())
    }

    /// Finishes the proof.
    pub fn build(self) -> Proof {
        Proof {
            untrusted_root: self.root,
            entries: self.entries,
        }
    }
}

/// Pure verifier for [`Proof`]s.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProofVerifier;

impl ProofVerifier {
    /// Verifies the proof against an expected root digest.
    ///
    /// On success returns the reconstructed subtree, every node of which is
    /// clean and carries its recomputed digest. `None` means the proof
    /// describes the empty tree.
    pub fn verify_proof(
        &self,
        expected_root: Hash,
        proof: &Proof,
    ) -> Result<Option<NodePtrRef>, Error> {
        if proof.untrusted_root != expected_root {
            return Err(Error::ProofInvalid(format!(
                "unexpected root (expected: {} got: {})",
                expected_root, proof.untrusted_root
            )));
        }

        let mut pos = 0;
        let ptr = self.parse_subtree(proof, &mut pos)?;
        if pos != proof.entries.len() {
            return Err(Error::ProofInvalid("unused proof entries".to_string()));
        }

        let root_hash = hash_subtree(&ptr)?;
        if root_hash != expected_root {
            return Err(Error::ProofInvalid(format!(
                "root hash mismatch (expected: {} got: {})",
                expected_root, root_hash
            )));
        }
        Ok(ptr)
    }

    fn parse_subtree(&self, proof: &Proof, pos: &mut usize) -> Result<Option<NodePtrRef>, Error> {
        let entry = proof
            .entries
            .get(*pos)
            .ok_or_else(|| Error::ProofInvalid("truncated proof".to_string()))?;
        *pos += 1;

        match entry {
            ProofEntry::Absent => Ok(None),
            ProofEntry::Digest(hash) => {
                if hash.is_empty() {
                    return Err(Error::ProofInvalid("digest entry with empty hash".to_string()));
                }
                Ok(Some(NodePointer::hash_ptr(*hash)))
            }
            ProofEntry::Node(data) => {
                let (node, consumed) = NodeBox::compact_unmarshal_binary(data)
                    .map_err(|err| Error::ProofInvalid(err.to_string()))?;
                if consumed != data.len() {
                    return Err(Error::ProofInvalid(
                        "trailing bytes in node entry".to_string(),
                    ));
                }
                let node = match node {
                    NodeBox::Internal(mut n) => {
                        n.left = self.parse_subtree(proof, pos)?;
                        n.right = self.parse_subtree(proof, pos)?;
                        NodeBox::Internal(n)
                    }
                    leaf => leaf,
                };
                Ok(Some(Rc::new(RefCell::new(NodePointer {
                    clean: true,
                    hash: Hash::EMPTY,
                    node: Some(Rc::new(RefCell::new(node))),
                    cache_seq: 0,
                }))))
            }
        }
    }
}

/// Recomputes digests bottom-up over a reconstructed subtree and returns the
/// digest at its root position.
fn hash_subtree(ptr: &Option<NodePtrRef>) -> Result<Hash, Error> {
    let Some(ptr) = ptr else {
        return Ok(Hash::EMPTY);
    };
    let mut ptr = ptr.borrow_mut();
    if let Some(node_ref) = ptr.node.clone() {
        {
            let mut node = node_ref.borrow_mut();
            if let NodeBox::Internal(ref mut n) = *node {
                hash_subtree(&n.left)?;
                hash_subtree(&n.right)?;
            }
            node.update_hash()?;
        }
        ptr.hash = node_ref.borrow().hash();
    }
    Ok(ptr.hash)
}

/// Indexes every resolved node of a verified subtree by digest, so a caller
/// can adopt the subtree matching a pointer it is trying to resolve.
pub(crate) fn index_subtree(root: &Option<NodePtrRef>) -> FxHashMap<Hash, NodePtrRef> {
    let mut index = FxHashMap::default();
    let mut pending: Vec<NodePtrRef> = root.iter().cloned().collect();
    while let Some(ptr) = pending.pop() {
        let hash = ptr.borrow().hash;
        let node = ptr.borrow().node.clone();
        let Some(node) = node else {
            continue;
        };
        index.insert(hash, ptr.clone());
        if let NodeBox::Internal(ref n) = *node.borrow() {
            pending.extend([&n.left, &n.right].into_iter().flatten().cloned());
        };
    }
    index
}
