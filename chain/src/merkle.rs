//! Binary SHA-256 Merkle trees with inclusion proofs.
//!
//! Level construction pairs adjacent nodes left to right; an odd trailing
//! node is paired with itself. The root of an empty list is the zero hash and
//! the root of a single leaf is the leaf itself.

use serde::{Deserialize, Serialize};

use crate::types::Hash;

fn hash_pair(left: &Hash, right: &Hash) -> Hash {
    let mut data = Vec::with_capacity(64);
    data.extend_from_slice(left.as_bytes());
    data.extend_from_slice(right.as_bytes());
    Hash::compute(&data)
}

fn next_level(level: &[Hash]) -> Vec<Hash> {
    level
        .chunks(2)
        .map(|chunk| match chunk {
            [left, right] => hash_pair(left, right),
            // Odd element: hash with itself
            [single] => hash_pair(single, single),
            _ => unreachable!("chunks(2) yields one or two elements"),
        })
        .collect()
}

/// Compute a merkle root from a list of leaf hashes.
pub fn compute_merkle_root(leaves: &[Hash]) -> Hash {
    if leaves.is_empty() {
        return Hash::zero();
    }

    let mut current_level: Vec<Hash> = leaves.to_vec();
    while current_level.len() > 1 {
        current_level = next_level(&current_level);
    }

    current_level.into_iter().next().unwrap_or_else(Hash::zero)
}

/// Which side of the running hash a sibling sits on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Left,
    Right,
}

/// One level of an inclusion proof.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofStep {
    pub sibling: Hash,
    pub side: Side,
}

/// Inclusion proof for a single leaf.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    pub leaf_index: usize,
    pub path: Vec<ProofStep>,
}

impl MerkleProof {
    /// Fold the proof path over `leaf` and return the implied root.
    pub fn compute_root(&self, leaf: &Hash) -> Hash {
        self.path.iter().fold(leaf.clone(), |acc, step| match step.side {
            Side::Left => hash_pair(&step.sibling, &acc),
            Side::Right => hash_pair(&acc, &step.sibling),
        })
    }

    /// Check that `leaf` is included under `root`.
    pub fn verify(&self, leaf: &Hash, root: &Hash) -> bool {
        &self.compute_root(leaf) == root
    }
}

/// Build the inclusion proof for `leaves[index]`. Returns `None` when the
/// index is out of range.
pub fn build_proof(leaves: &[Hash], index: usize) -> Option<MerkleProof> {
    if index >= leaves.len() {
        return None;
    }

    let mut path = Vec::new();
    let mut level: Vec<Hash> = leaves.to_vec();
    let mut position = index;

    while level.len() > 1 {
        let step = if position % 2 == 1 {
            ProofStep {
                sibling: level[position - 1].clone(),
                side: Side::Left,
            }
        } else {
            // Last odd node is paired with itself.
            let sibling = level.get(position + 1).unwrap_or(&level[position]).clone();
            ProofStep {
                sibling,
                side: Side::Right,
            }
        };
        path.push(step);
        level = next_level(&level);
        position /= 2;
    }

    Some(MerkleProof {
        leaf_index: index,
        path,
    })
}
