//! Block structure for the synapse chain.
//!
//! A block header commits to the score submissions it carries and to the
//! aggregated subnet state produced by the latest committed consensus rounds.

use serde::{Deserialize, Serialize};

use crate::merkle::compute_merkle_root;
use crate::submission::ScoreSubmission;
use crate::types::{Address, Epoch, Hash, Hashable, Slot};

/// Current block format version.
pub const BLOCK_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// BlockHeader
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub version: u32,
    /// Hash of the parent header (zero for genesis).
    pub parent_hash: Hash,
    pub height: u64,
    pub epoch: Epoch,
    pub slot: Slot,
    /// Unix timestamp in milliseconds.
    pub timestamp: u64,
    pub proposer: Address,
    /// Merkle root over the replay keys of the carried score submissions.
    pub submissions_root: Hash,
    /// Merkle root over the hashes of the latest committed subnet datums.
    pub aggregated_state_root: Hash,
}

impl Hashable for BlockHeader {
    fn to_hash_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(4 + 32 + 8 * 4 + 32 * 3);
        bytes.extend_from_slice(&self.version.to_le_bytes());
        bytes.extend_from_slice(self.parent_hash.as_bytes());
        bytes.extend_from_slice(&self.height.to_le_bytes());
        bytes.extend_from_slice(&self.epoch.to_le_bytes());
        bytes.extend_from_slice(&self.slot.to_le_bytes());
        bytes.extend_from_slice(&self.timestamp.to_le_bytes());
        bytes.extend_from_slice(self.proposer.as_bytes());
        bytes.extend_from_slice(self.submissions_root.as_bytes());
        bytes.extend_from_slice(self.aggregated_state_root.as_bytes());
        bytes
    }
}

// ---------------------------------------------------------------------------
// BlockBody
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockBody {
    pub score_submissions: Vec<ScoreSubmission>,
}

impl BlockBody {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn compute_submissions_root(&self) -> Hash {
        let leaves: Vec<Hash> = self
            .score_submissions
            .iter()
            .map(ScoreSubmission::replay_key)
            .collect();
        compute_merkle_root(&leaves)
    }

    pub fn len(&self) -> usize {
        self.score_submissions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.score_submissions.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Block
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub body: BlockBody,
}

impl Block {
    /// Build a block, computing the submissions root from the body.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        parent_hash: Hash,
        height: u64,
        epoch: Epoch,
        slot: Slot,
        timestamp: u64,
        proposer: Address,
        body: BlockBody,
        aggregated_state_root: Hash,
    ) -> Self {
        let header = BlockHeader {
            version: BLOCK_VERSION,
            parent_hash,
            height,
            epoch,
            slot,
            timestamp,
            proposer,
            submissions_root: body.compute_submissions_root(),
            aggregated_state_root,
        };
        Self { header, body }
    }

    /// Genesis block: height 0, zero parent, empty body.
    pub fn genesis(proposer: Address, timestamp: u64) -> Self {
        Self::new(
            Hash::zero(),
            0,
            0,
            0,
            timestamp,
            proposer,
            BlockBody::empty(),
            Hash::zero(),
        )
    }

    pub fn block_hash(&self) -> Hash {
        self.header.hash()
    }

    pub fn verify_merkle_roots(&self) -> bool {
        self.header.submissions_root == self.body.compute_submissions_root()
    }
}

impl Hashable for Block {
    fn to_hash_bytes(&self) -> Vec<u8> {
        self.header.to_hash_bytes()
    }
}

/// Merkle root over committed datum hashes, for `aggregated_state_root`.
pub fn aggregated_state_root(datum_hashes: &[Hash]) -> Hash {
    compute_merkle_root(datum_hashes)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
